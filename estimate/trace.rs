//! Log-likelihood bookkeeping for a single run.

use ndarray::Array1;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Convergence trace is full: capacity of {capacity} iterations reached.")]
pub struct TraceFull {
    pub capacity: usize,
}

/// The log-likelihood after every EM iteration of one run, capped at a fixed capacity.
///
/// The value before the first iteration is kept separately as the baseline, so
/// `len()` is the number of completed iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceTrace {
    capacity: usize,
    decrease_tolerance: f64,
    baseline: Option<f64>,
    log_likelihoods: Vec<f64>,
    decreases: Vec<bool>,
}

impl ConvergenceTrace {
    pub fn new(capacity: usize, decrease_tolerance: f64) -> Self {
        Self {
            capacity,
            decrease_tolerance,
            baseline: None,
            log_likelihoods: Vec::with_capacity(capacity.min(1024)),
            decreases: Vec::with_capacity(capacity.min(1024)),
        }
    }

    pub fn set_baseline(&mut self, log_likelihood: f64) {
        self.baseline = Some(log_likelihood);
    }

    /// Appends the log-likelihood of a completed iteration and returns the change
    /// from the previous value (or from the baseline for the first iteration).
    pub fn record(&mut self, log_likelihood: f64) -> Result<f64, TraceFull> {
        if self.is_full() {
            return Err(TraceFull {
                capacity: self.capacity,
            });
        }
        let previous = self.last().or(self.baseline);
        let (change, decreased) = match previous {
            Some(prev) => (
                log_likelihood - prev,
                log_likelihood < prev - self.decrease_tolerance,
            ),
            None => (f64::INFINITY, false),
        };
        self.log_likelihoods.push(log_likelihood);
        self.decreases.push(decreased);
        Ok(change)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.log_likelihoods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log_likelihoods.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    pub fn last(&self) -> Option<f64> {
        self.log_likelihoods.last().copied()
    }

    pub fn log_likelihoods(&self) -> &[f64] {
        &self.log_likelihoods
    }

    pub fn decreases(&self) -> &[bool] {
        &self.decreases
    }

    pub fn decrease_count(&self) -> usize {
        self.decreases.iter().filter(|&&d| d).count()
    }

    pub fn has_decrease(&self) -> bool {
        self.decreases.contains(&true)
    }

    /// The trace at full capacity, with unused slots set to NaN.
    pub fn padded(&self) -> Array1<f64> {
        let mut out = Array1::from_elem(self.capacity, f64::NAN);
        for (slot, &value) in out.iter_mut().zip(&self.log_likelihoods) {
            *slot = value;
        }
        out
    }

    /// Decrease flags at full capacity, with unused slots set to `false`.
    pub fn padded_decreases(&self) -> Vec<bool> {
        let mut out = self.decreases.clone();
        out.resize(self.capacity, false);
        out
    }
}
