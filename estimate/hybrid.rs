//! Hybrid controller: a stable strategy far from the optimum, a fast one near it.

use crate::data::Observations;
use crate::em::EstimationError;
use crate::likelihood::EStep;
use crate::model::Parameters;
use crate::mstep::MStep;
use serde::{Deserialize, Serialize};

/// Stage of the hybrid controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HybridState {
    /// Running the ascent-safe update.
    Augmented,
    /// Running the fast local update.
    Newton,
    Converged,
}

/// Runs `early` until the log-likelihood improvement falls below the switch
/// threshold, then hands over to `late` until the convergence tolerance is met.
///
/// The switch test comes before the convergence test, so an iteration whose
/// change is below both thresholds only switches; the run is declared converged
/// by the late strategy.
#[derive(Debug, Clone)]
pub struct Hybrid<A, B> {
    early: A,
    late: B,
    switch_threshold: f64,
    state: HybridState,
    switched_at: Option<usize>,
}

impl<A: MStep, B: MStep> Hybrid<A, B> {
    pub fn new(early: A, late: B, switch_threshold: f64) -> Self {
        Self {
            early,
            late,
            switch_threshold,
            state: HybridState::Augmented,
            switched_at: None,
        }
    }

    pub fn state(&self) -> HybridState {
        self.state
    }
}

impl<A: MStep, B: MStep> MStep for Hybrid<A, B> {
    fn update(
        &mut self,
        params: &Parameters,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Parameters, EstimationError> {
        match self.state {
            HybridState::Augmented => self.early.update(params, estep, data),
            HybridState::Newton | HybridState::Converged => self.late.update(params, estep, data),
        }
    }

    fn has_converged(&mut self, change: f64, tolerance: f64, iteration: usize) -> bool {
        match self.state {
            HybridState::Augmented => {
                if change.abs() < self.switch_threshold {
                    log::debug!(
                        "Hybrid switching to the fast update at iteration {iteration} (change {change:.3e})"
                    );
                    self.state = HybridState::Newton;
                    self.switched_at = Some(iteration);
                }
                false
            }
            HybridState::Newton => {
                if self.late.has_converged(change, tolerance, iteration) {
                    self.state = HybridState::Converged;
                    true
                } else {
                    false
                }
            }
            HybridState::Converged => true,
        }
    }

    fn switched_at(&self) -> Option<usize> {
        self.switched_at
    }
}
