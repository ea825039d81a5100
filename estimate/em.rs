//! # EM Driver
//!
//! `run_em` is the single outer loop shared by every optimizer. A strategy only
//! supplies the M-step; the driver owns the E-step, the convergence trace, the
//! iteration cap and the cancellation hook.
//!
//! One iteration is:
//! 1. Ask the observer whether to continue.
//! 2. `strategy.update` maps the current parameters and E-step to new parameters.
//! 3. Re-run the E-step at the new parameters and record the log-likelihood.
//! 4. Ask the strategy whether the change means convergence.
//!
//! A failure in step 2 or 3 ends the run with `RunStatus::Failed`. The parameters
//! and E-step returned are then the last ones with a valid log-likelihood.

use crate::data::{DataError, Observations};
use crate::likelihood::{EStep, e_step};
use crate::model::{FitConfig, Parameters};
use crate::mstep::MStep;
use crate::trace::ConvergenceTrace;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// A comprehensive error type for estimation failures.
#[derive(Error, Debug)]
pub enum EstimationError {
    #[error(
        "Unit {unit} has zero probability under every latent class. The responsibilities are undefined."
    )]
    DegenerateResponsibility { unit: usize },

    #[error("The log-likelihood is undefined: {detail}")]
    UndefinedLikelihood { detail: String },

    #[error("The Newton system for the prior coefficients is singular or ill-conditioned: {0}")]
    SingularHessian(String),

    #[error("The multinomial logit fit failed: {0}")]
    SingularFit(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),

    #[error("Data error: {0}")]
    Data(#[from] DataError),
}

/// The failure categories reported per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    DegenerateResponsibility,
    UndefinedLikelihood,
    NonConvergence,
    SingularFit,
}

impl EstimationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EstimationError::DegenerateResponsibility { .. } => FailureKind::DegenerateResponsibility,
            EstimationError::UndefinedLikelihood { .. } | EstimationError::SingularHessian(_) => {
                FailureKind::UndefinedLikelihood
            }
            EstimationError::SingularFit(_) => FailureKind::SingularFit,
            // Rejected before a run starts; they only surface here if a caller
            // feeds mismatched inputs to a strategy directly.
            EstimationError::InvalidConfiguration(_)
            | EstimationError::DimensionMismatch(_)
            | EstimationError::Data(_) => FailureKind::UndefinedLikelihood,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    Converged,
    /// The iteration cap was reached first. Counted as non-convergence, not a failure.
    MaxIterationsReached,
    /// An observer asked the run to stop.
    Cancelled,
    Failed {
        kind: FailureKind,
        iteration: usize,
        message: String,
    },
}

impl RunStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, RunStatus::Failed { .. })
    }

    /// The failure category of this outcome. A run stopped by the cap is
    /// `NonConvergence` without being a failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            RunStatus::Failed { kind, .. } => Some(*kind),
            RunStatus::MaxIterationsReached => Some(FailureKind::NonConvergence),
            RunStatus::Converged | RunStatus::Cancelled => None,
        }
    }

    pub fn failed(error: &EstimationError, iteration: usize) -> Self {
        RunStatus::Failed {
            kind: error.kind(),
            iteration,
            message: error.to_string(),
        }
    }
}

/// Decision returned by an observer at an iteration boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationControl {
    Continue,
    Stop,
}

/// Hook consulted before every iteration.
pub trait IterationObserver {
    fn on_iteration(&mut self, completed: usize, log_likelihood: f64) -> IterationControl {
        let _ = (completed, log_likelihood);
        IterationControl::Continue
    }
}

pub struct NoopObserver;

impl IterationObserver for NoopObserver {}

/// Stops a run once a wall-clock deadline has passed.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }
}

impl IterationObserver for Deadline {
    fn on_iteration(&mut self, completed: usize, log_likelihood: f64) -> IterationControl {
        let _ = log_likelihood;
        if Instant::now() >= self.at {
            log::warn!("Time budget exhausted after {completed} iterations");
            IterationControl::Stop
        } else {
            IterationControl::Continue
        }
    }
}

/// A shared flag that cancels every run observing it.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl IterationObserver for CancellationFlag {
    fn on_iteration(&mut self, completed: usize, log_likelihood: f64) -> IterationControl {
        let _ = (completed, log_likelihood);
        if self.is_cancelled() {
            IterationControl::Stop
        } else {
            IterationControl::Continue
        }
    }
}

impl<A: IterationObserver, B: IterationObserver> IterationObserver for (A, B) {
    fn on_iteration(&mut self, completed: usize, log_likelihood: f64) -> IterationControl {
        match self.0.on_iteration(completed, log_likelihood) {
            IterationControl::Stop => IterationControl::Stop,
            IterationControl::Continue => self.1.on_iteration(completed, log_likelihood),
        }
    }
}

impl<T: IterationObserver> IterationObserver for Option<T> {
    fn on_iteration(&mut self, completed: usize, log_likelihood: f64) -> IterationControl {
        match self {
            Some(inner) => inner.on_iteration(completed, log_likelihood),
            None => IterationControl::Continue,
        }
    }
}

impl<T: IterationObserver + ?Sized> IterationObserver for &mut T {
    fn on_iteration(&mut self, completed: usize, log_likelihood: f64) -> IterationControl {
        (**self).on_iteration(completed, log_likelihood)
    }
}

/// Final state of one EM run.
#[derive(Debug, Clone)]
pub struct EmOutcome {
    /// Last parameters with a valid log-likelihood.
    pub parameters: Parameters,
    /// E-step at `parameters`; `None` only if the starting point itself was invalid.
    pub estep: Option<EStep>,
    pub trace: ConvergenceTrace,
    pub status: RunStatus,
}

impl EmOutcome {
    pub fn log_likelihood(&self) -> Option<f64> {
        self.estep.as_ref().map(|e| e.log_likelihood)
    }
}

/// Runs EM from `initial` with the given M-step until convergence, the cap, a
/// failure or a stop request.
pub fn run_em<S, O>(
    strategy: &mut S,
    initial: Parameters,
    data: &Observations,
    config: &FitConfig,
    mut observer: O,
) -> EmOutcome
where
    S: MStep + ?Sized,
    O: IterationObserver,
{
    let mut trace = ConvergenceTrace::new(config.max_iterations, config.decrease_tolerance);
    let mut estep = match e_step(&initial, data) {
        Ok(estep) => estep,
        Err(e) => {
            log::warn!("Starting point is invalid: {e}");
            return EmOutcome {
                parameters: initial,
                estep: None,
                trace,
                status: RunStatus::failed(&e, 0),
            };
        }
    };
    trace.set_baseline(estep.log_likelihood);
    let mut params = initial;

    let fail = |params: Parameters,
                estep: EStep,
                trace: ConvergenceTrace,
                iteration: usize,
                e: EstimationError| {
        log::debug!("EM stopped at iteration {iteration}: {e}");
        EmOutcome {
            parameters: params,
            estep: Some(estep),
            trace,
            status: RunStatus::failed(&e, iteration),
        }
    };

    for iteration in 1..=config.max_iterations {
        if observer.on_iteration(iteration - 1, estep.log_likelihood) == IterationControl::Stop {
            log::info!("EM cancelled after {} iterations", iteration - 1);
            return EmOutcome {
                parameters: params,
                estep: Some(estep),
                trace,
                status: RunStatus::Cancelled,
            };
        }

        let next = match strategy.update(&params, &estep, data) {
            Ok(next) => next,
            Err(e) => return fail(params, estep, trace, iteration, e),
        };
        let next_estep = match e_step(&next, data) {
            Ok(next_estep) => next_estep,
            Err(e) => return fail(params, estep, trace, iteration, e),
        };
        // The trace holds exactly `max_iterations` values, so a full trace is the cap.
        let Ok(change) = trace.record(next_estep.log_likelihood) else {
            break;
        };
        params = next;
        estep = next_estep;

        log::debug!(
            "[EM iter #{iteration:>4}] log-likelihood: {:.10} | change: {change:+.4e}",
            estep.log_likelihood
        );

        if strategy.has_converged(change, config.convergence_tolerance, iteration) {
            log::debug!("EM converged after {iteration} iterations");
            return EmOutcome {
                parameters: params,
                estep: Some(estep),
                trace,
                status: RunStatus::Converged,
            };
        }
    }

    log::debug!(
        "EM reached the cap of {} iterations without converging",
        config.max_iterations
    );
    EmOutcome {
        parameters: params,
        estep: Some(estep),
        trace,
        status: RunStatus::MaxIterationsReached,
    }
}
