//! # Run Harness
//!
//! A run is a pure function of `(algorithm, seed, data, config)`. Nothing is
//! shared between runs except read-only references to the data and the
//! configuration, so a batch is an ordered parallel map over its `RunSpec`s and
//! gives the same results regardless of thread count or scheduling.

use crate::augmented::Nested;
use crate::data::Observations;
use crate::em::{
    CancellationFlag, Deadline, EstimationError, IterationObserver, NoopObserver, RunStatus,
    run_em,
};
use crate::hybrid::Hybrid;
use crate::model::{Algorithm, FitConfig, Parameters};
use crate::mstep::MStep;
use crate::newton::NewtonRaphson;
use crate::seeding::initial_parameters;
use crate::three_step::{ThreeStepVariant, run_three_step};
use crate::trace::ConvergenceTrace;
use itertools::iproduct;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One unit of work: an algorithm started from one seed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub algorithm: Algorithm,
    pub seed: u64,
}

impl RunSpec {
    pub fn new(algorithm: Algorithm, seed: u64) -> Self {
        Self { algorithm, seed }
    }

    /// Every algorithm paired with every seed, algorithms outermost.
    pub fn grid(algorithms: &[Algorithm], seeds: &[u64]) -> Vec<RunSpec> {
        iproduct!(algorithms.iter(), seeds.iter())
            .map(|(&algorithm, &seed)| RunSpec { algorithm, seed })
            .collect()
    }
}

/// Everything recorded about one finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub algorithm: Algorithm,
    pub seed: u64,
    pub status: RunStatus,
    pub iterations: usize,
    pub trace: ConvergenceTrace,
    /// `None` when the run failed; otherwise the log-likelihood at `parameters`.
    pub final_log_likelihood: Option<f64>,
    pub parameters: Parameters,
    pub switched_at: Option<usize>,
    pub elapsed: Duration,
}

impl RunResult {
    pub fn is_failed(&self) -> bool {
        self.status.is_failed()
    }

    pub fn decrease_count(&self) -> usize {
        self.trace.decrease_count()
    }
}

/// The M-step behind a one-step algorithm; `None` for the three-step pipelines.
fn one_step_strategy(algorithm: Algorithm) -> Option<Box<dyn MStep>> {
    match algorithm {
        Algorithm::NewtonRaphson { damping } => Some(Box::new(NewtonRaphson::new(damping))),
        Algorithm::Nested => Some(Box::new(Nested)),
        Algorithm::Hybrid {
            switch_threshold,
            damping,
        } => Some(Box::new(Hybrid::new(
            Nested,
            NewtonRaphson::new(damping),
            switch_threshold,
        ))),
        Algorithm::ThreeStepClassical | Algorithm::ThreeStepCorrected => None,
    }
}

/// Checks everything that would make every run of a batch fail the same way.
fn validate(
    algorithm: Algorithm,
    data: &Observations,
    config: &FitConfig,
) -> Result<(), EstimationError> {
    config.validate()?;
    algorithm.validate()?;
    if data.num_units() < config.num_classes {
        return Err(EstimationError::InvalidConfiguration(format!(
            "{} units cannot support {} latent classes",
            data.num_units(),
            config.num_classes
        )));
    }
    Ok(())
}

/// Runs one algorithm from one seed.
pub fn run_one(
    spec: RunSpec,
    data: &Observations,
    config: &FitConfig,
) -> Result<RunResult, EstimationError> {
    run_one_observed(spec, data, config, &mut NoopObserver)
}

/// Runs one algorithm from one seed, consulting `observer` before every iteration.
///
/// Errors are returned only for invalid inputs; numerical failures during the
/// run are reported through `RunResult::status`.
pub fn run_one_observed(
    spec: RunSpec,
    data: &Observations,
    config: &FitConfig,
    observer: &mut dyn IterationObserver,
) -> Result<RunResult, EstimationError> {
    validate(spec.algorithm, data, config)?;
    let start = Instant::now();
    let initial = initial_parameters(data, config, spec.seed)?;
    let deadline = config
        .time_budget_secs
        .map(|secs| Deadline::after(Duration::from_secs_f64(secs)));
    let observer = (deadline, observer);

    let (outcome, switched_at) = match one_step_strategy(spec.algorithm) {
        Some(mut strategy) => {
            let outcome = run_em(&mut strategy, initial, data, config, observer);
            (outcome, strategy.switched_at())
        }
        None => {
            let variant = if spec.algorithm == Algorithm::ThreeStepCorrected {
                ThreeStepVariant::Corrected
            } else {
                ThreeStepVariant::Classical
            };
            let outcome = run_three_step(variant, initial.item_probs, data, config, observer);
            (outcome, None)
        }
    };

    let final_log_likelihood = if outcome.status.is_failed() {
        None
    } else {
        outcome.log_likelihood()
    };
    let result = RunResult {
        algorithm: spec.algorithm,
        seed: spec.seed,
        iterations: outcome.trace.len(),
        status: outcome.status,
        trace: outcome.trace,
        final_log_likelihood,
        parameters: outcome.parameters,
        switched_at,
        elapsed: start.elapsed(),
    };
    log::debug!(
        "Run {} seed {} finished: {:?} after {} iterations, log-likelihood {:?}",
        result.algorithm,
        result.seed,
        result.status,
        result.iterations,
        result.final_log_likelihood
    );
    Ok(result)
}

/// Runs every `RunSpec` on the rayon pool. Results come back in the order of `specs`.
pub fn run_batch(
    specs: &[RunSpec],
    data: &Observations,
    config: &FitConfig,
) -> Result<Vec<RunResult>, EstimationError> {
    run_batch_with_progress(specs, data, config, &CancellationFlag::new(), |_| {})
}

/// As [`run_batch`], calling `on_finished` as each run completes and stopping
/// every unfinished run once `cancel` is set.
pub fn run_batch_with_progress<F>(
    specs: &[RunSpec],
    data: &Observations,
    config: &FitConfig,
    cancel: &CancellationFlag,
    on_finished: F,
) -> Result<Vec<RunResult>, EstimationError>
where
    F: Fn(&RunResult) + Sync,
{
    for spec in specs {
        validate(spec.algorithm, data, config)?;
    }
    log::info!(
        "Running {} fits on {} threads",
        specs.len(),
        rayon::current_num_threads()
    );
    specs
        .par_iter()
        .map(|&spec| {
            let mut observer = cancel.clone();
            let result = run_one_observed(spec, data, config, &mut observer)?;
            on_finished(&result);
            Ok(result)
        })
        .collect()
}
