//! # Three-step Estimation
//!
//! The measurement model and the structural model are fitted separately:
//! 1. A covariate-free latent class model is fitted by plain EM with the exact
//!    closed-form prior update, so this stage ascends monotonically.
//! 2. Every unit is assigned to its modal class. The classification-error matrix
//!    `D[c, r] = sum_i w_ic 1[y_i = r] / sum_i w_ic` records how often units that
//!    truly belong to class `c` end up assigned to class `r`.
//! 3. The assigned labels are regressed on the covariates. The classical variant
//!    treats them as error-free; the corrected variant fits a one-item latent
//!    class model whose single item is the label and whose table is pinned to `D`.
//!
//! The pipeline reports the full-model log-likelihood at the Step-1 tables and
//! the Step-3 coefficients. Steps 1 and 3 optimize different objectives, so that
//! combination is generally not the joint maximum.

use crate::data::Observations;
use crate::em::{EmOutcome, EstimationError, IterationObserver, RunStatus, run_em};
use crate::likelihood::{EStep, e_step, modal_assignment};
use crate::logit::{fit_multinomial_logit, one_hot};
use crate::model::{FitConfig, Parameters};
use crate::mstep::{ClosedFormPrior, MStep};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreeStepVariant {
    Classical,
    Corrected,
}

/// `R x R` matrix of assignment probabilities; rows are true classes.
///
/// A class with no posterior weight at all gets a uniform row.
pub fn classification_error_matrix(
    responsibilities: ArrayView2<f64>,
    assignments: ArrayView1<usize>,
) -> Array2<f64> {
    let num_classes = responsibilities.ncols();
    let mut matrix = Array2::<f64>::zeros((num_classes, num_classes));
    for (w, &assigned) in responsibilities.axis_iter(Axis(0)).zip(assignments.iter()) {
        let mut column = matrix.column_mut(assigned);
        column += &w;
    }
    for mut row in matrix.axis_iter_mut(Axis(0)) {
        let total = row.sum();
        if total > 0.0 {
            row.mapv_inplace(|v| v / total);
        } else {
            row.fill(1.0 / num_classes as f64);
        }
    }
    matrix
}

/// M-step that keeps the tables fixed and refits the coefficients exactly.
///
/// Each call solves the weighted multinomial logit of the current
/// responsibilities on the covariates, warm-started at the current coefficients.
#[derive(Debug, Clone, Copy)]
pub struct FixedTables {
    pub logit_max_iterations: usize,
    pub logit_tolerance: f64,
}

impl MStep for FixedTables {
    fn update(
        &mut self,
        params: &Parameters,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Parameters, EstimationError> {
        let fit = fit_multinomial_logit(
            data.covariates(),
            estep.responsibilities.view(),
            Some(params.beta.view()),
            self.logit_max_iterations,
            self.logit_tolerance,
        )
        .map_err(as_singular_fit)?;
        Ok(Parameters {
            item_probs: params.item_probs.clone(),
            beta: fit.beta,
        })
    }
}

fn as_singular_fit(error: EstimationError) -> EstimationError {
    match error {
        EstimationError::SingularFit(msg) => EstimationError::SingularFit(msg),
        other => EstimationError::SingularFit(other.to_string()),
    }
}

/// Step-3 coefficients, together with whether the step hit its iteration cap.
fn structural_step<O: IterationObserver>(
    variant: ThreeStepVariant,
    responsibilities: ArrayView2<f64>,
    data: &Observations,
    config: &FitConfig,
    observer: O,
) -> Result<(Array2<f64>, RunStatus), EstimationError> {
    let num_classes = responsibilities.ncols();
    let assignments = modal_assignment(responsibilities);
    match variant {
        ThreeStepVariant::Classical => {
            let targets = one_hot(assignments.view(), num_classes);
            let fit = fit_multinomial_logit(
                data.covariates(),
                targets.view(),
                None,
                config.logit_max_iterations,
                config.logit_tolerance,
            )
            .map_err(as_singular_fit)?;
            log::debug!("Classical Step 3 converged in {} iterations", fit.iterations);
            Ok((fit.beta, RunStatus::Converged))
        }
        ThreeStepVariant::Corrected => {
            let error_matrix = classification_error_matrix(responsibilities, assignments.view());
            log::debug!("Classification-error matrix:\n{error_matrix:.4}");
            let labels = Observations::new(
                assignments.insert_axis(Axis(1)),
                vec![num_classes],
                data.covariates().to_owned(),
            )?;
            let start = Parameters {
                item_probs: vec![error_matrix],
                beta: Array2::zeros((data.num_covariates(), num_classes)),
            };
            let mut strategy = FixedTables {
                logit_max_iterations: config.logit_max_iterations,
                logit_tolerance: config.logit_tolerance,
            };
            let outcome = run_em(&mut strategy, start, &labels, config, observer);
            match outcome.status {
                RunStatus::Failed { message, .. } => Err(EstimationError::SingularFit(message)),
                status => Ok((outcome.parameters.beta, status)),
            }
        }
    }
}

/// Runs the full three-step pipeline from the given Step-1 tables.
///
/// The returned trace is the Step-1 trace, and the E-step is evaluated for the
/// full model at the Step-1 tables and Step-3 coefficients.
pub fn run_three_step<O: IterationObserver>(
    variant: ThreeStepVariant,
    initial_tables: Vec<Array2<f64>>,
    data: &Observations,
    config: &FitConfig,
    mut observer: O,
) -> EmOutcome {
    let num_classes = config.num_classes;
    let measurement_data = data.intercept_only();
    let start = Parameters {
        item_probs: initial_tables,
        beta: Array2::zeros((1, num_classes)),
    };
    let step1 = run_em(
        &mut ClosedFormPrior,
        start,
        &measurement_data,
        config,
        &mut observer,
    );
    let unfitted = |step1: EmOutcome, status: RunStatus| EmOutcome {
        parameters: Parameters {
            item_probs: step1.parameters.item_probs,
            beta: Array2::zeros((data.num_covariates(), num_classes)),
        },
        estep: None,
        trace: step1.trace,
        status,
    };

    let responsibilities = match (&step1.status, &step1.estep) {
        (RunStatus::Failed { .. } | RunStatus::Cancelled, _) | (_, None) => {
            let status = step1.status.clone();
            return unfitted(step1, status);
        }
        (_, Some(estep)) => estep.responsibilities.clone(),
    };
    log::debug!(
        "Step 1 finished after {} iterations with log-likelihood {:?}",
        step1.trace.len(),
        step1.log_likelihood()
    );

    let iteration = step1.trace.len();
    let (beta, step3_status) =
        match structural_step(variant, responsibilities.view(), data, config, &mut observer) {
            Ok(result) => result,
            Err(e) => {
                log::debug!("Step 3 failed: {e}");
                let status = RunStatus::failed(&e, iteration);
                return unfitted(step1, status);
            }
        };

    let parameters = Parameters {
        item_probs: step1.parameters.item_probs,
        beta,
    };
    let estep = match e_step(&parameters, data) {
        Ok(estep) => estep,
        Err(e) => {
            return EmOutcome {
                parameters,
                estep: None,
                trace: step1.trace,
                status: RunStatus::failed(&e, iteration),
            };
        }
    };
    let status = match (step1.status, step3_status) {
        (RunStatus::Cancelled, _) | (_, RunStatus::Cancelled) => RunStatus::Cancelled,
        (RunStatus::MaxIterationsReached, _) | (_, RunStatus::MaxIterationsReached) => {
            RunStatus::MaxIterationsReached
        }
        _ => RunStatus::Converged,
    };
    EmOutcome {
        parameters,
        estep: Some(estep),
        trace: step1.trace,
        status,
    }
}

/// Class sizes implied by hard assignment, as proportions.
pub fn assigned_proportions(assignments: ArrayView1<usize>, num_classes: usize) -> Array1<f64> {
    let mut counts = Array1::<f64>::zeros(num_classes);
    for &a in assignments {
        counts[a] += 1.0;
    }
    let n = assignments.len().max(1) as f64;
    counts / n
}
