//! # M-step Strategies
//!
//! Every optimizer is an `MStep`: a map from the current parameters and their
//! E-step to the next parameters. The class-conditional tables have the same
//! closed-form maximizer for every strategy, so only the prior coefficients
//! differ between them.
//!
//! Free coefficients are the `P x (R - 1)` block of `beta` that excludes the
//! reference column. When stacked into a vector, coefficient `p` of class `r`
//! sits at `(r - 1) * P + p`.

use crate::data::Observations;
use crate::em::EstimationError;
use crate::likelihood::EStep;
use crate::model::Parameters;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};

/// Classes whose total responsibility falls below this keep their previous table rows.
const MIN_CLASS_WEIGHT: f64 = 1e-12;

/// Smallest class proportion the closed-form prior will take a logarithm of.
const MIN_CLASS_PROPORTION: f64 = 1e-300;

/// One EM M-step.
pub trait MStep {
    fn update(
        &mut self,
        params: &Parameters,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Parameters, EstimationError>;

    /// Convergence test after the iteration with log-likelihood change `change`.
    fn has_converged(&mut self, change: f64, tolerance: f64, iteration: usize) -> bool {
        let _ = iteration;
        change.abs() < tolerance
    }

    /// Iteration at which a composite strategy changed its inner update, if any.
    fn switched_at(&self) -> Option<usize> {
        None
    }
}

impl<T: MStep + ?Sized> MStep for Box<T> {
    fn update(
        &mut self,
        params: &Parameters,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Parameters, EstimationError> {
        (**self).update(params, estep, data)
    }

    fn has_converged(&mut self, change: f64, tolerance: f64, iteration: usize) -> bool {
        (**self).has_converged(change, tolerance, iteration)
    }

    fn switched_at(&self) -> Option<usize> {
        (**self).switched_at()
    }
}

/// Responsibility-weighted frequency tables, one `R x C_j` table per item.
///
/// Row `r` of item `j` is `sum_i w_ir 1[y_ij = c] / sum_i w_ir`. A class with
/// essentially no weight cannot be estimated and keeps its row from `previous`.
pub fn update_item_probabilities(
    responsibilities: ArrayView2<f64>,
    data: &Observations,
    previous: &[Array2<f64>],
) -> Vec<Array2<f64>> {
    let num_classes = responsibilities.ncols();
    let class_weight = responsibilities.sum_axis(Axis(0));
    let starved: Vec<usize> = (0..num_classes)
        .filter(|&r| class_weight[r] < MIN_CLASS_WEIGHT)
        .collect();
    if !starved.is_empty() {
        log::warn!(
            "Classes {:?} carry no responsibility; their response tables are left unchanged",
            starved
        );
    }

    previous
        .iter()
        .enumerate()
        .map(|(j, old_table)| {
            let mut counts = Array2::<f64>::zeros((num_classes, data.categories()[j]));
            Zip::from(responsibilities.rows())
                .and(data.item(j))
                .for_each(|w, &code| {
                    let mut column = counts.column_mut(code);
                    column += &w;
                });
            for (r, mut row) in counts.axis_iter_mut(Axis(0)).enumerate() {
                if starved.contains(&r) {
                    row.assign(&old_table.row(r));
                } else {
                    let total = row.sum();
                    row.mapv_inplace(|c| c / total);
                }
            }
            counts
        })
        .collect()
}

/// Stacks the non-reference columns of `beta` into one vector.
pub fn stack_free_coefficients(beta: ArrayView2<f64>) -> Array1<f64> {
    beta.slice(s![.., 1..])
        .t()
        .iter()
        .copied()
        .collect()
}

/// Inverse of [`stack_free_coefficients`], restoring the zero reference column.
pub fn unstack_free_coefficients(free: &Array1<f64>, num_covariates: usize) -> Array2<f64> {
    let num_free_classes = free.len() / num_covariates;
    let mut beta = Array2::<f64>::zeros((num_covariates, num_free_classes + 1));
    for r in 1..=num_free_classes {
        let block = free.slice(s![(r - 1) * num_covariates..r * num_covariates]);
        beta.column_mut(r).assign(&block);
    }
    beta
}

/// `X^T diag(weights) X` without forming the diagonal matrix.
pub fn weighted_gram(x: ArrayView2<f64>, weights: ArrayView1<f64>) -> Array2<f64> {
    let weighted = &x * &weights.insert_axis(Axis(1));
    x.t().dot(&weighted)
}

/// Exact M-step for intercept-only designs.
///
/// With a single constant column the prior has a closed-form maximizer: the
/// intercepts are the log-odds of the class proportions against the reference
/// class. This update is a genuine EM step and never lowers the log-likelihood.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosedFormPrior;

impl MStep for ClosedFormPrior {
    fn update(
        &mut self,
        params: &Parameters,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Parameters, EstimationError> {
        if data.num_covariates() != 1 {
            return Err(EstimationError::DimensionMismatch(format!(
                "closed-form prior update needs an intercept-only design, got {} columns",
                data.num_covariates()
            )));
        }
        let item_probs =
            update_item_probabilities(estep.responsibilities.view(), data, &params.item_probs);
        let proportions = estep
            .responsibilities
            .mean_axis(Axis(0))
            .ok_or_else(|| {
                EstimationError::DimensionMismatch(
                    "no units to estimate class proportions from".to_string(),
                )
            })?
            .mapv(|p| p.max(MIN_CLASS_PROPORTION).ln());
        let mut beta = Array2::<f64>::zeros((1, params.num_classes()));
        for r in 1..params.num_classes() {
            beta[[0, r]] = proportions[r] - proportions[0];
        }
        Ok(Parameters { item_probs, beta })
    }
}
