//! # Damped Newton-Raphson M-step
//!
//! One-step EM: the tables receive their exact closed-form update, while the
//! prior coefficients move by a single Newton step on the observed-data
//! log-likelihood in `beta`, scaled by the damping factor `alpha`.
//!
//! With `W` the responsibilities and `Pi` the priors at the current parameters,
//! the gradient block of class `r` is `sum_i x_i (w_ir - pi_ir)` and the Hessian
//! block of classes `(r, s)` is
//! `sum_i x_i x_i^T [delta_rs (w_ir - pi_ir) - w_ir w_is + pi_ir pi_is]`.
//!
//! This Hessian is not guaranteed to be negative definite away from a maximum,
//! so the update can overshoot. Such steps show up as log-likelihood decreases,
//! or as an undefined log-likelihood once the coefficients overflow.

use crate::data::Observations;
use crate::em::EstimationError;
use crate::likelihood::EStep;
use crate::model::Parameters;
use crate::mstep::{
    MStep, stack_free_coefficients, unstack_free_coefficients, update_item_probabilities,
    weighted_gram,
};
use ndarray::{Array1, Array2, ArrayView2, Axis, s};
use ndarray_linalg::Solve;

/// Gradient of the observed log-likelihood with respect to the free coefficients.
pub fn prior_gradient(
    covariates: ArrayView2<f64>,
    responsibilities: ArrayView2<f64>,
    priors: ArrayView2<f64>,
) -> Array1<f64> {
    let p = covariates.ncols();
    let num_free = priors.ncols() - 1;
    let residual = &responsibilities - &priors;
    let mut gradient = Array1::<f64>::zeros(num_free * p);
    for r in 1..=num_free {
        let block = covariates.t().dot(&residual.column(r));
        gradient
            .slice_mut(s![(r - 1) * p..r * p])
            .assign(&block);
    }
    gradient
}

/// Observed-data Hessian with respect to the free coefficients.
pub fn prior_hessian(
    covariates: ArrayView2<f64>,
    responsibilities: ArrayView2<f64>,
    priors: ArrayView2<f64>,
) -> Array2<f64> {
    let p = covariates.ncols();
    let num_free = priors.ncols() - 1;
    let mut hessian = Array2::<f64>::zeros((num_free * p, num_free * p));
    for r in 1..=num_free {
        for q in r..=num_free {
            let w_r = responsibilities.column(r);
            let pi_r = priors.column(r);
            let mut weights = &priors.column(q) * &pi_r - &responsibilities.column(q) * &w_r;
            if q == r {
                weights += &(&w_r - &pi_r);
            }
            let block = weighted_gram(covariates, weights.view());
            hessian
                .slice_mut(s![(r - 1) * p..r * p, (q - 1) * p..q * p])
                .assign(&block);
            if q != r {
                hessian
                    .slice_mut(s![(q - 1) * p..q * p, (r - 1) * p..r * p])
                    .assign(&block.t());
            }
        }
    }
    hessian
}

/// Full Newton direction `-H^{-1} g` for the free coefficients.
pub fn newton_direction(
    covariates: ArrayView2<f64>,
    responsibilities: ArrayView2<f64>,
    priors: ArrayView2<f64>,
) -> Result<Array1<f64>, EstimationError> {
    let gradient = prior_gradient(covariates, responsibilities, priors);
    let hessian = prior_hessian(covariates, responsibilities, priors);
    let direction = hessian
        .solve_into(-gradient)
        .map_err(|e| EstimationError::SingularHessian(e.to_string()))?;
    if direction.iter().any(|d| !d.is_finite()) {
        return Err(EstimationError::SingularHessian(
            "Newton direction has non-finite entries".to_string(),
        ));
    }
    Ok(direction)
}

/// One-step EM with a damped Newton update of the prior coefficients.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonRaphson {
    damping: f64,
}

impl NewtonRaphson {
    pub fn new(damping: f64) -> Self {
        Self { damping }
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }

    /// Coefficients after one damped step from `beta`.
    pub fn step_coefficients(
        &self,
        beta: ArrayView2<f64>,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Array2<f64>, EstimationError> {
        let direction = newton_direction(
            data.covariates(),
            estep.responsibilities.view(),
            estep.priors.view(),
        )?;
        let mut free = stack_free_coefficients(beta);
        free.scaled_add(self.damping, &direction);
        log::debug!(
            "Newton step: |direction|_inf = {:.3e}, damping = {}",
            direction.fold(0.0_f64, |m, d| m.max(d.abs())),
            self.damping
        );
        Ok(unstack_free_coefficients(&free, beta.len_of(Axis(0))))
    }
}

impl MStep for NewtonRaphson {
    fn update(
        &mut self,
        params: &Parameters,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Parameters, EstimationError> {
        let item_probs =
            update_item_probabilities(estep.responsibilities.view(), data, &params.item_probs);
        let beta = self.step_coefficients(params.beta.view(), estep, data)?;
        Ok(Parameters { item_probs, beta })
    }
}
