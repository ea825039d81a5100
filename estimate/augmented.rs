//! # Pólya-Gamma Augmented M-step
//!
//! The nested EM replaces the Newton step with an exact inner maximization
//! made possible by data augmentation.
//!
//! Holding every coefficient column except class `r` fixed, the expected
//! complete-data prior term depends on `beta_r` only through
//! `psi_ir = eta_ir - C_ir` with `C_ir = log sum_{s != r} exp(eta_is)`:
//!
//! `Q_r(beta_r) = sum_i [ w_ir psi_ir - log(1 + exp(psi_ir)) ] + const`
//!
//! which is a logistic log-likelihood with soft response `w_ir` and offset
//! `C_ir`. Introducing one Pólya-Gamma variable `omega_ir ~ PG(1, psi_ir)` per
//! unit and class makes the augmented objective quadratic in `psi`. Its
//! conditional expectation has the closed form
//!
//! `E[omega_ir] = tanh(psi_ir / 2) / (2 psi_ir)`, equal to `1/4` at `psi = 0`,
//!
//! and maximizing the resulting quadratic gives the weighted least squares update
//!
//! `beta_r = (X^T Omega_r X)^{-1} X^T (kappa_r + Omega_r C_r)`, `kappa_ir = w_ir - 1/2`.
//!
//! The quadratic is a minorizer of `Q_r` that touches it at the current value,
//! so each block update cannot lower `Q_r`, and the outer EM step cannot lower
//! the observed log-likelihood. Classes are updated cyclically, and the
//! linear predictor is refreshed after each block.

use crate::data::Observations;
use crate::em::EstimationError;
use crate::likelihood::{EStep, linear_predictor, log_prior_probabilities, log_sum_exp};
use crate::model::Parameters;
use crate::mstep::{MStep, update_item_probabilities, weighted_gram};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use ndarray_linalg::Solve;

/// Below this `|psi|` the series expansion of the Pólya-Gamma mean is used.
const PSI_SERIES_THRESHOLD: f64 = 1e-4;

/// Expected value of a `PG(1, psi)` variable.
pub fn polya_gamma_mean(psi: f64) -> f64 {
    if psi.abs() < PSI_SERIES_THRESHOLD {
        0.25 - psi * psi / 48.0
    } else {
        (psi / 2.0).tanh() / (2.0 * psi)
    }
}

/// `sum_i sum_r w_ir log pi_ir`, the prior part of the expected complete-data log-likelihood.
pub fn expected_prior_term(
    beta: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    responsibilities: ArrayView2<f64>,
) -> Result<f64, EstimationError> {
    let log_prior = log_prior_probabilities(beta, covariates)?;
    Ok(Zip::from(&log_prior)
        .and(responsibilities)
        .fold(0.0, |acc, &lp, &w| if w > 0.0 { acc + w * lp } else { acc }))
}

/// Offset `C_r` and contrast `psi_r` for class `r` at the linear predictor `eta`.
fn class_contrast(eta: &Array2<f64>, r: usize) -> (Array1<f64>, Array1<f64>) {
    let mut offset = Array1::<f64>::zeros(eta.nrows());
    let mut contrast = Array1::<f64>::zeros(eta.nrows());
    for (i, row) in eta.axis_iter(Axis(0)).enumerate() {
        let others: Array1<f64> = row
            .iter()
            .enumerate()
            .filter(|&(s, _)| s != r)
            .map(|(_, &v)| v)
            .collect();
        offset[i] = log_sum_exp(others.view());
        contrast[i] = row[r] - offset[i];
    }
    (offset, contrast)
}

/// One cyclic sweep of Pólya-Gamma block updates over the non-reference classes.
pub fn augmented_coefficient_update(
    beta: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    responsibilities: ArrayView2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    let mut beta = beta.to_owned();
    for r in 1..beta.ncols() {
        let eta = linear_predictor(beta.view(), covariates)?;
        let (offset, contrast) = class_contrast(&eta, r);
        let omega = contrast.mapv(polya_gamma_mean);
        let kappa = responsibilities.column(r).mapv(|w| w - 0.5);

        let gram = weighted_gram(covariates, omega.view());
        let rhs = covariates.t().dot(&(&kappa + &(&omega * &offset)));
        let beta_r = gram
            .solve_into(rhs)
            .map_err(|e| EstimationError::SingularHessian(e.to_string()))?;
        if beta_r.iter().any(|b| !b.is_finite()) {
            return Err(EstimationError::SingularHessian(format!(
                "augmented update for class {r} produced non-finite coefficients"
            )));
        }
        beta.column_mut(r).assign(&beta_r);
    }
    Ok(beta)
}

/// Nested EM: exact table update plus one Pólya-Gamma sweep for the coefficients.
#[derive(Debug, Clone, Copy, Default)]
pub struct Nested;

impl MStep for Nested {
    fn update(
        &mut self,
        params: &Parameters,
        estep: &EStep,
        data: &Observations,
    ) -> Result<Parameters, EstimationError> {
        let item_probs =
            update_item_probabilities(estep.responsibilities.view(), data, &params.item_probs);
        let beta = augmented_coefficient_update(
            params.beta.view(),
            data.covariates(),
            estep.responsibilities.view(),
        )?;
        Ok(Parameters { item_probs, beta })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::{e_step, prior_probabilities};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn fixture() -> (Parameters, Observations) {
        let params = Parameters::new(
            vec![
                array![[0.8, 0.2], [0.3, 0.7], [0.5, 0.5]],
                array![[0.7, 0.2, 0.1], [0.2, 0.2, 0.6], [0.1, 0.6, 0.3]],
            ],
            array![[0.0, 0.1, -0.2], [0.0, 0.8, -0.6]],
        )
        .unwrap();
        let data = Observations::new(
            array![
                [0, 0],
                [1, 2],
                [1, 1],
                [0, 2],
                [0, 1],
                [1, 0],
                [1, 2],
                [0, 0],
                [1, 1],
                [0, 0]
            ],
            vec![2, 3],
            array![
                [1.0, -1.0],
                [1.0, 0.5],
                [1.0, 1.5],
                [1.0, -0.2],
                [1.0, 2.0],
                [1.0, 0.0],
                [1.0, -1.5],
                [1.0, 0.8],
                [1.0, 1.1],
                [1.0, -0.7]
            ],
        )
        .unwrap();
        (params, data)
    }

    #[test]
    fn test_polya_gamma_mean() {
        assert_eq!(polya_gamma_mean(0.0), 0.25);
        assert_abs_diff_eq!(polya_gamma_mean(2.0), 1.0f64.tanh() / 4.0, epsilon = 1e-15);
        assert_abs_diff_eq!(polya_gamma_mean(1e-5), polya_gamma_mean(-1e-5), epsilon = 1e-15);
        // The series and closed form agree across the switch.
        let below = polya_gamma_mean(PSI_SERIES_THRESHOLD * 0.999);
        let above = polya_gamma_mean(PSI_SERIES_THRESHOLD * 1.001);
        assert_abs_diff_eq!(below, above, epsilon = 1e-10);
        assert!(polya_gamma_mean(50.0) > 0.0);
        assert_abs_diff_eq!(polya_gamma_mean(50.0), 0.01, epsilon = 1e-12);
    }

    #[test]
    fn test_block_update_never_lowers_the_prior_term() {
        let (params, data) = fixture();
        let estep = e_step(&params, &data).unwrap();
        let w = estep.responsibilities.view();
        let mut beta = params.beta.clone();
        let mut previous = expected_prior_term(beta.view(), data.covariates(), w).unwrap();
        for _ in 0..25 {
            beta = augmented_coefficient_update(beta.view(), data.covariates(), w).unwrap();
            let current = expected_prior_term(beta.view(), data.covariates(), w).unwrap();
            assert!(current >= previous - 1e-12, "{current} < {previous}");
            previous = current;
        }
        assert!(beta.column(0).iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_repeated_sweeps_reach_the_weighted_logit_optimum() {
        let (params, data) = fixture();
        let estep = e_step(&params, &data).unwrap();
        let w = estep.responsibilities.view();
        let mut beta = params.beta.clone();
        for _ in 0..2000 {
            beta = augmented_coefficient_update(beta.view(), data.covariates(), w).unwrap();
        }
        // At the optimum the score X^T (W - Pi) vanishes.
        let priors = prior_probabilities(beta.view(), data.covariates()).unwrap();
        let score = data.covariates().t().dot(&(&w - &priors));
        for value in score.iter() {
            assert_abs_diff_eq!(*value, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_nested_em_is_monotone() {
        let (mut params, data) = fixture();
        let mut estep = e_step(&params, &data).unwrap();
        for _ in 0..100 {
            params = Nested.update(&params, &estep, &data).unwrap();
            let next = e_step(&params, &data).unwrap();
            assert!(next.log_likelihood >= estep.log_likelihood - 1e-10);
            estep = next;
        }
    }
}
