//! # Mixture Likelihood and E-step
//!
//! All routines here are pure functions of `(Parameters, Observations)`.
//!
//! The prior over classes is a multinomial logit with class 0 as reference:
//! `log pi_ir = eta_ir - logsumexp_s(eta_is)` with `eta = X beta`. Conditional on
//! class, items are independent, so the class-conditional log density is a sum
//! of table lookups. Every combination across classes goes through a row-wise
//! log-sum-exp so that no probability is ever formed from an overflowing `exp`.
//!
//! Numerical failure is never hidden:
//! - A unit whose mixture density is exactly zero yields `DegenerateResponsibility`.
//! - A non-finite linear predictor, or a NaN anywhere in the mixture, yields
//!   `UndefinedLikelihood`.

use crate::data::Observations;
use crate::em::EstimationError;
use crate::model::Parameters;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

/// Output of one E-step at a fixed parameter value.
#[derive(Debug, Clone)]
pub struct EStep {
    /// `n x R` prior class probabilities.
    pub priors: Array2<f64>,
    /// `n x R` posterior class probabilities; each row sums to one.
    pub responsibilities: Array2<f64>,
    /// Observed-data log-likelihood at the parameters used.
    pub log_likelihood: f64,
}

/// Numerically stable `log(sum(exp(values)))`.
///
/// Returns `-inf` when every entry is `-inf`, and propagates NaN or `+inf`.
pub fn log_sum_exp(values: ArrayView1<f64>) -> f64 {
    let max = values.fold(f64::NEG_INFINITY, |acc, &v| if v > acc { v } else { acc });
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Linear predictor `eta = X beta`, rejected if any entry is not finite.
pub fn linear_predictor(
    beta: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    let eta = covariates.dot(&beta);
    if let Some(((unit, class), value)) = eta.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(EstimationError::UndefinedLikelihood {
            detail: format!("linear predictor for unit {unit}, class {class} is {value}"),
        });
    }
    Ok(eta)
}

/// Row-wise log-softmax of a matrix of linear predictors.
pub fn log_softmax_rows(eta: &Array2<f64>) -> Array2<f64> {
    let mut out = eta.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let normalizer = log_sum_exp(row.view());
        row.mapv_inplace(|v| v - normalizer);
    }
    out
}

/// `n x R` log prior probabilities under the multinomial logit.
pub fn log_prior_probabilities(
    beta: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    let eta = linear_predictor(beta, covariates)?;
    Ok(log_softmax_rows(&eta))
}

/// `n x R` prior probabilities under the multinomial logit.
pub fn prior_probabilities(
    beta: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
) -> Result<Array2<f64>, EstimationError> {
    Ok(log_prior_probabilities(beta, covariates)?.mapv(f64::exp))
}

/// `n x R` matrix of `sum_j log p_{j, r, y_ij}`. A zero cell contributes `-inf`.
pub fn log_class_conditional(item_probs: &[Array2<f64>], data: &Observations) -> Array2<f64> {
    let num_classes = item_probs.first().map_or(0, |t| t.nrows());
    let mut log_f = Array2::<f64>::zeros((data.num_units(), num_classes));
    for (j, table) in item_probs.iter().enumerate() {
        let log_table = table.mapv(f64::ln);
        Zip::from(log_f.rows_mut())
            .and(data.item(j))
            .for_each(|mut row, &code| {
                row += &log_table.column(code);
            });
    }
    log_f
}

/// Mixes log priors with log class-conditional densities into responsibilities.
fn mix(
    log_prior: &Array2<f64>,
    log_conditional: &Array2<f64>,
) -> Result<(Array2<f64>, f64), EstimationError> {
    let mut responsibilities = log_prior + log_conditional;
    let mut total = 0.0;
    for (unit, mut row) in responsibilities.axis_iter_mut(Axis(0)).enumerate() {
        let unit_ll = log_sum_exp(row.view());
        if unit_ll == f64::NEG_INFINITY {
            return Err(EstimationError::DegenerateResponsibility { unit });
        }
        if !unit_ll.is_finite() {
            return Err(EstimationError::UndefinedLikelihood {
                detail: format!("log-likelihood contribution of unit {unit} is {unit_ll}"),
            });
        }
        row.mapv_inplace(|v| (v - unit_ll).exp());
        total += unit_ll;
    }
    Ok((responsibilities, total))
}

/// Total observed-data log-likelihood.
pub fn log_likelihood(params: &Parameters, data: &Observations) -> Result<f64, EstimationError> {
    let log_prior = log_prior_probabilities(params.beta.view(), data.covariates())?;
    let log_conditional = log_class_conditional(&params.item_probs, data);
    mix(&log_prior, &log_conditional).map(|(_, ll)| ll)
}

/// Computes priors, responsibilities and the log-likelihood at `params`.
pub fn e_step(params: &Parameters, data: &Observations) -> Result<EStep, EstimationError> {
    let log_prior = log_prior_probabilities(params.beta.view(), data.covariates())?;
    let log_conditional = log_class_conditional(&params.item_probs, data);
    let (responsibilities, log_likelihood) = mix(&log_prior, &log_conditional)?;
    Ok(EStep {
        priors: log_prior.mapv(f64::exp),
        responsibilities,
        log_likelihood,
    })
}

/// Most probable class of each unit. Ties go to the lowest class index.
pub fn modal_assignment(responsibilities: ArrayView2<f64>) -> Array1<usize> {
    responsibilities
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |(best, best_p), (r, &p)| {
                    if p > best_p { (r, p) } else { (best, best_p) }
                })
                .0
        })
        .collect()
}

/// Average posterior membership of each class.
pub fn class_proportions(responsibilities: ArrayView2<f64>) -> Array1<f64> {
    responsibilities
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(responsibilities.ncols()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_class_fixture() -> (Parameters, Observations) {
        let params = Parameters::new(
            vec![array![[0.8, 0.2], [0.3, 0.7]], array![[0.5, 0.25, 0.25], [0.1, 0.1, 0.8]]],
            array![[0.0, 0.4], [0.0, -1.0]],
        )
        .unwrap();
        let data = Observations::new(
            array![[0, 2], [1, 0], [1, 2], [0, 1]],
            vec![2, 3],
            array![[1.0, 0.0], [1.0, 1.0], [1.0, -0.5], [1.0, 2.0]],
        )
        .unwrap();
        (params, data)
    }

    #[test]
    fn test_log_sum_exp_handles_extremes() {
        assert_abs_diff_eq!(
            log_sum_exp(array![1000.0, 1000.0].view()),
            1000.0 + 2f64.ln(),
            epsilon = 1e-12
        );
        assert_eq!(
            log_sum_exp(array![f64::NEG_INFINITY, f64::NEG_INFINITY].view()),
            f64::NEG_INFINITY
        );
        assert_abs_diff_eq!(
            log_sum_exp(array![f64::NEG_INFINITY, 0.0].view()),
            0.0,
            epsilon = 1e-12
        );
        assert!(log_sum_exp(array![f64::NAN, 0.0].view()).is_nan());
    }

    #[test]
    fn test_log_likelihood_matches_hand_computation() {
        let (params, data) = two_class_fixture();
        let mut expected = 0.0;
        for i in 0..data.num_units() {
            let x = data.covariates().row(i).to_owned();
            let eta1 = x.dot(&params.beta.column(1));
            let pi1 = eta1.exp() / (1.0 + eta1.exp());
            let pi = [1.0 - pi1, pi1];
            let mut mixture = 0.0;
            for r in 0..2 {
                let mut f = 1.0;
                for j in 0..data.num_items() {
                    f *= params.item_probs[j][[r, data.responses()[[i, j]]]];
                }
                mixture += pi[r] * f;
            }
            expected += mixture.ln();
        }
        let ll = log_likelihood(&params, &data).unwrap();
        assert_abs_diff_eq!(ll, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(e_step(&params, &data).unwrap().log_likelihood, ll, epsilon = 1e-12);
    }

    #[test]
    fn test_responsibility_rows_are_distributions() {
        let (params, data) = two_class_fixture();
        let estep = e_step(&params, &data).unwrap();
        for row in estep.responsibilities.axis_iter(Axis(0)) {
            assert!(row.iter().all(|&w| (0.0..=1.0).contains(&w)));
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
        for row in estep.priors.axis_iter(Axis(0)) {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_zero_cell_in_one_class_is_tolerated() {
        let (mut params, data) = two_class_fixture();
        params.item_probs[0] = array![[1.0, 0.0], [0.3, 0.7]];
        let estep = e_step(&params, &data).unwrap();
        // Unit 1 answered level 1, impossible under class 0.
        assert_eq!(estep.responsibilities[[1, 0]], 0.0);
        assert_abs_diff_eq!(estep.responsibilities[[1, 1]], 1.0, epsilon = 1e-12);
        assert!(estep.log_likelihood.is_finite());
    }

    #[test]
    fn test_unit_impossible_in_every_class_is_degenerate() {
        let (mut params, data) = two_class_fixture();
        params.item_probs[0] = array![[1.0, 0.0], [1.0, 0.0]];
        match e_step(&params, &data) {
            Err(EstimationError::DegenerateResponsibility { unit }) => assert_eq!(unit, 1),
            other => panic!("Expected DegenerateResponsibility, got {:?}", other),
        }
    }

    #[test]
    fn test_overflowing_coefficients_are_undefined() {
        let (mut params, data) = two_class_fixture();
        params.beta[[1, 1]] = f64::MAX;
        match log_likelihood(&params, &data) {
            Err(EstimationError::UndefinedLikelihood { .. }) => {}
            other => panic!("Expected UndefinedLikelihood, got {:?}", other),
        }
    }

    #[test]
    fn test_large_but_finite_predictors_stay_stable() {
        let (mut params, data) = two_class_fixture();
        params.beta[[0, 1]] = 800.0;
        let priors = prior_probabilities(params.beta.view(), data.covariates()).unwrap();
        assert!(priors.iter().all(|p| p.is_finite()));
        assert_abs_diff_eq!(priors[[0, 1]], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_modal_assignment_and_proportions() {
        let w = array![[0.2, 0.8], [0.5, 0.5], [0.9, 0.1]];
        assert_eq!(modal_assignment(w.view()), array![1, 0, 0]);
        let props = class_proportions(w.view());
        assert_abs_diff_eq!(props[0], 1.6 / 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(props[1], 1.4 / 3.0, epsilon = 1e-12);
    }
}
