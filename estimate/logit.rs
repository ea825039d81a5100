//! # Multinomial Logit Fitter
//!
//! Maximum likelihood for `sum_i sum_r t_ir log pi_ir(beta)` where each row of
//! the target matrix `T` is a distribution. Hard labels are one-hot rows; the
//! corrected three-step estimator passes soft responsibilities.
//!
//! The fitter runs Newton iterations with the Fisher information
//! `I_rs = sum_i x_i x_i^T pi_ir (delta_rs - pi_is)`, which is positive
//! semi-definite everywhere, and guards every step with halving:
//! - A trial point is accepted once its objective is finite and not below the
//!   current one. At most `MAX_STEP_HALVINGS` halvings are tried.
//! - Convergence needs both the scaled change `|l_new - l_old| < tol (0.1 + |l_new|)`
//!   and a step that no longer moves the coefficients.
//! - If no halving helps, the fit has converged only when the gradient is
//!   already negligible.
//!
//! Separation shows up as a linear predictor running off to infinity; once any
//! `|eta|` exceeds `SEPARATION_ETA_LIMIT` the fit is abandoned.

use crate::em::EstimationError;
use crate::likelihood::{linear_predictor, log_prior_probabilities, prior_probabilities};
use crate::mstep::{stack_free_coefficients, unstack_free_coefficients, weighted_gram};
use crate::newton::prior_gradient;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip, s};
use ndarray_linalg::Solve;

const MAX_STEP_HALVINGS: usize = 30;
const SEPARATION_ETA_LIMIT: f64 = 100.0;
const STALLED_GRADIENT_TOLERANCE: f64 = 1e-6;
const STEP_TOLERANCE: f64 = 1e-6;

/// Result of a converged logit fit.
#[derive(Debug, Clone)]
pub struct LogitFit {
    /// `P x R` coefficients with a zero reference column.
    pub beta: Array2<f64>,
    pub log_likelihood: f64,
    pub iterations: usize,
}

/// One-hot encoding of hard class labels.
pub fn one_hot(labels: ArrayView1<usize>, num_classes: usize) -> Array2<f64> {
    let mut targets = Array2::<f64>::zeros((labels.len(), num_classes));
    for (mut row, &label) in targets.axis_iter_mut(Axis(0)).zip(labels.iter()) {
        row[label] = 1.0;
    }
    targets
}

/// `sum_i sum_r t_ir log pi_ir`, or `None` if it is not finite at `beta`.
fn objective(
    beta: ArrayView2<f64>,
    covariates: ArrayView2<f64>,
    targets: ArrayView2<f64>,
) -> Option<f64> {
    let log_prior = log_prior_probabilities(beta, covariates).ok()?;
    let value = Zip::from(&log_prior)
        .and(targets)
        .fold(0.0, |acc, &lp, &t| if t > 0.0 { acc + t * lp } else { acc });
    value.is_finite().then_some(value)
}

/// Fisher information for the free coefficients at prior probabilities `priors`.
fn information_matrix(covariates: ArrayView2<f64>, priors: ArrayView2<f64>) -> Array2<f64> {
    let p = covariates.ncols();
    let num_free = priors.ncols() - 1;
    let mut info = Array2::<f64>::zeros((num_free * p, num_free * p));
    for r in 1..=num_free {
        for q in r..=num_free {
            let pi_r = priors.column(r);
            let mut weights = -(&pi_r * &priors.column(q));
            if q == r {
                weights += &pi_r;
            }
            let block = weighted_gram(covariates, weights.view());
            info.slice_mut(s![(r - 1) * p..r * p, (q - 1) * p..q * p])
                .assign(&block);
            if q != r {
                info.slice_mut(s![(q - 1) * p..q * p, (r - 1) * p..r * p])
                    .assign(&block.t());
            }
        }
    }
    info
}

fn max_abs(values: &Array1<f64>) -> f64 {
    values.fold(0.0_f64, |m, v| m.max(v.abs()))
}

/// Fits a multinomial logit of `targets` on `covariates`.
///
/// `initial` warm-starts the iteration; otherwise all coefficients start at zero.
pub fn fit_multinomial_logit(
    covariates: ArrayView2<f64>,
    targets: ArrayView2<f64>,
    initial: Option<ArrayView2<f64>>,
    max_iterations: usize,
    tolerance: f64,
) -> Result<LogitFit, EstimationError> {
    let (n, num_classes) = targets.dim();
    let p = covariates.ncols();
    if covariates.nrows() != n {
        return Err(EstimationError::DimensionMismatch(format!(
            "{} covariate rows for {n} targets",
            covariates.nrows()
        )));
    }
    if num_classes < 2 {
        return Err(EstimationError::InvalidConfiguration(
            "a multinomial logit needs at least 2 classes".to_string(),
        ));
    }
    let mut beta = match initial {
        Some(start) if start.dim() == (p, num_classes) => start.to_owned(),
        Some(start) => {
            return Err(EstimationError::DimensionMismatch(format!(
                "warm start has shape {:?}, expected ({p}, {num_classes})",
                start.dim()
            )));
        }
        None => Array2::zeros((p, num_classes)),
    };
    beta.column_mut(0).fill(0.0);

    let mut current = objective(beta.view(), covariates, targets).ok_or_else(|| {
        EstimationError::SingularFit("objective is not finite at the starting point".to_string())
    })?;

    for iteration in 1..=max_iterations {
        let priors = prior_probabilities(beta.view(), covariates)?;
        let gradient = prior_gradient(covariates, targets, priors.view());
        let info = information_matrix(covariates, priors.view());
        let direction = info
            .solve(&gradient)
            .map_err(|e| EstimationError::SingularFit(format!("information matrix is singular: {e}")))?;
        if direction.iter().any(|d| !d.is_finite()) {
            return Err(EstimationError::SingularFit(
                "Newton direction has non-finite entries".to_string(),
            ));
        }

        let free = stack_free_coefficients(beta.view());
        let mut step = 1.0;
        let mut accepted = None;
        for halving in 0..=MAX_STEP_HALVINGS {
            let trial = unstack_free_coefficients(&(&free + &(step * &direction)), p);
            if let Some(value) = objective(trial.view(), covariates, targets) {
                if value >= current {
                    if halving > 0 {
                        log::debug!("Logit step accepted after {halving} halvings");
                    }
                    accepted = Some((trial, value));
                    break;
                }
            }
            step *= 0.5;
        }

        let Some((trial, value)) = accepted else {
            let scale = 1.0 + current.abs();
            if max_abs(&gradient) <= STALLED_GRADIENT_TOLERANCE * scale {
                log::debug!("Logit fit stalled at a stationary point after {iteration} iterations");
                return Ok(LogitFit {
                    beta,
                    log_likelihood: current,
                    iterations: iteration,
                });
            }
            return Err(EstimationError::SingularFit(format!(
                "no improving step after {MAX_STEP_HALVINGS} halvings (|gradient| = {:.3e})",
                max_abs(&gradient)
            )));
        };

        let change = value - current;
        let step_size = step * max_abs(&direction);
        beta = trial;
        current = value;

        let eta = linear_predictor(beta.view(), covariates)?;
        let eta_max = eta.fold(0.0_f64, |m, v| m.max(v.abs()));
        if eta_max > SEPARATION_ETA_LIMIT {
            return Err(EstimationError::SingularFit(format!(
                "linear predictor reached {eta_max:.1}; the classes appear to be separated"
            )));
        }

        log::debug!(
            "[Logit iter #{iteration}] log-likelihood: {current:.10} | change: {change:.3e}"
        );
        let coefficient_scale = 1.0 + beta.fold(0.0_f64, |m, b| m.max(b.abs()));
        if change.abs() < tolerance * (0.1 + current.abs())
            && step_size < STEP_TOLERANCE * coefficient_scale
        {
            return Ok(LogitFit {
                beta,
                log_likelihood: current,
                iterations: iteration,
            });
        }
    }

    Err(EstimationError::SingularFit(format!(
        "did not converge within {max_iterations} iterations"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::distributions::{Distribution, WeightedIndex};
    use rand_distr::Normal;

    fn simulate(n: usize, beta: &Array2<f64>, seed: u64) -> (Array2<f64>, Array1<usize>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let covariates = Array2::from_shape_fn((n, beta.nrows()), |(_, c)| {
            if c == 0 { 1.0 } else { normal.sample(&mut rng) }
        });
        let priors = prior_probabilities(beta.view(), covariates.view()).unwrap();
        let labels = priors
            .axis_iter(Axis(0))
            .map(|row| WeightedIndex::new(row.iter()).unwrap().sample(&mut rng))
            .collect();
        (covariates, labels)
    }

    #[test]
    fn test_recovers_true_coefficients() {
        let truth = array![[0.0, 0.5, -0.3], [0.0, 1.0, -0.8]];
        let (x, labels) = simulate(8000, &truth, 42);
        let targets = one_hot(labels.view(), 3);
        let fit = fit_multinomial_logit(x.view(), targets.view(), None, 100, 1e-10).unwrap();
        for (estimate, expected) in fit.beta.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(*estimate, *expected, epsilon = 0.2);
        }
        let priors = prior_probabilities(fit.beta.view(), x.view()).unwrap();
        let gradient = prior_gradient(x.view(), targets.view(), priors.view());
        assert!(max_abs(&gradient) < 1e-4, "gradient {gradient}");
    }

    #[test]
    fn test_warm_start_at_optimum_stops_immediately() {
        let truth = array![[0.0, -0.4], [0.0, 0.7]];
        let (x, labels) = simulate(2000, &truth, 7);
        let targets = one_hot(labels.view(), 2);
        let cold = fit_multinomial_logit(x.view(), targets.view(), None, 100, 1e-10).unwrap();
        let warm = fit_multinomial_logit(
            x.view(),
            targets.view(),
            Some(cold.beta.view()),
            100,
            1e-10,
        )
        .unwrap();
        assert!(warm.iterations <= 2);
        assert_abs_diff_eq!(warm.log_likelihood, cold.log_likelihood, epsilon = 1e-8);
    }

    #[test]
    fn test_soft_targets_match_weighted_proportions() {
        // Intercept only: the fitted priors equal the mean target.
        let x = Array2::ones((4, 1));
        let targets = array![[0.9, 0.1], [0.6, 0.4], [0.3, 0.7], [0.2, 0.8]];
        let fit = fit_multinomial_logit(x.view(), targets.view(), None, 100, 1e-12).unwrap();
        let pi = prior_probabilities(fit.beta.view(), x.view()).unwrap();
        assert_abs_diff_eq!(pi[[0, 1]], 0.5, epsilon = 1e-8);
    }

    #[test]
    fn test_separated_labels_fail() {
        let x = array![[1.0, -10.0], [1.0, -4.0], [1.0, -1.0], [1.0, 1.0], [1.0, 4.0], [1.0, 10.0]];
        let labels = array![0, 0, 0, 1, 1, 1];
        let targets = one_hot(labels.view(), 2);
        match fit_multinomial_logit(x.view(), targets.view(), None, 200, 1e-10) {
            Err(EstimationError::SingularFit(_)) => {}
            other => panic!("Expected SingularFit, got {:?}", other),
        }
    }

    #[test]
    fn test_iteration_cap_is_a_singular_fit() {
        let truth = array![[0.0, 0.5], [0.0, 1.0]];
        let (x, labels) = simulate(500, &truth, 3);
        let targets = one_hot(labels.view(), 2);
        match fit_multinomial_logit(x.view(), targets.view(), None, 1, 0.0) {
            Err(EstimationError::SingularFit(msg)) => assert!(msg.contains("did not converge")),
            other => panic!("Expected SingularFit, got {:?}", other),
        }
    }
}
