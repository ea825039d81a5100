//! # Performance Aggregation
//!
//! Reduces a collection of finished runs to one summary per algorithm. Each
//! run that ended with a usable log-likelihood is classified against a
//! reference maximum `L*`: it reached the global maximum when
//! `|final - L*| <= delta` and sits at a local mode otherwise.
//!
//! Failed runs are counted but never enter a quantile, and cancelled runs are
//! not classified because they stopped at an arbitrary point.

use crate::batch::RunResult;
use crate::em::{FailureKind, RunStatus};
use crate::model::Algorithm;
use serde::Serialize;

/// Lower quartile, median and upper quartile of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quartiles {
    pub lower: f64,
    pub median: f64,
    pub upper: f64,
}

/// Sample quartiles by linear interpolation between order statistics.
///
/// This is the `type = 7` definition: the `p` quantile of the sorted sample
/// `x[0..n]` sits at position `h = (n - 1) p`. Returns `None` for an empty
/// sample. Non-finite values are ignored.
pub fn quartiles(values: &[f64]) -> Option<Quartiles> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);
    let at = |p: f64| {
        let h = (sorted.len() - 1) as f64 * p;
        let lo = h.floor() as usize;
        let hi = (lo + 1).min(sorted.len() - 1);
        sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
    };
    Some(Quartiles {
        lower: at(0.25),
        median: at(0.5),
        upper: at(0.75),
    })
}

/// Summary of every run of one algorithm.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSummary {
    pub algorithm: Algorithm,
    pub runs: usize,
    pub failed: usize,
    pub non_converged: usize,
    pub cancelled: usize,
    /// Runs whose trace flagged at least one decrease.
    pub runs_with_decrease: usize,
    pub global_maxima: usize,
    pub local_modes: usize,
    /// Quartiles of `L* - final` over the local-mode runs.
    pub local_mode_gap: Option<Quartiles>,
    /// Quartiles of the iteration count over the runs at the global maximum.
    /// Always `None` for the three-step pipelines.
    pub global_iterations: Option<Quartiles>,
    pub mean_seconds: f64,
}

/// Final log-likelihood of a run that can be compared with a reference.
fn classifiable(result: &RunResult) -> Option<f64> {
    match result.status {
        RunStatus::Converged | RunStatus::MaxIterationsReached => result.final_log_likelihood,
        RunStatus::Cancelled | RunStatus::Failed { .. } => None,
    }
}

/// The largest final log-likelihood over every classifiable run.
pub fn reference_maximum(results: &[RunResult]) -> Option<f64> {
    results
        .iter()
        .filter_map(classifiable)
        .filter(|ll| ll.is_finite())
        .max_by(f64::total_cmp)
}

/// One summary per algorithm, in order of first appearance in `results`.
///
/// When `reference` is `None` it is derived with [`reference_maximum`].
pub fn summarize(
    results: &[RunResult],
    reference: Option<f64>,
    delta: f64,
) -> Vec<PerformanceSummary> {
    let reference = reference.or_else(|| reference_maximum(results));
    let mut algorithms: Vec<Algorithm> = Vec::new();
    for result in results {
        if !algorithms.contains(&result.algorithm) {
            algorithms.push(result.algorithm);
        }
    }

    algorithms
        .into_iter()
        .map(|algorithm| {
            let group: Vec<&RunResult> =
                results.iter().filter(|r| r.algorithm == algorithm).collect();
            summarize_group(algorithm, &group, reference, delta)
        })
        .collect()
}

fn summarize_group(
    algorithm: Algorithm,
    group: &[&RunResult],
    reference: Option<f64>,
    delta: f64,
) -> PerformanceSummary {
    let mut gaps = Vec::new();
    let mut global_iterations = Vec::new();
    if let Some(best) = reference {
        for result in group {
            let Some(ll) = classifiable(result) else {
                continue;
            };
            if (ll - best).abs() <= delta {
                global_iterations.push(result.iterations as f64);
            } else {
                gaps.push(best - ll);
            }
        }
    }

    let count = |pred: fn(&RunResult) -> bool| group.iter().filter(|r| pred(r)).count();
    let total_seconds: f64 = group.iter().map(|r| r.elapsed.as_secs_f64()).sum();

    PerformanceSummary {
        algorithm,
        runs: group.len(),
        failed: count(RunResult::is_failed),
        non_converged: count(|r| {
            !r.is_failed() && r.status.failure_kind() == Some(FailureKind::NonConvergence)
        }),
        cancelled: count(|r| r.status == RunStatus::Cancelled),
        runs_with_decrease: count(|r| r.trace.has_decrease()),
        global_maxima: global_iterations.len(),
        local_modes: gaps.len(),
        local_mode_gap: quartiles(&gaps),
        global_iterations: if algorithm.is_three_step() {
            None
        } else {
            quartiles(&global_iterations)
        },
        mean_seconds: total_seconds / group.len().max(1) as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Parameters;
    use crate::trace::ConvergenceTrace;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::time::Duration;

    fn run(algorithm: Algorithm, lls: &[f64], status: RunStatus) -> RunResult {
        let mut trace = ConvergenceTrace::new(100, 1e-8);
        trace.set_baseline(lls[0]);
        for &ll in &lls[1..] {
            trace.record(ll).unwrap();
        }
        let final_log_likelihood = if status.is_failed() {
            None
        } else {
            trace.last()
        };
        RunResult {
            algorithm,
            seed: 0,
            status,
            iterations: trace.len(),
            trace,
            final_log_likelihood,
            parameters: Parameters {
                item_probs: vec![array![[0.5, 0.5], [0.5, 0.5]]],
                beta: array![[0.0, 0.0]],
            },
            switched_at: None,
            elapsed: Duration::from_millis(500),
        }
    }

    #[test]
    fn test_quartiles_interpolate() {
        let q = quartiles(&[4.0, 1.0, 3.0, 2.0]).unwrap();
        assert_abs_diff_eq!(q.lower, 1.75, epsilon = 1e-12);
        assert_abs_diff_eq!(q.median, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(q.upper, 3.25, epsilon = 1e-12);

        let single = quartiles(&[7.0]).unwrap();
        assert_eq!(single.lower, 7.0);
        assert_eq!(single.upper, 7.0);
        assert!(quartiles(&[]).is_none());
        assert!(quartiles(&[f64::NAN]).is_none());
    }

    #[test]
    fn test_delta_separates_global_from_local() {
        let results = vec![
            run(Algorithm::Nested, &[-120.0, -100.02], RunStatus::Converged),
            run(Algorithm::Nested, &[-120.0, -110.0, -100.005], RunStatus::Converged),
            run(Algorithm::Nested, &[-120.0, -100.0], RunStatus::Converged),
        ];
        let summary = &summarize(&results, Some(-100.0), 0.01)[0];
        assert_eq!(summary.runs, 3);
        assert_eq!(summary.local_modes, 1);
        assert_eq!(summary.global_maxima, 2);
        let gap = summary.local_mode_gap.unwrap();
        assert_abs_diff_eq!(gap.median, 0.02, epsilon = 1e-9);
        let iterations = summary.global_iterations.unwrap();
        assert_abs_diff_eq!(iterations.median, 1.5, epsilon = 1e-12);
    }

    #[test]
    fn test_failed_runs_do_not_enter_quantiles() {
        let failed = RunStatus::Failed {
            kind: FailureKind::UndefinedLikelihood,
            iteration: 2,
            message: "overflow".to_string(),
        };
        let results = vec![
            run(Algorithm::NewtonRaphson { damping: 1.0 }, &[-50.0, -40.0], RunStatus::Converged),
            run(Algorithm::NewtonRaphson { damping: 1.0 }, &[-50.0, -45.0, -60.0], failed),
        ];
        assert_eq!(reference_maximum(&results), Some(-40.0));
        let summary = &summarize(&results, None, 0.01)[0];
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.global_maxima, 1);
        assert_eq!(summary.local_modes, 0);
        assert!(summary.local_mode_gap.is_none());
        assert_eq!(summary.runs_with_decrease, 1);
        assert_abs_diff_eq!(summary.mean_seconds, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_three_step_has_no_iteration_quartiles() {
        let results = vec![
            run(Algorithm::ThreeStepClassical, &[-80.0, -70.0], RunStatus::Converged),
            run(Algorithm::Nested, &[-80.0, -69.0], RunStatus::MaxIterationsReached),
        ];
        let summaries = summarize(&results, None, 0.5);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].algorithm, Algorithm::ThreeStepClassical);
        assert!(summaries[0].global_iterations.is_none());
        assert_eq!(summaries[0].local_modes, 1);
        assert_eq!(summaries[1].non_converged, 1);
        assert_eq!(summaries[1].global_maxima, 1);
        assert!(summaries[1].global_iterations.is_some());
    }

    #[test]
    fn test_cancelled_runs_are_not_classified() {
        let results = vec![
            run(Algorithm::Nested, &[-80.0, -75.0], RunStatus::Cancelled),
            run(Algorithm::Nested, &[-80.0, -70.0], RunStatus::Converged),
        ];
        assert_eq!(reference_maximum(&results), Some(-70.0));
        let summary = &summarize(&results, None, 0.01)[0];
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.global_maxima + summary.local_modes, 1);
    }
}
