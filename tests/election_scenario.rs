//! Seed batteries on the three-class, twelve-item scenario. The short versions
//! run by default. The 100-seed batteries take minutes in release mode and are
//! run with `cargo test --release -- --ignored`.

use lcem::batch::{RunResult, RunSpec, run_batch, run_one};
use lcem::data::Observations;
use lcem::diagnose::{PerformanceSummary, PerformanceTable, summarize};
use lcem::em::{FailureKind, RunStatus};
use lcem::model::{Algorithm, FitConfig};
use lcem::simulate::Scenario;

fn election_data() -> Observations {
    Scenario::election_like().generate(2024).expect("simulation").0
}

fn newton(damping: f64) -> Algorithm {
    Algorithm::NewtonRaphson { damping }
}

fn summary_for(summaries: &[PerformanceSummary], algorithm: Algorithm) -> &PerformanceSummary {
    summaries
        .iter()
        .find(|s| s.algorithm == algorithm)
        .expect("every algorithm in the grid has a summary")
}

fn total_iterations(results: &[RunResult], algorithm: Algorithm) -> usize {
    results
        .iter()
        .filter(|r| r.algorithm == algorithm)
        .map(|r| r.iterations)
        .sum()
}

#[test]
fn damping_reduces_runs_with_a_decrease() {
    let data = election_data();
    let config = FitConfig {
        max_iterations: 300,
        ..FitConfig::with_classes(3)
    };
    let (full, damped) = (newton(1.0), newton(0.25));
    let seeds: Vec<u64> = (1..=20).collect();
    let results = run_batch(&RunSpec::grid(&[full, damped], &seeds), &data, &config).expect("batch");

    let summaries = summarize(&results, None, 0.01);
    let undamped_runs = summary_for(&summaries, full).runs_with_decrease;
    let damped_runs = summary_for(&summaries, damped).runs_with_decrease;
    assert!(
        damped_runs < undamped_runs,
        "runs with a decrease: damped {damped_runs} vs undamped {undamped_runs}"
    );
    assert!(total_iterations(&results, damped) >= total_iterations(&results, full));
}

#[test]
fn full_newton_step_from_seed_one_stops_within_the_cap() {
    let data = election_data();
    let config = FitConfig {
        max_iterations: 1000,
        ..FitConfig::with_classes(3)
    };
    let result = run_one(RunSpec::new(newton(1.0), 1), &data, &config).expect("run");
    assert!(result.iterations <= 1000);
    match result.status {
        RunStatus::Converged => assert!(result.final_log_likelihood.is_some_and(f64::is_finite)),
        RunStatus::MaxIterationsReached | RunStatus::Failed { .. } => {
            assert!(result.status.failure_kind().is_some());
        }
        RunStatus::Cancelled => panic!("nothing cancels this run"),
    }
}

#[test]
#[ignore]
fn damping_trades_decreases_for_iterations() {
    let data = election_data();
    let config = FitConfig::with_classes(3);
    let dampings = [newton(1.0), newton(0.75), newton(0.5), newton(0.25)];
    let mut algorithms = dampings.to_vec();
    algorithms.push(Algorithm::Nested);
    let seeds: Vec<u64> = (1..=100).collect();
    let results = run_batch(&RunSpec::grid(&algorithms, &seeds), &data, &config).expect("batch");
    let summaries = summarize(&results, None, 0.01);

    // Smaller steps give fewer runs with a decrease and need more iterations to stop.
    for pair in dampings.windows(2) {
        let (larger, smaller) = (pair[0], pair[1]);
        let before = summary_for(&summaries, larger).runs_with_decrease;
        let after = summary_for(&summaries, smaller).runs_with_decrease;
        assert!(after <= before, "{smaller} has {after} runs with a decrease, {larger} has {before}");
        assert!(
            total_iterations(&results, smaller) >= total_iterations(&results, larger),
            "{smaller} stopped sooner than {larger}"
        );
    }
    assert!(
        summary_for(&summaries, newton(0.25)).runs_with_decrease
            < summary_for(&summaries, newton(1.0)).runs_with_decrease
    );
    assert_eq!(summary_for(&summaries, Algorithm::Nested).runs_with_decrease, 0);

    println!("{}", PerformanceTable::from_summaries(&summaries));
}

#[test]
#[ignore]
fn newton_failures_are_reported_not_hidden() {
    let data = election_data();
    let config = FitConfig::with_classes(3);
    let seeds: Vec<u64> = (1..=20).collect();
    let results =
        run_batch(&RunSpec::grid(&[newton(1.0)], &seeds), &data, &config).expect("batch");
    for result in &results {
        match &result.status {
            RunStatus::Converged | RunStatus::MaxIterationsReached => {
                assert!(result.final_log_likelihood.is_some_and(f64::is_finite));
            }
            RunStatus::Failed { kind, .. } => {
                assert!(matches!(
                    kind,
                    FailureKind::UndefinedLikelihood | FailureKind::DegenerateResponsibility
                ));
                assert!(result.final_log_likelihood.is_none());
            }
            RunStatus::Cancelled => panic!("nothing cancels these runs"),
        }
    }
}
