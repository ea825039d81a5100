#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fs::{self, File};
use std::io::{BufWriter, IsTerminal};
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use lcem::batch::{RunResult, RunSpec, run_batch_with_progress, run_one};
use lcem::data::{load_observations, write_observations};
use lcem::diagnose::{PerformanceTable, summarize};
use lcem::em::{CancellationFlag, RunStatus};
use lcem::likelihood::{class_proportions, e_step, modal_assignment};
use lcem::model::{Algorithm, FitConfig, FittedModel};
use lcem::simulate::Scenario;
use lcem::three_step::assigned_proportions;

#[derive(Args)]
pub struct SimulateArgs {
    /// Where to write the simulated Y1..YJ, X1..XP table
    pub output: String,

    /// Seed for the true parameters and the sample
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Number of units; defaults to the 1785 of the election-style scenario
    #[arg(long)]
    pub units: Option<usize>,

    /// Number of latent classes
    #[arg(long, default_value = "3")]
    pub classes: usize,
}

/// Options shared by `fit` and `benchmark` that override the TOML configuration.
#[derive(Args)]
pub struct FitOverrides {
    /// TOML file with fitting options; command-line flags take precedence
    #[arg(long)]
    pub config: Option<String>,

    /// Number of latent classes
    #[arg(long)]
    pub classes: Option<usize>,

    /// Maximum number of EM iterations per run
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Stop when the log-likelihood improves by less than this
    #[arg(long)]
    pub tolerance: Option<f64>,

    /// Category counts per item, comma separated; inferred from the data otherwise
    #[arg(long, value_delimiter = ',')]
    pub categories: Option<Vec<usize>>,
}

#[derive(Args)]
pub struct FitArgs {
    /// Path to a TSV file with Y1..YJ, X1..XP columns
    pub data: String,

    /// nr[:alpha], nested, hybrid[:eps[:alpha]], 3step or 3step-corrected
    #[arg(long, default_value = "nested")]
    pub algorithm: Algorithm,

    /// Seed for the starting values
    #[arg(long, default_value = "1")]
    pub seed: u64,

    /// Where to save the fitted model (.toml)
    #[arg(long)]
    pub output: Option<String>,

    /// Also write the full run record as JSON
    #[arg(long)]
    pub json: Option<String>,

    #[command(flatten)]
    pub overrides: FitOverrides,
}

#[derive(Args)]
pub struct BenchmarkArgs {
    /// Path to a TSV file with Y1..YJ, X1..XP columns
    pub data: String,

    /// TOML file describing the algorithms, seeds and tolerance delta
    #[arg(long)]
    pub benchmark: Option<String>,

    /// Algorithms to compare, comma separated; replaces the benchmark file's list
    #[arg(long, value_delimiter = ',')]
    pub algorithms: Option<Vec<Algorithm>>,

    /// Number of seeds, starting at 1; replaces the benchmark file's seeds
    #[arg(long)]
    pub seeds: Option<u64>,

    /// Runs within this distance of the best log-likelihood count as the global maximum
    #[arg(long)]
    pub delta: Option<f64>,

    /// Worker threads; defaults to the number of logical cores
    #[arg(long)]
    pub threads: Option<usize>,

    /// Cancel the remaining runs once this many runs have failed
    #[arg(long)]
    pub max_failures: Option<usize>,

    /// Also write every run record as JSON
    #[arg(long)]
    pub json: Option<String>,

    #[command(flatten)]
    pub overrides: FitOverrides,
}

/// Counts failed runs and raises the cancellation flag when the limit is hit.
struct FailureBudget {
    limit: Option<usize>,
    failures: AtomicUsize,
    cancel: CancellationFlag,
}

impl FailureBudget {
    fn new(limit: Option<usize>, cancel: CancellationFlag) -> Self {
        Self {
            limit,
            failures: AtomicUsize::new(0),
            cancel,
        }
    }

    /// Returns true for the run that exhausted the budget.
    fn record(&self, status: &RunStatus) -> bool {
        if !status.is_failed() {
            return false;
        }
        let seen = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if self.limit == Some(seen) {
            self.cancel.cancel();
            return true;
        }
        false
    }
}

/// The contents of a benchmark TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub algorithms: Vec<Algorithm>,
    pub seeds: Vec<u64>,
    pub delta: f64,
    /// Known maximum log-likelihood; the best run is used when absent.
    pub reference: Option<f64>,
    pub fit: FitConfig,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            algorithms: vec![
                Algorithm::NewtonRaphson { damping: 1.0 },
                Algorithm::NewtonRaphson { damping: 0.5 },
                Algorithm::Nested,
                Algorithm::Hybrid {
                    switch_threshold: lcem::model::DEFAULT_SWITCH_THRESHOLD,
                    damping: 1.0,
                },
                Algorithm::ThreeStepClassical,
                Algorithm::ThreeStepCorrected,
            ],
            seeds: (1..=100).collect(),
            delta: 0.01,
            reference: None,
            fit: FitConfig::with_classes(3),
        }
    }
}

fn resolve_config(base: FitConfig, overrides: &FitOverrides) -> Result<FitConfig, Box<dyn Error>> {
    let mut config = match &overrides.config {
        Some(path) => FitConfig::load(path)?,
        None => base,
    };
    if let Some(classes) = overrides.classes {
        config.num_classes = classes;
    }
    if let Some(max_iterations) = overrides.max_iterations {
        config.max_iterations = max_iterations;
    }
    if let Some(tolerance) = overrides.tolerance {
        config.convergence_tolerance = tolerance;
    }
    config.validate()?;
    Ok(config)
}

fn write_json<T: Serialize + ?Sized>(path: &str, value: &T) -> Result<(), Box<dyn Error>> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, value)?;
    println!("Run records written to {path}");
    Ok(())
}

fn format_proportions(values: impl IntoIterator<Item = f64>) -> String {
    values
        .into_iter()
        .map(|p| format!("{p:.4}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn simulate(args: SimulateArgs) -> Result<(), Box<dyn Error>> {
    let defaults = Scenario::election_like();
    let scenario = Scenario {
        num_units: args.units.unwrap_or(defaults.num_units),
        num_classes: args.classes,
        ..defaults
    };
    let (data, truth) = scenario.generate(args.seed)?;
    write_observations(&args.output, &data)?;
    println!(
        "Wrote {} units and {} items to {}",
        data.num_units(),
        data.num_items(),
        args.output
    );
    println!("True prior coefficients:\n{:.4}", truth.beta);
    Ok(())
}

pub fn fit(args: FitArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(FitConfig::default(), &args.overrides)?;
    println!("Loading data from: {}", args.data);
    let data = load_observations(&args.data, args.overrides.categories.as_deref())?;
    println!(
        "Loaded {} units, {} items and {} covariates (including the intercept)",
        data.num_units(),
        data.num_items(),
        data.num_covariates()
    );

    let result = run_one(RunSpec::new(args.algorithm, args.seed), &data, &config)?;
    println!(
        "{} (seed {}): {:?} after {} iterations in {:.2?}",
        result.algorithm, result.seed, result.status, result.iterations, result.elapsed
    );
    if let Some(switched) = result.switched_at {
        println!("Switched to Newton-Raphson after iteration {switched}");
    }
    if result.trace.has_decrease() {
        println!(
            "Warning: the log-likelihood decreased on {} iterations",
            result.decrease_count()
        );
    }

    if let Some(path) = &args.json {
        write_json(path, &result)?;
    }

    let Some(log_likelihood) = result.final_log_likelihood else {
        return Err(format!("{} failed; no model was saved", result.algorithm).into());
    };
    println!("Final log-likelihood: {log_likelihood:.6}");

    let estep = e_step(&result.parameters, &data)?;
    let assignments = modal_assignment(estep.responsibilities.view());
    println!(
        "Posterior class proportions: {}",
        format_proportions(class_proportions(estep.responsibilities.view()))
    );
    println!(
        "Modal assignment proportions: {}",
        format_proportions(assigned_proportions(assignments.view(), config.num_classes))
    );
    println!("Prior coefficients:\n{:.4}", result.parameters.beta);

    if let Some(path) = &args.output {
        let model = FittedModel {
            algorithm: result.algorithm,
            log_likelihood,
            config,
            parameters: result.parameters,
        };
        model.save(path)?;
        println!("Model saved to: {path}");
    }
    Ok(())
}

fn create_progress_bar(len: u64) -> Result<ProgressBar, Box<dyn Error>> {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };
    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    pb.set_style(
        ProgressStyle::with_template("> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")?
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    pb.set_message("runs");
    Ok(pb)
}

pub fn benchmark(args: BenchmarkArgs) -> Result<(), Box<dyn Error>> {
    let mut bench = match &args.benchmark {
        Some(path) => toml::from_str::<BenchmarkConfig>(&fs::read_to_string(path)?)?,
        None => BenchmarkConfig::default(),
    };
    if let Some(algorithms) = args.algorithms {
        bench.algorithms = algorithms;
    }
    if let Some(seeds) = args.seeds {
        bench.seeds = (1..=seeds).collect();
    }
    if let Some(delta) = args.delta {
        bench.delta = delta;
    }
    let config = resolve_config(bench.fit.clone(), &args.overrides)?;

    let threads = args.threads.unwrap_or_else(num_cpus::get).max(1);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()?;

    let data = load_observations(&args.data, args.overrides.categories.as_deref())?;
    let specs = RunSpec::grid(&bench.algorithms, &bench.seeds);
    println!(
        "Benchmarking {} algorithms over {} seeds ({} runs) on {} threads",
        bench.algorithms.len(),
        bench.seeds.len(),
        specs.len(),
        threads
    );

    let pb = create_progress_bar(specs.len() as u64)?;
    let cancel = CancellationFlag::new();
    let budget = FailureBudget::new(args.max_failures, cancel.clone());
    let results: Vec<RunResult> =
        run_batch_with_progress(&specs, &data, &config, &cancel, |result| {
            if let RunStatus::Failed { kind, message, .. } = &result.status {
                pb.println(format!(
                    "{} seed {} failed ({kind:?}): {message}",
                    result.algorithm, result.seed
                ));
            }
            if budget.record(&result.status) {
                pb.println("Failure limit reached; cancelling the remaining runs");
            }
            pb.inc(1);
        })?;
    pb.finish_with_message("done");
    if cancel.is_cancelled() {
        let cancelled = results
            .iter()
            .filter(|r| r.status == RunStatus::Cancelled)
            .count();
        println!("{cancelled} runs were cancelled before finishing");
    }

    if let Some(path) = &args.json {
        write_json(path, &results)?;
    }

    let summaries = summarize(&results, bench.reference, bench.delta);
    println!("\n{}", PerformanceTable::from_summaries(&summaries));
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "lcem",
    about = "Optimizers for latent class models with covariates",
    long_about = "Fits latent class models whose class priors follow a multinomial logit in the \
                 covariates, and compares one-step and three-step EM optimizers across seeds."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a synthetic data set drawn from a known model
    #[command(about = "Simulate an election-style data set (outputs: TSV)")]
    Simulate(SimulateArgs),
    /// Fit one algorithm from one seed
    #[command(about = "Fit a latent class model (outputs: model.toml)")]
    Fit(FitArgs),
    /// Run every algorithm from every seed and tabulate their performance
    #[command(about = "Compare optimizers across seeds")]
    Benchmark(BenchmarkArgs),
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Simulate(args)) => simulate(args),
        Some(Commands::Fit(args)) => fit(args),
        Some(Commands::Benchmark(args)) => benchmark(args),
        None => Cli::command().print_help().map_err(Box::<dyn Error>::from),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
