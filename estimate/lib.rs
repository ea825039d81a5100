#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod augmented;
pub mod batch;
pub mod data;
pub mod em;
pub mod hybrid;
pub mod likelihood;
pub mod logit;
pub mod model;
pub mod mstep;
pub mod newton;
pub mod seeding;
pub mod simulate;
pub mod three_step;
pub mod trace;

#[path = "../diagnose/mod.rs"]
pub mod diagnose;

pub use batch::{RunResult, RunSpec, run_batch, run_batch_with_progress, run_one};
pub use data::{DataError, Observations, load_observations};
pub use em::{CancellationFlag, Deadline, EstimationError, FailureKind, RunStatus};
pub use model::{Algorithm, FitConfig, FittedModel, Parameters};
