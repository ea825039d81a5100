use crate::data::Observations;
use crate::em::EstimationError;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::str::FromStr;
use thiserror::Error;

// --- Public Data Structures ---
// These structs define the human-readable format of configuration files and
// fitted models when serialized to TOML.

/// Switch threshold used by `hybrid` when none is given.
pub const DEFAULT_SWITCH_THRESHOLD: f64 = 1e-3;

/// Tolerance used when checking that a table row is a distribution.
pub const DISTRIBUTION_TOLERANCE: f64 = 1e-9;

/// Model parameters: one class-conditional table per item and the prior coefficients.
///
/// `item_probs[j]` is `R x C_j` with rows summing to one. `beta` is `P x R`; column 0
/// belongs to the reference class and is always zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    pub item_probs: Vec<Array2<f64>>,
    pub beta: Array2<f64>,
}

impl Parameters {
    /// Builds parameters after checking table shapes and the reference column.
    pub fn new(item_probs: Vec<Array2<f64>>, beta: Array2<f64>) -> Result<Self, EstimationError> {
        let num_classes = beta.ncols();
        if num_classes < 2 {
            return Err(EstimationError::InvalidConfiguration(format!(
                "at least 2 latent classes are required, got {num_classes}"
            )));
        }
        for (j, table) in item_probs.iter().enumerate() {
            if table.nrows() != num_classes {
                return Err(EstimationError::DimensionMismatch(format!(
                    "item {j} table has {} rows but there are {num_classes} classes",
                    table.nrows()
                )));
            }
            for (r, row) in table.axis_iter(Axis(0)).enumerate() {
                let total: f64 = row.sum();
                if row.iter().any(|&p| !(0.0..=1.0).contains(&p))
                    || (total - 1.0).abs() > DISTRIBUTION_TOLERANCE
                {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "row {r} of item {j} is not a probability distribution (sum {total})"
                    )));
                }
            }
        }
        if beta.column(0).iter().any(|&b| b != 0.0) {
            return Err(EstimationError::InvalidConfiguration(
                "coefficients of the reference class must be zero".to_string(),
            ));
        }
        Ok(Self { item_probs, beta })
    }

    pub fn num_classes(&self) -> usize {
        self.beta.ncols()
    }

    pub fn num_covariates(&self) -> usize {
        self.beta.nrows()
    }

    /// Checks that these parameters describe the same model shape as `data`.
    pub fn check_compatible(&self, data: &Observations) -> Result<(), EstimationError> {
        if self.item_probs.len() != data.num_items() {
            return Err(EstimationError::DimensionMismatch(format!(
                "parameters have {} item tables but the data has {} items",
                self.item_probs.len(),
                data.num_items()
            )));
        }
        for (j, (table, &levels)) in self.item_probs.iter().zip(data.categories()).enumerate() {
            if table.ncols() != levels {
                return Err(EstimationError::DimensionMismatch(format!(
                    "item {j} table has {} levels but the data declares {levels}",
                    table.ncols()
                )));
            }
        }
        if self.num_covariates() != data.num_covariates() {
            return Err(EstimationError::DimensionMismatch(format!(
                "coefficients cover {} design columns but the data has {}",
                self.num_covariates(),
                data.num_covariates()
            )));
        }
        Ok(())
    }
}

/// One of the interchangeable estimation strategies.
///
/// The textual form is used on the command line and in TOML files:
/// `nr`, `nr:<alpha>`, `nested`, `hybrid`, `hybrid:<eps>`, `hybrid:<eps>:<alpha>`,
/// `3step` and `3step-corrected`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Algorithm {
    /// One-step EM with a single damped Newton update of the prior coefficients.
    NewtonRaphson { damping: f64 },
    /// Nested EM with the Pólya-Gamma augmented coefficient update.
    Nested,
    /// Nested EM until the improvement drops below `switch_threshold`, then damped Newton.
    Hybrid { switch_threshold: f64, damping: f64 },
    /// Measurement model, modal assignment, then a logit fit on the hard labels.
    ThreeStepClassical,
    /// As the classical variant but Step 3 corrects for classification error.
    ThreeStepCorrected,
}

impl Algorithm {
    pub fn is_three_step(&self) -> bool {
        matches!(
            self,
            Algorithm::ThreeStepClassical | Algorithm::ThreeStepCorrected
        )
    }

    /// Rejects damping factors outside `(0, 1]` and non-positive switch thresholds.
    pub fn validate(&self) -> Result<(), EstimationError> {
        let check_damping = |damping: f64| {
            if damping > 0.0 && damping <= 1.0 {
                Ok(())
            } else {
                Err(EstimationError::InvalidConfiguration(format!(
                    "damping factor must lie in (0, 1], got {damping}"
                )))
            }
        };
        match *self {
            Algorithm::NewtonRaphson { damping } => check_damping(damping),
            Algorithm::Hybrid {
                switch_threshold,
                damping,
            } => {
                if !(switch_threshold.is_finite() && switch_threshold > 0.0) {
                    return Err(EstimationError::InvalidConfiguration(format!(
                        "switch threshold must be positive, got {switch_threshold}"
                    )));
                }
                check_damping(damping)
            }
            Algorithm::Nested | Algorithm::ThreeStepClassical | Algorithm::ThreeStepCorrected => {
                Ok(())
            }
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Algorithm::NewtonRaphson { damping } if damping == 1.0 => write!(f, "nr"),
            Algorithm::NewtonRaphson { damping } => write!(f, "nr:{damping}"),
            Algorithm::Nested => write!(f, "nested"),
            Algorithm::Hybrid {
                switch_threshold,
                damping,
            } if damping == 1.0 => write!(f, "hybrid:{switch_threshold}"),
            Algorithm::Hybrid {
                switch_threshold,
                damping,
            } => write!(f, "hybrid:{switch_threshold}:{damping}"),
            Algorithm::ThreeStepClassical => write!(f, "3step"),
            Algorithm::ThreeStepCorrected => write!(f, "3step-corrected"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unrecognized algorithm '{0}'. Expected nr[:alpha], nested, hybrid[:eps[:alpha]], 3step or 3step-corrected.")]
pub struct ParseAlgorithmError(String);

impl FromStr for Algorithm {
    type Err = ParseAlgorithmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseAlgorithmError(s.to_string());
        let parse_number = |text: &str| text.parse::<f64>().map_err(|_| invalid());
        let parts: Vec<&str> = s.trim().split(':').collect();
        let algorithm = match parts.as_slice() {
            ["nr"] => Algorithm::NewtonRaphson { damping: 1.0 },
            ["nr", alpha] => Algorithm::NewtonRaphson {
                damping: parse_number(alpha)?,
            },
            ["nested"] => Algorithm::Nested,
            ["hybrid"] => Algorithm::Hybrid {
                switch_threshold: DEFAULT_SWITCH_THRESHOLD,
                damping: 1.0,
            },
            ["hybrid", eps] => Algorithm::Hybrid {
                switch_threshold: parse_number(eps)?,
                damping: 1.0,
            },
            ["hybrid", eps, alpha] => Algorithm::Hybrid {
                switch_threshold: parse_number(eps)?,
                damping: parse_number(alpha)?,
            },
            ["3step"] => Algorithm::ThreeStepClassical,
            ["3step-corrected"] => Algorithm::ThreeStepCorrected,
            _ => return Err(invalid()),
        };
        algorithm.validate().map_err(|_| invalid())?;
        Ok(algorithm)
    }
}

impl From<Algorithm> for String {
    fn from(algorithm: Algorithm) -> Self {
        algorithm.to_string()
    }
}

impl TryFrom<String> for Algorithm {
    type Error = ParseAlgorithmError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Options shared by every run of every algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    pub num_classes: usize,
    /// Hard cap on EM iterations, also the capacity of the convergence trace.
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
    /// A step counts as a decrease only when it loses more than this much log-likelihood.
    pub decrease_tolerance: f64,
    /// Standard deviation of the random starting coefficients.
    pub init_coefficient_scale: f64,
    pub logit_max_iterations: usize,
    pub logit_tolerance: f64,
    /// Wall-clock budget per run in seconds; the run is cancelled once it is exceeded.
    pub time_budget_secs: Option<f64>,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            num_classes: 2,
            max_iterations: 1000,
            convergence_tolerance: 1e-10,
            decrease_tolerance: 1e-8,
            init_coefficient_scale: 0.5,
            logit_max_iterations: 100,
            logit_tolerance: 1e-10,
            time_budget_secs: None,
        }
    }
}

impl FitConfig {
    pub fn with_classes(num_classes: usize) -> Self {
        Self {
            num_classes,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), EstimationError> {
        let fail = |msg: String| Err(EstimationError::InvalidConfiguration(msg));
        if self.num_classes < 2 {
            return fail(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            ));
        }
        if self.max_iterations == 0 {
            return fail("max_iterations must be positive".to_string());
        }
        if self.logit_max_iterations == 0 {
            return fail("logit_max_iterations must be positive".to_string());
        }
        for (name, value) in [
            ("convergence_tolerance", self.convergence_tolerance),
            ("decrease_tolerance", self.decrease_tolerance),
            ("logit_tolerance", self.logit_tolerance),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return fail(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        if !(self.init_coefficient_scale.is_finite() && self.init_coefficient_scale >= 0.0) {
            return fail(format!(
                "init_coefficient_scale must be non-negative, got {}",
                self.init_coefficient_scale
            ));
        }
        if let Some(budget) = self.time_budget_secs {
            if !(budget.is_finite() && budget > 0.0) {
                return fail(format!("time_budget_secs must be positive, got {budget}"));
            }
        }
        Ok(())
    }

    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }
}

/// A fitted model as saved by the `fit` command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FittedModel {
    pub algorithm: Algorithm,
    pub log_likelihood: f64,
    pub config: FitConfig,
    pub parameters: Parameters,
}

/// Custom error type for reading and writing configuration and model files.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write model file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize model to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

impl FittedModel {
    /// Saves the fitted model to a file in a human-readable TOML format.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a fitted model from a TOML file.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let model = toml::from_str(&toml_string)?;
        Ok(model)
    }
}
