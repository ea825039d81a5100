//! Seeded random starting points.
//!
//! The tables are drawn before the coefficients from the same stream, so every
//! algorithm started from a given seed sees the same starting tables.

use crate::data::Observations;
use crate::em::EstimationError;
use crate::model::{FitConfig, Parameters};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::distributions::{Distribution, Uniform};
use rand_distr::Normal;

/// Random class-conditional tables: uniform draws on `[0.01, 1]`, row-normalized.
pub fn random_tables<R: rand::Rng>(
    categories: &[usize],
    num_classes: usize,
    rng: &mut R,
) -> Vec<Array2<f64>> {
    let cell = Uniform::new_inclusive(0.01, 1.0);
    categories
        .iter()
        .map(|&levels| {
            let mut table = Array2::from_shape_fn((num_classes, levels), |_| cell.sample(&mut *rng));
            for mut row in table.rows_mut() {
                let total = row.sum();
                row /= total;
            }
            table
        })
        .collect()
}

/// Random prior coefficients with independent `N(0, scale^2)` free entries.
pub fn random_coefficients<R: rand::Rng>(
    num_covariates: usize,
    num_classes: usize,
    scale: f64,
    rng: &mut R,
) -> Result<Array2<f64>, EstimationError> {
    let normal = Normal::new(0.0, scale)
        .map_err(|e| EstimationError::InvalidConfiguration(format!("coefficient scale: {e}")))?;
    Ok(Array2::from_shape_fn(
        (num_covariates, num_classes),
        |(_, r)| if r == 0 { 0.0 } else { normal.sample(&mut *rng) },
    ))
}

/// Starting parameters for one run.
pub fn initial_parameters(
    data: &Observations,
    config: &FitConfig,
    seed: u64,
) -> Result<Parameters, EstimationError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let item_probs = random_tables(data.categories(), config.num_classes, &mut rng);
    let beta = random_coefficients(
        data.num_covariates(),
        config.num_classes,
        config.init_coefficient_scale,
        &mut rng,
    )?;
    Ok(Parameters { item_probs, beta })
}
