//! Synthetic data from a known latent class model.

use crate::data::Observations;
use crate::em::EstimationError;
use crate::likelihood::prior_probabilities;
use crate::model::Parameters;
use ndarray::{Array2, ArrayView2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::distributions::{Distribution, Uniform, WeightedError, WeightedIndex};
use rand_distr::Normal;

/// Extra mass placed on each class's preferred level when drawing true tables.
const PREFERRED_LEVEL_MASS: f64 = 1.0;

/// Shape and scale of a simulated data set.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub num_units: usize,
    pub num_classes: usize,
    pub categories: Vec<usize>,
    /// Standard deviation of the true prior coefficients.
    pub coefficient_scale: f64,
}

impl Scenario {
    /// Three classes, twelve items alternating between four and two levels, and
    /// 1785 units with a seven-point ordinal covariate.
    pub fn election_like() -> Self {
        Self {
            num_units: 1785,
            num_classes: 3,
            categories: (0..12).map(|j| if j % 2 == 0 { 4 } else { 2 }).collect(),
            coefficient_scale: 0.5,
        }
    }

    /// Draws true parameters and a data set from them.
    pub fn generate(&self, seed: u64) -> Result<(Observations, Parameters), EstimationError> {
        if self.num_classes < 2 || self.num_units == 0 || self.categories.is_empty() {
            return Err(EstimationError::InvalidConfiguration(format!(
                "scenario needs at least 2 classes, 1 unit and 1 item; got {:?}",
                self
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let truth = self.true_parameters(&mut rng)?;
        let covariates = ordinal_design(self.num_units, &mut rng);
        let responses = sample_responses(&truth, covariates.view(), &mut rng)?;
        let data = Observations::new(responses, self.categories.clone(), covariates)?;
        log::info!(
            "Simulated {} units, {} items, {} classes (seed {seed})",
            self.num_units,
            self.categories.len(),
            self.num_classes
        );
        Ok((data, truth))
    }

    /// Well-separated tables and moderate coefficients.
    ///
    /// In item `j` class `r` prefers level `(r + j) mod C_j`, which keeps the
    /// classes apart even on binary items.
    pub fn true_parameters<R: rand::Rng>(
        &self,
        rng: &mut R,
    ) -> Result<Parameters, EstimationError> {
        let noise = Uniform::new(0.05, 0.3);
        let item_probs = self
            .categories
            .iter()
            .enumerate()
            .map(|(j, &levels)| {
                let mut table = Array2::from_shape_fn((self.num_classes, levels), |(r, c)| {
                    let base = noise.sample(&mut *rng);
                    if c == (r + j) % levels {
                        base + PREFERRED_LEVEL_MASS
                    } else {
                        base
                    }
                });
                for mut row in table.rows_mut() {
                    let total = row.sum();
                    row /= total;
                }
                table
            })
            .collect();
        let normal = Normal::new(0.0, self.coefficient_scale)
            .map_err(|e| EstimationError::InvalidConfiguration(e.to_string()))?;
        let beta = Array2::from_shape_fn((2, self.num_classes), |(_, r)| {
            if r == 0 { 0.0 } else { normal.sample(&mut *rng) }
        });
        Parameters::new(item_probs, beta)
    }
}

/// Intercept plus a score on 1..=7 centered at 4.
pub fn ordinal_design<R: rand::Rng>(num_units: usize, rng: &mut R) -> Array2<f64> {
    let score = Uniform::new_inclusive(1_i32, 7);
    Array2::from_shape_fn((num_units, 2), |(_, c)| {
        if c == 0 {
            1.0
        } else {
            f64::from(score.sample(&mut *rng) - 4)
        }
    })
}

/// Draws a class for each unit from its prior, then each item from its table.
pub fn sample_responses<R: rand::Rng>(
    truth: &Parameters,
    covariates: ArrayView2<f64>,
    rng: &mut R,
) -> Result<Array2<usize>, EstimationError> {
    let priors = prior_probabilities(truth.beta.view(), covariates)?;
    let invalid = |e: WeightedError| EstimationError::InvalidConfiguration(e.to_string());
    let item_samplers = truth
        .item_probs
        .iter()
        .map(|table| {
            table
                .axis_iter(Axis(0))
                .map(|row| WeightedIndex::new(row.iter()).map_err(invalid))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut responses = Array2::<usize>::zeros((covariates.nrows(), truth.item_probs.len()));
    for (mut out, prior) in responses.axis_iter_mut(Axis(0)).zip(priors.axis_iter(Axis(0))) {
        let class = WeightedIndex::new(prior.iter()).map_err(invalid)?.sample(rng);
        for (slot, samplers) in out.iter_mut().zip(&item_samplers) {
            *slot = samplers[class].sample(rng);
        }
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_election_scenario_shape() {
        let scenario = Scenario::election_like();
        let (data, truth) = scenario.generate(1).unwrap();
        assert_eq!(data.num_units(), 1785);
        assert_eq!(data.num_items(), 12);
        assert_eq!(data.categories()[0], 4);
        assert_eq!(data.categories()[1], 2);
        assert_eq!(truth.num_classes(), 3);
        let scores = data.covariates().column(1).to_owned();
        assert!(scores.iter().all(|&s| (-3.0..=3.0).contains(&s) && s.fract() == 0.0));
    }

    #[test]
    fn test_generation_is_reproducible() {
        let scenario = Scenario {
            num_units: 50,
            ..Scenario::election_like()
        };
        let (a, truth_a) = scenario.generate(9).unwrap();
        let (b, truth_b) = scenario.generate(9).unwrap();
        assert_eq!(a, b);
        assert_eq!(truth_a, truth_b);
    }

    #[test]
    fn test_empirical_frequencies_follow_tables() {
        let scenario = Scenario {
            num_units: 20000,
            num_classes: 2,
            categories: vec![2],
            coefficient_scale: 0.0,
        };
        let (data, truth) = scenario.generate(3).unwrap();
        // Equal priors, so the marginal of the item is the average of the two rows.
        let expected = (truth.item_probs[0][[0, 1]] + truth.item_probs[0][[1, 1]]) / 2.0;
        let observed =
            data.item(0).iter().filter(|&&c| c == 1).count() as f64 / data.num_units() as f64;
        assert_abs_diff_eq!(observed, expected, epsilon = 0.02);
    }
}
