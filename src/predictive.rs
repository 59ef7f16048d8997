//! Posterior predictive simulation of bin counts.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Binomial, Distribution};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::BinnedData;
use crate::inference::InferenceResult;
use crate::likelihood::{bin_probabilities, DegenerateError};
use crate::math::{quantile_sorted, sort_floats};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictiveConfig {
    /// Use at most this many posterior samples, evenly spaced.
    pub max_samples: Option<usize>,
    pub seed: u64,
}

impl Default for PredictiveConfig {
    fn default() -> Self {
        Self {
            max_samples: Some(1000),
            seed: 0,
        }
    }
}

/// Synthetic count vectors, one per used posterior sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictiveDraws {
    /// Position of the source sample in `InferenceResult::samples`.
    pub sample_index: Vec<usize>,
    pub counts: Vec<Vec<u64>>,
}

/// Draw from `Multinomial(total, probabilities)` as a sequence of
/// conditional binomials.
pub fn simulate_counts<R: Rng + ?Sized>(probabilities: &[f64], total: u64, rng: &mut R) -> Vec<u64> {
    let mut remaining = total;
    let mut rest: f64 = probabilities.iter().sum();
    let mut out = Vec::with_capacity(probabilities.len());
    for (i, &p) in probabilities.iter().enumerate() {
        if i + 1 == probabilities.len() {
            out.push(remaining);
            break;
        }
        let conditional = if rest > 0. { (p / rest).clamp(0., 1.) } else { 0. };
        let drawn = if remaining == 0 || conditional.is_nan() {
            0
        } else {
            Binomial::new(remaining, conditional).map_or(0, |dist| dist.sample(rng))
        };
        out.push(drawn);
        remaining -= drawn;
        rest -= p;
    }
    out
}

fn thinned_indices(available: usize, max: Option<usize>) -> Vec<usize> {
    match max {
        Some(max) if max < available => (0..max).map(|i| i * available / max).collect(),
        _ => (0..available).collect(),
    }
}

/// Simulate one count vector for every (thinned) posterior sample.
///
/// Sample `i` uses stream `i` of a ChaCha8 generator seeded with
/// `config.seed`, so the output does not depend on scheduling.
pub fn posterior_predictive(
    result: &InferenceResult,
    config: &PredictiveConfig,
) -> Result<PredictiveDraws, DegenerateError> {
    let data = result.data();
    let samples: Vec<_> = result.samples().collect();
    let sample_index = thinned_indices(samples.len(), config.max_samples);
    let counts = sample_index
        .par_iter()
        .map(|&idx| {
            let probabilities = bin_probabilities(&samples[idx].model, data)?;
            let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
            rng.set_stream(idx as u64);
            Ok(simulate_counts(&probabilities, data.total(), &mut rng))
        })
        .collect::<Result<Vec<_>, DegenerateError>>()?;
    Ok(PredictiveDraws {
        sample_index,
        counts,
    })
}

/// Comparison of the predictive distribution of one bin with its observed
/// count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinCheck {
    pub bin: usize,
    pub observed: u64,
    pub mean: f64,
    pub sd: f64,
    /// 2.5% and 97.5% predictive quantiles.
    pub lower: f64,
    pub upper: f64,
    pub covered: bool,
    /// `(mean - observed)` in units of the multinomial standard error of
    /// the observed count.
    pub standardized_residual: f64,
}

pub fn predictive_summary(draws: &PredictiveDraws, data: &BinnedData) -> Vec<BinCheck> {
    let total = data.total() as f64;
    data.counts()
        .as_slice()
        .iter()
        .enumerate()
        .map(|(bin, &observed)| {
            let mut values: Vec<f64> = draws.counts.iter().map(|c| c[bin] as f64).collect();
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let sd = (values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.)).sqrt();
            sort_floats(&mut values);
            let lower = quantile_sorted(&values, 0.025);
            let upper = quantile_sorted(&values, 0.975);

            let share = observed as f64 / total;
            let observed_var = total * share * (1. - share);
            BinCheck {
                bin,
                observed,
                mean,
                sd,
                lower,
                upper,
                covered: (lower..=upper).contains(&(observed as f64)),
                standardized_residual: (mean - observed as f64) / observed_var.max(1.).sqrt(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    #[test]
    fn multinomial_moments() {
        let p = [0.1, 0.0, 0.6, 0.3];
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        let draws: Vec<Vec<u64>> = (0..4000)
            .map(|_| simulate_counts(&p, 500, &mut rng))
            .collect();
        for (i, &p) in p.iter().enumerate() {
            let mean = draws.iter().map(|d| d[i] as f64).sum::<f64>() / 4000.;
            // Standard error of the mean is below 0.2 for every bin.
            assert_abs_diff_eq!(mean, 500. * p, epsilon = 1.);
        }
        assert!(draws.iter().all(|d| d[1] == 0));
    }

    #[test]
    fn thinning() {
        assert_eq!(thinned_indices(10, None), (0..10).collect::<Vec<_>>());
        assert_eq!(thinned_indices(10, Some(20)), (0..10).collect::<Vec<_>>());
        assert_eq!(thinned_indices(10, Some(4)), vec![0, 2, 5, 7]);
    }

    proptest! {
        #[test]
        fn counts_add_up(
            weights in prop::collection::vec(0f64..1., 1..8),
            total in 0u64..100_000,
            seed in any::<u64>(),
        ) {
            let sum: f64 = weights.iter().sum();
            prop_assume!(sum > 0.);
            let p: Vec<f64> = weights.iter().map(|w| w / sum).collect();
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let counts = simulate_counts(&p, total, &mut rng);
            prop_assert_eq!(counts.len(), p.len());
            prop_assert_eq!(counts.iter().sum::<u64>(), total);
            for (c, &p) in counts.iter().zip(&p) {
                if p == 0. {
                    prop_assert_eq!(*c, 0);
                }
            }
        }
    }
}
