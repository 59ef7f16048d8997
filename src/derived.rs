//! Quantities derived from posterior samples: tail probabilities, the
//! implied number of observations above a threshold and parameter
//! summaries.

use rayon::prelude::*;
use serde::Serialize;

use crate::data::BinnedData;
use crate::inference::InferenceResult;
use crate::math::{log_diff_exp, quantile_sorted, sort_floats};
use crate::mixture::MixtureModel;

pub const DEFAULT_QUANTILES: [f64; 3] = [0.025, 0.5, 0.975];

/// `log P(a < X <= b)`, differencing whichever tail keeps precision.
fn log_interval_mass(model: &MixtureModel, a: f64, b: f64) -> f64 {
    if model.log_cdf(b) < -std::f64::consts::LN_2 {
        log_diff_exp(model.log_cdf(b), model.log_cdf(a))
    } else {
        log_diff_exp(model.log_sf(a), model.log_sf(b))
    }
}

/// Probability that a score exceeds `threshold`.
///
/// With closed boundaries the latent distribution is truncated to the
/// outer cutpoints, so thresholds outside them give exactly 0 or 1.
pub fn tail_probability(model: &MixtureModel, data: &BinnedData, threshold: f64) -> f64 {
    match data.closed_range() {
        None => model.sf(threshold),
        Some((lo, hi)) => {
            if threshold <= lo {
                1.
            } else if threshold >= hi {
                0.
            } else {
                let inside = log_interval_mass(model, lo, hi);
                let above = log_interval_mass(model, threshold, hi);
                (above - inside).exp().clamp(0., 1.)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QuantileValue {
    pub q: f64,
    pub value: f64,
}

/// Mean, standard deviation and quantiles of a set of draws.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub sd: f64,
    pub quantiles: Vec<QuantileValue>,
}

impl Summary {
    pub fn from_values(values: &[f64], quantiles: &[f64]) -> Summary {
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let sd = if values.len() > 1 {
            (values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.)).sqrt()
        } else {
            f64::NAN
        };
        let mut sorted = values.to_vec();
        sort_floats(&mut sorted);
        let quantiles = quantiles
            .iter()
            .map(|&q| QuantileValue {
                q,
                value: quantile_sorted(&sorted, q),
            })
            .collect();
        Summary {
            mean,
            sd,
            quantiles,
        }
    }

    /// Value of the quantile `q`, if it was requested.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.quantiles
            .iter()
            .find(|v| (v.q - q).abs() < 1e-12)
            .map(|v| v.value)
    }

    pub fn median(&self) -> Option<f64> {
        self.quantile(0.5)
    }
}

/// Posterior of the share and the number of observations above a threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TailEstimate {
    pub threshold: f64,
    /// Total number of observations the counts are scaled to.
    pub population: u64,
    /// Tail probability of every post-warmup sample, chain by chain.
    pub probabilities: Vec<f64>,
    /// `probabilities` scaled by the population.
    pub counts: Vec<f64>,
    pub probability: Summary,
    pub count: Summary,
}

/// Tail probability and count above `threshold` for all post-warmup
/// samples of all chains.
pub fn estimate_tail(result: &InferenceResult, threshold: f64, quantiles: &[f64]) -> TailEstimate {
    let data = result.data();
    let population = data.total();
    let probabilities: Vec<f64> = result
        .samples()
        .map(|s| tail_probability(&s.model, data, threshold))
        .collect();
    let counts: Vec<f64> = probabilities
        .iter()
        .map(|p| p * population as f64)
        .collect();
    TailEstimate {
        threshold,
        population,
        probability: Summary::from_values(&probabilities, quantiles),
        count: Summary::from_values(&counts, quantiles),
        probabilities,
        counts,
    }
}

/// `estimate_tail` for many thresholds with the default quantiles.
pub fn tail_curve(result: &InferenceResult, thresholds: &[f64]) -> Vec<TailEstimate> {
    thresholds
        .par_iter()
        .map(|&t| estimate_tail(result, t, &DEFAULT_QUANTILES))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSummary {
    pub name: String,
    pub summary: Summary,
}

/// Summaries of every component mean, spread and weight.
pub fn parameter_summary(result: &InferenceResult, quantiles: &[f64]) -> Vec<ParameterSummary> {
    let k = result.config().num_components;
    let samples: Vec<&MixtureModel> = result.samples().map(|s| &s.model).collect();
    let column = |f: &dyn Fn(&MixtureModel) -> f64| -> Vec<f64> {
        samples.iter().map(|m| f(m)).collect()
    };

    let mut out = Vec::with_capacity(3 * k);
    for j in 0..k {
        let means = column(&|m| m.components()[j].mean);
        out.push(ParameterSummary {
            name: format!("mean[{}]", j),
            summary: Summary::from_values(&means, quantiles),
        });
    }
    for j in 0..k {
        let spreads = column(&|m| m.components()[j].spread);
        out.push(ParameterSummary {
            name: format!("spread[{}]", j),
            summary: Summary::from_values(&spreads, quantiles),
        });
    }
    for j in 0..k {
        let weights = column(&|m| m.components()[j].weight);
        out.push(ParameterSummary {
            name: format!("weight[{}]", j),
            summary: Summary::from_values(&weights, quantiles),
        });
    }
    out
}
