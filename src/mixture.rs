use serde::{Deserialize, Serialize};

use crate::data::InputError;
use crate::math::{log_ndtr, log_ndtr_sf, logsumexp, norm_logpdf};

/// One Normal component of the latent score distribution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MixtureComponent {
    pub mean: f64,
    pub spread: f64,
    pub weight: f64,
}

impl MixtureComponent {
    pub fn new(mean: f64, spread: f64, weight: f64) -> Self {
        Self {
            mean,
            spread,
            weight,
        }
    }

    #[inline]
    fn standardize(&self, x: f64) -> f64 {
        (x - self.mean) / self.spread
    }

    #[inline]
    fn log_weight(&self) -> f64 {
        self.weight.ln()
    }
}

/// A finite mixture of Normal components whose weights sum to one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MixtureModel {
    components: Vec<MixtureComponent>,
}

impl MixtureModel {
    /// Validate the components and normalise their weights.
    pub fn new(components: impl Into<Vec<MixtureComponent>>) -> Result<Self, InputError> {
        let mut components: Vec<MixtureComponent> = components.into();
        if components.is_empty() {
            return Err(InputError::NoComponents);
        }
        for (index, c) in components.iter().enumerate() {
            if !c.mean.is_finite() {
                return Err(InputError::InvalidComponent {
                    index,
                    reason: "mean must be finite",
                });
            }
            if !(c.spread.is_finite() && c.spread > 0.) {
                return Err(InputError::InvalidComponent {
                    index,
                    reason: "spread must be finite and positive",
                });
            }
            if !(c.weight.is_finite() && c.weight >= 0.) {
                return Err(InputError::InvalidComponent {
                    index,
                    reason: "weight must be finite and non-negative",
                });
            }
        }
        let total: f64 = components.iter().map(|c| c.weight).sum();
        if !(total > 0.) {
            return Err(InputError::InvalidComponent {
                index: 0,
                reason: "weights must not all be zero",
            });
        }
        components.iter_mut().for_each(|c| c.weight /= total);
        Ok(Self { components })
    }

    /// Build a model from parallel slices of means, spreads and weights.
    pub fn from_parts(means: &[f64], spreads: &[f64], weights: &[f64]) -> Result<Self, InputError> {
        if means.len() != spreads.len() || means.len() != weights.len() {
            return Err(InputError::InvalidComponent {
                index: means.len().min(spreads.len()).min(weights.len()),
                reason: "means, spreads and weights differ in length",
            });
        }
        Self::new(
            itertools::izip!(means, spreads, weights)
                .map(|(&m, &s, &w)| MixtureComponent::new(m, s, w))
                .collect::<Vec<_>>(),
        )
    }

    /// Components that are already known to be valid and normalised.
    pub(crate) fn from_normalized(components: Vec<MixtureComponent>) -> Self {
        debug_assert!(!components.is_empty());
        Self { components }
    }

    pub fn components(&self) -> &[MixtureComponent] {
        &self.components
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn means(&self) -> impl ExactSizeIterator<Item = f64> + '_ {
        self.components.iter().map(|c| c.mean)
    }

    pub fn spreads(&self) -> impl ExactSizeIterator<Item = f64> + '_ {
        self.components.iter().map(|c| c.spread)
    }

    pub fn weights(&self) -> impl ExactSizeIterator<Item = f64> + '_ {
        self.components.iter().map(|c| c.weight)
    }

    fn mix(&self, per_component: impl Fn(&MixtureComponent) -> f64) -> f64 {
        let terms: Vec<f64> = self
            .components
            .iter()
            .map(|c| c.log_weight() + per_component(c))
            .collect();
        logsumexp(&terms)
    }

    pub fn log_pdf(&self, x: f64) -> f64 {
        self.mix(|c| norm_logpdf(c.standardize(x)) - c.spread.ln())
    }

    pub fn pdf(&self, x: f64) -> f64 {
        self.log_pdf(x).exp()
    }

    pub fn log_cdf(&self, x: f64) -> f64 {
        self.mix(|c| log_ndtr(c.standardize(x)))
    }

    /// `log(1 - CDF(x))`, accurate in the upper tail.
    pub fn log_sf(&self, x: f64) -> f64 {
        self.mix(|c| log_ndtr_sf(c.standardize(x)))
    }

    pub fn cdf(&self, x: f64) -> f64 {
        self.log_cdf(x).exp()
    }

    pub fn sf(&self, x: f64) -> f64 {
        self.log_sf(x).exp()
    }

    /// Evaluate `log_cdf` at many points.
    pub fn log_cdf_many(&self, points: &[f64]) -> Vec<f64> {
        self.many(points, log_ndtr)
    }

    /// Evaluate `log_pdf` at many points.
    pub fn log_pdf_many(&self, points: &[f64]) -> Vec<f64> {
        let log_spreads: Vec<f64> = self.spreads().map(f64::ln).collect();
        let mut terms = vec![0f64; self.components.len()];
        points
            .iter()
            .map(|&x| {
                for ((term, c), log_spread) in terms.iter_mut().zip(&self.components).zip(&log_spreads) {
                    *term = c.log_weight() + norm_logpdf(c.standardize(x)) - log_spread;
                }
                logsumexp(&terms)
            })
            .collect()
    }

    fn many(&self, points: &[f64], per_point: impl Fn(f64) -> f64) -> Vec<f64> {
        let log_weights: Vec<f64> = self.components.iter().map(|c| c.log_weight()).collect();
        let mut terms = vec![0f64; self.components.len()];
        points
            .iter()
            .map(|&x| {
                for ((term, c), log_weight) in terms.iter_mut().zip(&self.components).zip(&log_weights) {
                    *term = log_weight + per_point(c.standardize(x));
                }
                logsumexp(&terms)
            })
            .collect()
    }

    pub fn mean(&self) -> f64 {
        self.components.iter().map(|c| c.weight * c.mean).sum()
    }

    pub fn variance(&self) -> f64 {
        let mean = self.mean();
        self.components
            .iter()
            .map(|c| c.weight * (c.spread * c.spread + (c.mean - mean).powi(2)))
            .sum()
    }

    /// Density on `n` evenly spaced points in `[lo, hi]`.
    pub fn density_grid(&self, lo: f64, hi: f64, n: usize) -> Vec<(f64, f64)> {
        if n == 0 {
            return vec![];
        }
        if n == 1 {
            return vec![(lo, self.pdf(lo))];
        }
        let step = (hi - lo) / (n - 1) as f64;
        let points: Vec<f64> = (0..n).map(|i| lo + step * i as f64).collect();
        let log_density = self.log_pdf_many(&points);
        points
            .into_iter()
            .zip(log_density)
            .map(|(x, lp)| (x, lp.exp()))
            .collect()
    }
}

impl<'de> Deserialize<'de> for MixtureModel {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            components: Vec<MixtureComponent>,
        }
        let raw = Raw::deserialize(deserializer)?;
        MixtureModel::new(raw.components).map_err(serde::de::Error::custom)
    }
}
