//! Bijection between mixture parameters and an unconstrained real vector.
//!
//! Layout of the unconstrained vector for `k` components:
//! `[z_1..z_k | s_1..s_k | y_1..y_{k-1}]` where
//!
//! - `mu_1 = z_1`, `mu_j = mu_{j-1} + exp(z_j)` keeps the means ordered,
//! - `sigma_j = exp(s_j)`,
//! - `w = softmax([y_1, .., y_{k-1}, 0])`.

use itertools::izip;

use crate::data::InputError;
use crate::likelihood::DegenerateError;
use crate::math::logsumexp;
use crate::mixture::{MixtureComponent, MixtureModel};

/// Gradient of a scalar function with respect to the constrained mixture
/// parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ConstrainedGradient {
    pub(crate) mean: Vec<f64>,
    pub(crate) spread: Vec<f64>,
    pub(crate) weight: Vec<f64>,
}

impl ConstrainedGradient {
    pub(crate) fn zeros(k: usize) -> Self {
        Self {
            mean: vec![0.; k],
            spread: vec![0.; k],
            weight: vec![0.; k],
        }
    }

    pub(crate) fn fill_zero(&mut self) {
        self.mean.fill(0.);
        self.spread.fill(0.);
        self.weight.fill(0.);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixtureTransform {
    k: usize,
}

impl MixtureTransform {
    pub fn new(k: usize) -> Result<Self, InputError> {
        if k == 0 {
            return Err(InputError::NoComponents);
        }
        Ok(Self { k })
    }

    pub fn num_components(&self) -> usize {
        self.k
    }

    /// Length of the unconstrained vector.
    pub fn dim(&self) -> usize {
        3 * self.k - 1
    }

    fn split<'a>(&self, position: &'a [f64]) -> (&'a [f64], &'a [f64], &'a [f64]) {
        assert!(position.len() == self.dim());
        let (means, rest) = position.split_at(self.k);
        let (spreads, ratios) = rest.split_at(self.k);
        (means, spreads, ratios)
    }

    /// `log(w_j)` for every component, computed from the log-ratios without
    /// going through `w`.
    pub fn log_weights(&self, position: &[f64]) -> Vec<f64> {
        let (_, _, ratios) = self.split(position);
        let mut log_w: Vec<f64> = ratios.iter().copied().chain(std::iter::once(0.)).collect();
        let norm = logsumexp(&log_w);
        log_w.iter_mut().for_each(|y| *y -= norm);
        log_w
    }

    pub fn to_constrained(&self, position: &[f64]) -> Result<MixtureModel, DegenerateError> {
        let (z, s, _) = self.split(position);
        let log_w = self.log_weights(position);

        let mut components = Vec::with_capacity(self.k);
        let mut mean = 0f64;
        for (j, (&z, &s, &log_w)) in izip!(z, s, &log_w).enumerate() {
            mean = if j == 0 { z } else { mean + z.exp() };
            let spread = s.exp();
            if !mean.is_finite() || !(spread.is_finite() && spread > 0.) {
                return Err(DegenerateError::InvalidParameters { component: j });
            }
            components.push(MixtureComponent::new(mean, spread, log_w.exp()));
        }
        Ok(MixtureModel::from_normalized(components))
    }

    pub fn to_unconstrained(&self, model: &MixtureModel) -> Result<Vec<f64>, InputError> {
        if model.num_components() != self.k {
            return Err(InputError::InvalidComponent {
                index: model.num_components().min(self.k),
                reason: "model has a different number of components",
            });
        }
        let components = model.components();
        for (index, pair) in components.windows(2).enumerate() {
            if pair[1].mean <= pair[0].mean {
                return Err(InputError::InvalidComponent {
                    index: index + 1,
                    reason: "means must be strictly increasing",
                });
            }
        }
        if let Some(index) = components.iter().position(|c| !(c.weight > 0.)) {
            return Err(InputError::InvalidComponent {
                index,
                reason: "weight must be positive to be represented",
            });
        }

        let mut out = Vec::with_capacity(self.dim());
        out.extend(components.iter().enumerate().map(|(j, c)| {
            if j == 0 {
                c.mean
            } else {
                (c.mean - components[j - 1].mean).ln()
            }
        }));
        out.extend(components.iter().map(|c| c.spread.ln()));
        let log_last = components[self.k - 1].weight.ln();
        out.extend(
            components[..self.k - 1]
                .iter()
                .map(|c| c.weight.ln() - log_last),
        );
        Ok(out)
    }

    /// `log |det J|` of the map from the unconstrained vector to the
    /// constrained parameters.
    pub fn log_jacobian(&self, position: &[f64]) -> f64 {
        let (z, s, _) = self.split(position);
        let ordered: f64 = z.iter().skip(1).sum();
        let spreads: f64 = s.iter().sum();
        let simplex: f64 = self.log_weights(position).iter().sum();
        ordered + spreads + simplex
    }

    /// Map `constrained` to the unconstrained coordinates and add the
    /// gradient of `log_jacobian`. Overwrites `out`.
    pub(crate) fn pullback_gradient(
        &self,
        position: &[f64],
        model: &MixtureModel,
        constrained: &ConstrainedGradient,
        out: &mut [f64],
    ) {
        let k = self.k;
        let (z, _, _) = self.split(position);
        assert!(out.len() == self.dim());

        // d mu_j / d z_i = exp(z_i) for j >= i > 1, and 1 for i = 1.
        let mut suffix = 0f64;
        for i in (0..k).rev() {
            suffix += constrained.mean[i];
            out[i] = if i == 0 { suffix } else { z[i].exp() * suffix + 1. };
        }

        for (out, (c, &g)) in out[k..2 * k]
            .iter_mut()
            .zip(model.components().iter().zip(&constrained.spread))
        {
            *out = g * c.spread + 1.;
        }

        let weights: Vec<f64> = model.weights().collect();
        let weighted: f64 = weights.iter().zip(&constrained.weight).map(|(w, g)| w * g).sum();
        for (i, out) in out[2 * k..].iter_mut().enumerate() {
            let w = weights[i];
            *out = w * (constrained.weight[i] - weighted) + 1. - k as f64 * w;
        }
    }
}
