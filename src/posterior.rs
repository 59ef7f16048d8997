//! Log posterior density of the mixture parameters on the unconstrained
//! space, together with its gradient.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

use crate::cpu_potential::CpuLogpFunc;
use crate::data::{BinnedData, InputError};
use crate::likelihood::{log_likelihood_grad, DegenerateError};
use crate::math::LN_SQRT_2PI;
use crate::mixture::MixtureModel;
use crate::transform::{ConstrainedGradient, MixtureTransform};

/// Dirichlet concentration of the weight prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Concentration {
    Symmetric(f64),
    PerComponent(Vec<f64>),
}

impl Default for Concentration {
    fn default() -> Self {
        Concentration::Symmetric(2.)
    }
}

/// Prior hyperparameters as configured by the user.
///
/// Missing location and scales are derived from the finite range of the
/// cutpoints when the priors are resolved against the data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// Location of the Normal prior on every component mean.
    pub mean_loc: Option<f64>,
    /// Scale of the Normal prior on every component mean.
    pub mean_scale: Option<f64>,
    /// Scale of the half-Normal prior on every component spread.
    pub spread_scale: Option<f64>,
    pub weight_concentration: Concentration,
}

/// Fully specified priors for a model with a fixed number of components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Priors {
    pub mean_loc: f64,
    pub mean_scale: f64,
    pub spread_scale: f64,
    pub concentration: Vec<f64>,
    #[serde(skip)]
    dirichlet_log_norm: f64,
}

fn positive(value: f64, what: &'static str) -> Result<f64, InputError> {
    if value.is_finite() && value > 0. {
        Ok(value)
    } else {
        Err(InputError::InvalidPrior(what))
    }
}

impl PriorConfig {
    pub fn resolve(&self, data: &BinnedData, k: usize) -> Result<Priors, InputError> {
        if k == 0 {
            return Err(InputError::NoComponents);
        }
        let range = data
            .cutpoints()
            .finite_range()
            .filter(|(lo, hi)| hi > lo);
        let centre = range.map(|(lo, hi)| 0.5 * (lo + hi));
        let half_width = range.map(|(lo, hi)| 0.5 * (hi - lo));

        let mean_loc = self.mean_loc.or(centre).ok_or(InputError::InvalidPrior(
            "mean_loc must be given when the cutpoints span no finite range",
        ))?;
        if !mean_loc.is_finite() {
            return Err(InputError::InvalidPrior("mean_loc must be finite"));
        }
        let mean_scale = self.mean_scale.or(half_width).ok_or(InputError::InvalidPrior(
            "mean_scale must be given when the cutpoints span no finite range",
        ))?;
        let mean_scale = positive(mean_scale, "mean_scale must be positive and finite")?;
        let spread_scale = self.spread_scale.or(half_width).ok_or(InputError::InvalidPrior(
            "spread_scale must be given when the cutpoints span no finite range",
        ))?;
        let spread_scale = positive(spread_scale, "spread_scale must be positive and finite")?;

        let concentration = match &self.weight_concentration {
            Concentration::Symmetric(alpha) => vec![*alpha; k],
            Concentration::PerComponent(alpha) => {
                if alpha.len() != k {
                    return Err(InputError::InvalidPrior(
                        "one weight concentration per component is required",
                    ));
                }
                alpha.clone()
            }
        };
        for &alpha in concentration.iter() {
            positive(alpha, "weight concentrations must be positive and finite")?;
        }
        let dirichlet_log_norm = ln_gamma(concentration.iter().sum())
            - concentration.iter().map(|&a| ln_gamma(a)).sum::<f64>();

        Ok(Priors {
            mean_loc,
            mean_scale,
            spread_scale,
            concentration,
            dirichlet_log_norm,
        })
    }
}

impl Priors {
    /// Log density of the Normal and half-Normal priors on means and
    /// spreads. Their gradient is added to `grad`.
    fn location_scale_logp(&self, model: &MixtureModel, grad: &mut ConstrainedGradient) -> f64 {
        let mut logp = 0f64;
        let mean_var = self.mean_scale * self.mean_scale;
        let spread_var = self.spread_scale * self.spread_scale;
        for (j, c) in model.components().iter().enumerate() {
            let dm = c.mean - self.mean_loc;
            logp -= 0.5 * dm * dm / mean_var + self.mean_scale.ln() + LN_SQRT_2PI;
            grad.mean[j] -= dm / mean_var;

            logp += std::f64::consts::LN_2
                - 0.5 * c.spread * c.spread / spread_var
                - self.spread_scale.ln()
                - LN_SQRT_2PI;
            grad.spread[j] -= c.spread / spread_var;
        }
        logp
    }

    /// Log density of the Dirichlet prior given `log(w)`.
    ///
    /// The gradient is taken directly with respect to the weight log-ratios
    /// and added to `grad`, which holds one entry per free ratio.
    fn dirichlet_logp(&self, log_weights: &[f64], grad: &mut [f64]) -> f64 {
        let excess: f64 = self.concentration.iter().map(|a| a - 1.).sum();
        let mut logp = self.dirichlet_log_norm;
        for (i, (&alpha, &log_w)) in self.concentration.iter().zip(log_weights).enumerate() {
            logp += (alpha - 1.) * log_w;
            if let Some(grad) = grad.get_mut(i) {
                *grad += (alpha - 1.) - log_w.exp() * excess;
            }
        }
        logp
    }
}

/// The posterior of a mixture model given binned counts, evaluated on the
/// unconstrained parameter space.
///
/// Holds the data and priors behind `Arc`s, so cloning it for every chain
/// is cheap. The only mutable state is a gradient buffer owned by each
/// clone.
#[derive(Debug, Clone)]
pub struct MixturePosterior {
    data: Arc<BinnedData>,
    priors: Arc<Priors>,
    transform: MixtureTransform,
    scratch: ConstrainedGradient,
}

impl MixturePosterior {
    pub fn new(data: Arc<BinnedData>, priors: Arc<Priors>, k: usize) -> Result<Self, InputError> {
        let transform = MixtureTransform::new(k)?;
        if priors.concentration.len() != k {
            return Err(InputError::InvalidPrior(
                "priors were resolved for a different number of components",
            ));
        }
        Ok(Self {
            data,
            priors,
            transform,
            scratch: ConstrainedGradient::zeros(k),
        })
    }

    pub fn data(&self) -> &BinnedData {
        &self.data
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub fn transform(&self) -> &MixtureTransform {
        &self.transform
    }

    /// Log posterior density at `position`, up to the evidence.
    pub fn log_density(&self, position: &[f64]) -> Result<f64, DegenerateError> {
        let mut grad = vec![0f64; self.transform.dim()];
        self.log_density_and_grad(position, &mut grad)
    }

    /// Log posterior density at `position`. Its gradient is written to
    /// `grad`.
    pub fn log_density_and_grad(
        &self,
        position: &[f64],
        grad: &mut [f64],
    ) -> Result<f64, DegenerateError> {
        let mut scratch = ConstrainedGradient::zeros(self.transform.num_components());
        evaluate(&self.data, &self.priors, &self.transform, position, grad, &mut scratch)
    }
}

fn evaluate(
    data: &BinnedData,
    priors: &Priors,
    transform: &MixtureTransform,
    position: &[f64],
    grad: &mut [f64],
    scratch: &mut ConstrainedGradient,
) -> Result<f64, DegenerateError> {
    let k = transform.num_components();
    let model = transform.to_constrained(position)?;

    scratch.fill_zero();
    let mut logp = log_likelihood_grad(&model, data, scratch)?;
    logp += priors.location_scale_logp(&model, scratch);
    transform.pullback_gradient(position, &model, scratch, grad);
    logp += transform.log_jacobian(position);
    logp += priors.dirichlet_logp(&transform.log_weights(position), &mut grad[2 * k..]);

    if !logp.is_finite() {
        return Err(DegenerateError::NonFiniteLogp);
    }
    if let Some(index) = grad.iter().position(|g| !g.is_finite()) {
        return Err(DegenerateError::NonFiniteGradient { index });
    }
    Ok(logp)
}

impl CpuLogpFunc for MixturePosterior {
    type LogpError = DegenerateError;

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, DegenerateError> {
        evaluate(
            &self.data,
            &self.priors,
            &self.transform,
            position,
            grad,
            &mut self.scratch,
        )
    }

    fn dim(&self) -> usize {
        self.transform.dim()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BoundaryPolicy;
    use crate::likelihood::log_likelihood;
    use crate::mixture::MixtureModel;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use statrs::distribution::{Continuous, Normal};

    fn scenario(policy: BoundaryPolicy) -> Arc<BinnedData> {
        Arc::new(
            BinnedData::from_raw(
                &[300., 350., 400., 450., 500., 1200.],
                &[8452, 22069, 53684, 14439, 34892],
                policy,
            )
            .unwrap(),
        )
    }

    fn posterior(policy: BoundaryPolicy, k: usize) -> MixturePosterior {
        let data = scenario(policy);
        let priors = PriorConfig::default().resolve(&data, k).unwrap();
        MixturePosterior::new(data, Arc::new(priors), k).unwrap()
    }

    #[test]
    fn default_priors_follow_data_range() {
        let data = scenario(BoundaryPolicy::Open);
        let priors = PriorConfig::default().resolve(&data, 3).unwrap();
        assert_eq!(priors.mean_loc, 750.);
        assert_eq!(priors.mean_scale, 450.);
        assert_eq!(priors.spread_scale, 450.);
        assert_eq!(priors.concentration, vec![2.; 3]);
    }

    #[test]
    fn invalid_priors_are_rejected() {
        let data = scenario(BoundaryPolicy::Open);
        let config = PriorConfig {
            mean_scale: Some(-1.),
            ..Default::default()
        };
        assert!(matches!(
            config.resolve(&data, 2),
            Err(InputError::InvalidPrior(_))
        ));

        let config = PriorConfig {
            weight_concentration: Concentration::PerComponent(vec![1., 1.]),
            ..Default::default()
        };
        assert!(config.resolve(&data, 3).is_err());
        assert!(config.resolve(&data, 2).is_ok());

        let unbounded =
            BinnedData::from_raw(&[f64::NEG_INFINITY, 0., f64::INFINITY], &[3, 4], BoundaryPolicy::Open)
                .unwrap();
        assert!(PriorConfig::default().resolve(&unbounded, 2).is_err());
        let config = PriorConfig {
            mean_loc: Some(0.),
            mean_scale: Some(1.),
            spread_scale: Some(1.),
            ..Default::default()
        };
        assert!(config.resolve(&unbounded, 2).is_ok());
    }

    #[test]
    fn density_matches_components() {
        let post = posterior(BoundaryPolicy::Open, 2);
        let model = MixtureModel::from_parts(&[380., 470.], &[40., 60.], &[0.7, 0.3]).unwrap();
        let position = post.transform().to_unconstrained(&model).unwrap();

        let priors = post.priors();
        let mean_prior = Normal::new(priors.mean_loc, priors.mean_scale).unwrap();
        let spread_prior = Normal::new(0., priors.spread_scale).unwrap();
        let mut expected = log_likelihood(&model, post.data()).unwrap();
        for c in model.components() {
            expected += mean_prior.ln_pdf(c.mean);
            expected += std::f64::consts::LN_2 + spread_prior.ln_pdf(c.spread);
        }
        // Dirichlet(2, 2) has density 6 w1 w2.
        expected += 6f64.ln() + 0.7f64.ln() + 0.3f64.ln();
        expected += post.transform().log_jacobian(&position);

        assert_abs_diff_eq!(post.log_density(&position).unwrap(), expected, epsilon = 1e-6);
    }

    fn check_gradient(post: &mut MixturePosterior, position: &[f64]) {
        let dim = post.dim();
        let mut grad = vec![0.; dim];
        let logp = post.logp(position, &mut grad).unwrap();
        assert_abs_diff_eq!(logp, post.log_density(position).unwrap(), epsilon = 1e-9);

        let h = 1e-5;
        let mut scratch = vec![0.; dim];
        for i in 0..dim {
            let mut up = position.to_vec();
            up[i] += h;
            let mut down = position.to_vec();
            down[i] -= h;
            let numeric =
                (post.logp(&up, &mut scratch).unwrap() - post.logp(&down, &mut scratch).unwrap())
                    / (2. * h);
            let tol = 1e-4 * numeric.abs().max(1.);
            assert!(
                (grad[i] - numeric).abs() < tol,
                "coordinate {i}: analytic {} numeric {}",
                grad[i],
                numeric
            );
        }
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let model =
            MixtureModel::from_parts(&[360., 410., 520.], &[30., 25., 80.], &[0.3, 0.45, 0.25])
                .unwrap();
        for policy in [BoundaryPolicy::Open, BoundaryPolicy::Closed] {
            let mut post = posterior(policy, 3);
            let position = post.transform().to_unconstrained(&model).unwrap();
            check_gradient(&mut post, &position);
        }
    }

    #[test]
    fn gradient_with_uneven_concentration() {
        let data = scenario(BoundaryPolicy::Open);
        let config = PriorConfig {
            weight_concentration: Concentration::PerComponent(vec![0.5, 3.]),
            mean_loc: Some(400.),
            mean_scale: Some(100.),
            spread_scale: Some(50.),
        };
        let priors = config.resolve(&data, 2).unwrap();
        let mut post = MixturePosterior::new(data, Arc::new(priors), 2).unwrap();
        check_gradient(&mut post, &[390., 3., 3.5, 4.2, -0.4]);
    }

    #[test]
    fn degenerate_position_is_recoverable() {
        use crate::cpu_potential::LogpError;
        let mut post = posterior(BoundaryPolicy::Open, 2);
        let mut grad = vec![0.; post.dim()];
        // A spread of exp(-400) leaves the middle bins without mass.
        let err = post
            .logp(&[380., 4., -400., -400., 0.], &mut grad)
            .unwrap_err();
        assert!(err.is_recoverable());
        let err = post
            .logp(&[f64::NAN, 4., 3., 3., 0.], &mut grad)
            .unwrap_err();
        assert!(err.is_recoverable());
    }
}
