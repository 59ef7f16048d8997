use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::{
    cpu_state::{InnerState, State},
    math::{multiply, vector_dot},
    nuts::{Collector, SampleInfo},
};

pub(crate) trait MassMatrix {
    fn update_velocity(&self, state: &mut InnerState);
    fn update_kinetic_energy(&self, state: &mut InnerState);
    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R);
}

#[cfg(test)]
pub(crate) struct NullCollector {}

#[cfg(test)]
impl Collector for NullCollector {}

/// A diagonal mass matrix, stored as its inverse `variance`.
#[derive(Debug)]
pub(crate) struct DiagMassMatrix {
    inv_stds: Box<[f64]>,
    pub(crate) variance: Box<[f64]>,
}

impl DiagMassMatrix {
    pub(crate) fn new(ndim: usize) -> Self {
        Self {
            inv_stds: vec![1f64; ndim].into(),
            variance: vec![1f64; ndim].into(),
        }
    }

    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        update_diag(&mut self.variance, &mut self.inv_stds, new_variance);
    }
}

fn update_diag(
    variance_out: &mut [f64],
    inv_std_out: &mut [f64],
    new_variance: impl Iterator<Item = f64>,
) {
    izip!(variance_out, inv_std_out, new_variance).for_each(|(var, inv_std, x)| {
        assert!(x.is_finite(), "Illegal value on mass matrix: {}", x);
        assert!(x > 0f64, "Illegal value on mass matrix: {}", x);
        *var = x;
        *inv_std = (1. / x).sqrt();
    });
}

impl MassMatrix for DiagMassMatrix {
    fn update_velocity(&self, state: &mut InnerState) {
        multiply(&self.variance, &state.p, &mut state.v);
    }

    fn update_kinetic_energy(&self, state: &mut InnerState) {
        state.kinetic_energy = 0.5 * vector_dot(&state.p, &state.v);
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut InnerState, rng: &mut R) {
        state
            .p
            .iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(p, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *p = s * norm;
            });
    }
}

/// Welford estimator of the elementwise mean and variance of a stream of
/// vectors.
#[derive(Debug, Clone)]
pub(crate) struct RunningVariance {
    mean: Box<[f64]>,
    sum_sq: Box<[f64]>,
    count: u64,
}

impl RunningVariance {
    pub(crate) fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            sum_sq: vec![0f64; dim].into(),
            count: 0,
        }
    }

    pub(crate) fn add_sample(&mut self, value: &[f64]) {
        self.count += 1;
        if self.count == 1 {
            self.mean.copy_from_slice(value);
            return;
        }
        let weight = (self.count as f64).recip();
        izip!(value, self.mean.iter_mut(), self.sum_sq.iter_mut()).for_each(|(&x, mean, sq)| {
            let delta = x - *mean;
            *mean = weight.mul_add(delta, *mean);
            *sq += delta * (x - *mean);
        });
    }

    /// The sample variance. Requires at least two samples.
    pub(crate) fn current(&self) -> impl Iterator<Item = f64> + '_ {
        assert!(self.count > 1);
        let scale = ((self.count - 1) as f64).recip();
        self.sum_sq.iter().map(move |&sq| sq * scale)
    }

    pub(crate) fn count(&self) -> u64 {
        self.count
    }
}

/// Settings for mass matrix adaptation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagAdaptExpSettings {
    /// Do not adapt the mass matrix during the first `early_window` draws.
    pub early_window: u64,
    /// Stop adaptation `final_window` draws before tuning ends.
    pub final_window: u64,
    /// Switch to a new variance estimator every `window_switch_freq` draws.
    pub window_switch_freq: u64,
    /// Initialize the mass matrix from the gradient at the initial point.
    pub grad_init: bool,
}

impl Default for DiagAdaptExpSettings {
    fn default() -> Self {
        Self {
            early_window: 50,
            final_window: 50,
            window_switch_freq: 50,
            grad_init: true,
        }
    }
}

/// Remembers the position and gradient of the last draw and whether it is
/// informative enough to update the mass matrix estimate.
pub(crate) struct DrawGradCollector {
    pub(crate) draw: Box<[f64]>,
    pub(crate) grad: Box<[f64]>,
    pub(crate) is_good: bool,
}

impl DrawGradCollector {
    pub(crate) fn new(dim: usize) -> Self {
        DrawGradCollector {
            draw: vec![0f64; dim].into(),
            grad: vec![0f64; dim].into(),
            is_good: true,
        }
    }
}

impl Collector for DrawGradCollector {
    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.draw.copy_from_slice(&state.q);
        self.grad.copy_from_slice(&state.grad);
        let idx = state.index_in_trajectory();
        if info.divergence_info.is_some() {
            self.is_good = (idx <= -4) | (idx >= 4);
        } else {
            self.is_good = idx != 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn running_variance() {
        let mut est = RunningVariance::new(2);
        for x in [[1., 10.], [2., 10.], [3., 10.], [4., 10.]] {
            est.add_sample(&x);
        }
        assert_eq!(est.count(), 4);
        let var: Vec<f64> = est.current().collect();
        assert_abs_diff_eq!(var[0], 5. / 3., epsilon = 1e-12);
        assert_abs_diff_eq!(var[1], 0., epsilon = 1e-12);
    }

    #[test]
    fn momentum_has_mass_matrix_scale() {
        let mut mass = DiagMassMatrix::new(2);
        mass.update_diag([4., 0.25].into_iter());

        let mut pool = crate::cpu_state::StatePool::new(2);
        let mut state = pool.new_state();
        let inner = state.try_mut_inner().unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut est = RunningVariance::new(2);
        for _ in 0..20_000 {
            mass.randomize_momentum(inner, &mut rng);
            est.add_sample(&inner.p);
        }
        // p ~ N(0, M) with M the inverse of `variance`.
        let var: Vec<f64> = est.current().collect();
        assert_abs_diff_eq!(var[0], 0.25, epsilon = 0.02);
        assert_abs_diff_eq!(var[1], 4., epsilon = 0.3);

        inner.p.copy_from_slice(&[1., 2.]);
        mass.update_velocity(inner);
        assert_eq!(&inner.v[..], &[4., 0.5]);
        mass.update_kinetic_energy(inner);
        assert_abs_diff_eq!(inner.kinetic_energy, 0.5 * (4. + 1.));
    }
}
