use std::fmt::Debug;
use std::sync::Arc;

use rand::Rng;

use crate::cpu_state::{State, StatePool};
use crate::mass_matrix::MassMatrix;
use crate::nuts::{Collector, Direction, DivergenceInfo, Hamiltonian, NutsError};

/// Errors that happen when we evaluate the logp and gradient function
pub(crate) trait LogpError: std::error::Error {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

/// A log density with gradient on an unconstrained real vector space.
pub(crate) trait CpuLogpFunc {
    type LogpError: Debug + Send + Sync + LogpError + 'static;

    /// Write the gradient of the log density at `position` into `grad` and
    /// return the log density.
    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError>;
    fn dim(&self) -> usize;
}

pub(crate) struct EuclideanPotential<F: CpuLogpFunc, M: MassMatrix> {
    logp: F,
    pub(crate) mass_matrix: M,
    max_energy_error: f64,
    pub(crate) step_size: f64,
}

impl<F: CpuLogpFunc, M: MassMatrix> EuclideanPotential<F, M> {
    pub(crate) fn new(logp: F, mass_matrix: M, max_energy_error: f64, step_size: f64) -> Self {
        EuclideanPotential {
            logp,
            mass_matrix,
            max_energy_error,
            step_size,
        }
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> Hamiltonian for EuclideanPotential<F, M> {
    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<Result<State, DivergenceInfo>, NutsError> {
        let mut out = pool.new_state();

        let sign = match dir {
            Direction::Forward => 1,
            Direction::Backward => -1,
        };

        let epsilon = (sign as f64) * self.step_size;

        {
            let inner = fresh(&mut out);
            start.first_momentum_halfstep(inner, epsilon);
            self.mass_matrix.update_velocity(inner);
            start.position_step(inner, epsilon);
        }

        if let Err(logp_error) = self.update_potential_gradient(&mut out) {
            if !logp_error.is_recoverable() {
                return Err(NutsError::LogpFailure(Box::new(logp_error)));
            }
            let div_info = DivergenceInfo {
                energy_error: None,
                logp_function_error: Some(Arc::new(logp_error)),
            };
            collector.register_leapfrog(start, &out, Some(&div_info));
            return Ok(Err(div_info));
        }

        {
            let inner = fresh(&mut out);
            inner.second_momentum_halfstep(epsilon);
            self.mass_matrix.update_velocity(inner);
            self.mass_matrix.update_kinetic_energy(inner);
            inner.idx_in_trajectory = start.index_in_trajectory() + sign;
            start.set_psum(inner, dir);
        }

        let energy_error = out.energy() - initial_energy;
        if (energy_error.abs() > self.max_energy_error) | !energy_error.is_finite() {
            let divergence_info = DivergenceInfo {
                energy_error: Some(energy_error),
                logp_function_error: None,
            };
            collector.register_leapfrog(start, &out, Some(&divergence_info));
            return Ok(Err(divergence_info));
        }

        collector.register_leapfrog(start, &out, None);

        Ok(Ok(out))
    }

    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State, NutsError> {
        let mut state = pool.new_state();
        {
            let inner = fresh(&mut state);
            inner.q.copy_from_slice(init);
            inner.p_sum.fill(0.);
            inner.idx_in_trajectory = 0;
        }
        self.update_potential_gradient(&mut state)
            .map_err(|e| NutsError::LogpFailure(Box::new(e)))?;
        Ok(state)
    }

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R) {
        let inner = fresh(state);
        self.mass_matrix.randomize_momentum(inner, rng);
        self.mass_matrix.update_velocity(inner);
        self.mass_matrix.update_kinetic_energy(inner);
        inner.idx_in_trajectory = 0;
        inner.p_sum.copy_from_slice(&inner.p);
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn step_size_mut(&mut self) -> &mut f64 {
        &mut self.step_size
    }

    fn dim(&self) -> usize {
        self.logp.dim()
    }
}

/// Mutable access to a state that has not been shared yet.
///
/// Points are only mutated right after they come out of the pool or when
/// the sampler holds the only handle, so a shared state here is a bug.
fn fresh(state: &mut State) -> &mut crate::cpu_state::InnerState {
    state.try_mut_inner().expect("State already in use")
}

impl<F: CpuLogpFunc, M: MassMatrix> EuclideanPotential<F, M> {
    fn update_potential_gradient(&mut self, state: &mut State) -> Result<(), F::LogpError> {
        let inner = fresh(state);
        let logp = self.logp.logp(&inner.q, &mut inner.grad)?;
        inner.potential_energy = -logp;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_logps {
    use super::{CpuLogpFunc, LogpError};
    use thiserror::Error;

    /// Independent standard normals centered at `mu`.
    #[derive(Clone)]
    pub(crate) struct NormalLogp {
        dim: usize,
        mu: f64,
    }

    impl NormalLogp {
        pub(crate) fn new(dim: usize, mu: f64) -> NormalLogp {
            NormalLogp { dim, mu }
        }
    }

    #[derive(Error, Debug)]
    pub(crate) enum NormalLogpError {}

    impl LogpError for NormalLogpError {
        fn is_recoverable(&self) -> bool {
            false
        }
    }

    impl CpuLogpFunc for NormalLogp {
        type LogpError = NormalLogpError;

        fn dim(&self) -> usize {
            self.dim
        }

        fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, NormalLogpError> {
            let n = position.len();
            assert!(gradient.len() == n);

            let mut logp = 0f64;
            for (p, g) in position.iter().zip(gradient.iter_mut()) {
                let val = *p - self.mu;
                logp -= val * val / 2.;
                *g = -val;
            }
            Ok(logp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_logps::NormalLogp;
    use super::*;
    use crate::mass_matrix::{DiagMassMatrix, NullCollector};
    use approx::assert_abs_diff_eq;

    #[test]
    fn leapfrog_conserves_energy() {
        let dim = 4;
        let mut potential =
            EuclideanPotential::new(NormalLogp::new(dim, 1.), DiagMassMatrix::new(dim), 1000., 0.01);
        let mut pool = StatePool::new(dim);
        let mut state = potential.init_state(&mut pool, &[0., 0.5, 2., 3.]).unwrap();
        assert_abs_diff_eq!(state.potential_energy(), 0.5 * (1. + 0.25 + 1. + 4.));

        let mut rng = rand::rng();
        potential.randomize_momentum(&mut state, &mut rng);
        let initial_energy = state.energy();

        let mut current = state.clone();
        for i in 1..=20 {
            let next = potential
                .leapfrog(
                    &mut pool,
                    &current,
                    Direction::Forward,
                    initial_energy,
                    &mut NullCollector {},
                )
                .unwrap()
                .unwrap();
            assert_eq!(next.index_in_trajectory(), i);
            assert_abs_diff_eq!(next.energy(), initial_energy, epsilon = 1e-3);
            current = next;
        }
    }
}
