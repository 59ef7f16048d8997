use thiserror::Error;

use std::sync::Arc;

use rand::{distr::StandardUniform, Rng};

use crate::cpu_state::{State, StatePool};
use crate::math::logaddexp;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum NutsError {
    #[error("Logp function returned error: {0:?}")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),

    #[error("Could not find a valid initial point after {attempts} attempts: {source}")]
    BadInitPoint {
        attempts: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, NutsError>;

/// Why a trajectory diverged.
///
/// Either the energy error of a leapfrog step exceeded the cutoff or was
/// not finite, or the log density reported a recoverable error.
#[derive(Debug, Clone)]
pub(crate) struct DivergenceInfo {
    /// Energy at the end of the step minus the initial energy of the
    /// trajectory. `None` after a log density error.
    pub energy_error: Option<f64>,

    pub logp_function_error: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl rand::distr::Distribution<Direction> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Observes leapfrog steps and draws, for acceptance statistics and mass
/// matrix adaptation.
pub(crate) trait Collector {
    fn register_leapfrog(
        &mut self,
        _start: &State,
        _end: &State,
        _divergence_info: Option<&DivergenceInfo>,
    ) {
    }
    fn register_draw(&mut self, _state: &State, _info: &SampleInfo) {}
    fn register_init(&mut self, _state: &State, _options: &NutsOptions) {}
}

/// Potential plus kinetic energy, and the integrator that moves along it.
pub(crate) trait Hamiltonian {
    /// One leapfrog step from `start`. The inner `Err` is a divergence.
    fn leapfrog<C: Collector>(
        &mut self,
        pool: &mut StatePool,
        start: &State,
        dir: Direction,
        initial_energy: f64,
        collector: &mut C,
    ) -> Result<std::result::Result<State, DivergenceInfo>>;

    /// Initialize a state at a new location.
    ///
    /// The momentum is left untouched, it is set by `randomize_momentum`
    /// at the start of every draw.
    fn init_state(&mut self, pool: &mut StatePool, init: &[f64]) -> Result<State>;

    fn randomize_momentum<R: Rng + ?Sized>(&self, state: &mut State, rng: &mut R);

    fn step_size(&self) -> f64;

    fn step_size_mut(&mut self) -> &mut f64;

    fn dim(&self) -> usize;
}

/// Tree statistics of one draw.
#[derive(Debug)]
pub(crate) struct SampleInfo {
    pub depth: u64,
    pub divergence_info: Option<DivergenceInfo>,
    pub reached_maxdepth: bool,
}

/// A subtree of the trajectory.
struct NutsTree {
    /// Endpoint with the smaller index in the trajectory.
    left: State,
    right: State,
    /// Multinomial draw among the points between `left` and `right`.
    draw: State,
    log_size: f64,
    depth: u64,
    initial_energy: f64,

    /// Contains the initial point.
    is_main: bool,
}

enum ExtendResult {
    Ok(NutsTree),
    Err(NutsError),
    /// The U-turn criterion fired.
    Turning(NutsTree),
    Diverging(NutsTree, DivergenceInfo),
}

impl NutsTree {
    fn new(state: State) -> NutsTree {
        let initial_energy = state.energy();
        NutsTree {
            right: state.clone(),
            left: state.clone(),
            draw: state,
            depth: 0,
            log_size: 0.,
            initial_energy,
            is_main: true,
        }
    }

    #[inline]
    fn extend<P, C, R>(
        mut self,
        pool: &mut StatePool,
        rng: &mut R,
        potential: &mut P,
        direction: Direction,
        collector: &mut C,
    ) -> ExtendResult
    where
        P: Hamiltonian,
        C: Collector,
        R: Rng + ?Sized,
    {
        let mut other = match self.single_step(pool, potential, direction, collector) {
            Ok(Ok(tree)) => tree,
            Ok(Err(info)) => return ExtendResult::Diverging(self, info),
            Err(err) => return ExtendResult::Err(err),
        };

        while other.depth < self.depth {
            use ExtendResult::*;
            other = match other.extend(pool, rng, potential, direction, collector) {
                Ok(tree) => tree,
                Turning(_) => {
                    return Turning(self);
                }
                Diverging(_, info) => {
                    return Diverging(self, info);
                }
                Err(error) => {
                    return Err(error);
                }
            };
        }

        let (first, last) = match direction {
            Direction::Forward => (&self.left, &other.right),
            Direction::Backward => (&other.left, &self.right),
        };

        let mut turning = first.is_turning(last);
        if self.depth > 0 {
            if !turning {
                turning = self.right.is_turning(&other.right);
            }
            if !turning {
                turning = self.left.is_turning(&other.left);
            }
        }

        self.merge_into(other, rng, direction);

        if turning {
            ExtendResult::Turning(self)
        } else {
            ExtendResult::Ok(self)
        }
    }

    #[inline]
    fn merge_into<R: Rng + ?Sized>(&mut self, other: NutsTree, rng: &mut R, direction: Direction) {
        assert!(self.depth == other.depth);
        assert!(self.left.index_in_trajectory() <= self.right.index_in_trajectory());
        match direction {
            Direction::Forward => {
                self.right = other.right;
            }
            Direction::Backward => {
                self.left = other.left;
            }
        }
        let log_size = logaddexp(self.log_size, other.log_size);

        let self_log_size = if self.is_main {
            assert!(self.left.index_in_trajectory() <= 0);
            assert!(self.right.index_in_trajectory() >= 0);
            self.log_size
        } else {
            log_size
        };

        if (other.log_size >= self_log_size)
            || rng.random_bool((other.log_size - self_log_size).exp().clamp(0., 1.))
        {
            self.draw = other.draw;
        }

        self.depth += 1;
        self.log_size = log_size;
    }

    #[inline]
    fn single_step<P: Hamiltonian, C: Collector>(
        &self,
        pool: &mut StatePool,
        potential: &mut P,
        direction: Direction,
        collector: &mut C,
    ) -> Result<std::result::Result<NutsTree, DivergenceInfo>> {
        let start = match direction {
            Direction::Forward => &self.right,
            Direction::Backward => &self.left,
        };
        let end = match potential.leapfrog(pool, start, direction, self.initial_energy, collector)
        {
            Ok(Ok(end)) => end,
            Ok(Err(info)) => return Ok(Err(info)),
            Err(error) => return Err(error),
        };

        let log_size = self.initial_energy - end.energy();
        Ok(Ok(NutsTree {
            right: end.clone(),
            left: end.clone(),
            draw: end,
            depth: 0,
            log_size,
            initial_energy: self.initial_energy,
            is_main: false,
        }))
    }

    fn info(&self, maxdepth: bool, divergence_info: Option<DivergenceInfo>) -> SampleInfo {
        SampleInfo {
            depth: self.depth,
            divergence_info,
            reached_maxdepth: maxdepth,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct NutsOptions {
    pub maxdepth: u64,
}

/// Draw one point with the No-U-Turn sampler, starting at `init`.
///
/// The momentum of `init` is resampled.
pub(crate) fn draw<P, R, C>(
    pool: &mut StatePool,
    init: &mut State,
    rng: &mut R,
    potential: &mut P,
    options: &NutsOptions,
    collector: &mut C,
) -> Result<(State, SampleInfo)>
where
    P: Hamiltonian,
    R: Rng + ?Sized,
    C: Collector,
{
    potential.randomize_momentum(init, rng);
    collector.register_init(init, options);

    let mut tree = NutsTree::new(init.clone());
    while tree.depth < options.maxdepth {
        let direction: Direction = rng.random();
        tree = match tree.extend(pool, rng, potential, direction, collector) {
            ExtendResult::Ok(tree) => tree,
            ExtendResult::Turning(tree) => {
                let info = tree.info(false, None);
                collector.register_draw(&tree.draw, &info);
                return Ok((tree.draw, info));
            }
            // A divergent iteration rejects the whole trajectory.
            ExtendResult::Diverging(tree, info) => {
                let info = tree.info(false, Some(info));
                collector.register_draw(init, &info);
                return Ok((init.clone(), info));
            }
            ExtendResult::Err(error) => {
                return Err(error);
            }
        };
    }
    let info = tree.info(true, None);
    collector.register_draw(&tree.draw, &info);
    Ok((tree.draw, info))
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::cpu_potential::test_logps::NormalLogp;
    use crate::cpu_potential::{CpuLogpFunc, EuclideanPotential, LogpError};
    use crate::mass_matrix::{DiagMassMatrix, NullCollector};

    /// Flat density on `[-1, 1]`, with a recoverable error outside.
    struct FlatBox;

    #[derive(Error, Debug)]
    #[error("outside of the box")]
    struct OutsideBox;

    impl LogpError for OutsideBox {
        fn is_recoverable(&self) -> bool {
            true
        }
    }

    impl CpuLogpFunc for FlatBox {
        type LogpError = OutsideBox;

        fn dim(&self) -> usize {
            1
        }

        fn logp(
            &mut self,
            position: &[f64],
            grad: &mut [f64],
        ) -> std::result::Result<f64, OutsideBox> {
            grad.fill(0.);
            if position[0].abs() > 1. {
                return Err(OutsideBox);
            }
            Ok(0.)
        }
    }

    #[test]
    fn direction_is_random() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let forward = (0..1000)
            .map(|_| rng.random::<Direction>())
            .filter(|&d| d == Direction::Forward)
            .count();
        assert!((400..600).contains(&forward));
    }

    #[test]
    fn draw_stays_finite() {
        let dim = 5;
        let mut potential =
            EuclideanPotential::new(NormalLogp::new(dim, 3.), DiagMassMatrix::new(dim), 1000., 0.3);
        let mut pool = StatePool::new(dim);
        let mut state = potential.init_state(&mut pool, &vec![0.; dim]).unwrap();
        let options = NutsOptions { maxdepth: 10 };
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        for _ in 0..50 {
            let (next, info) = draw(
                &mut pool,
                &mut state,
                &mut rng,
                &mut potential,
                &options,
                &mut NullCollector {},
            )
            .unwrap();
            assert!(info.divergence_info.is_none());
            assert!(info.depth >= 1);
            assert!(next.q.iter().all(|x| x.is_finite()));
            drop(state);
            state = next;
        }
        // After some draws the chain has moved towards the mode at 3.
        assert!(state.q.iter().all(|&x| (x - 3.).abs() < 5.));
    }

    #[test]
    fn huge_step_size_diverges() {
        let dim = 3;
        let mut potential = EuclideanPotential::new(
            NormalLogp::new(dim, 0.),
            DiagMassMatrix::new(dim),
            1000.,
            1e4,
        );
        let mut pool = StatePool::new(dim);
        let mut state = potential.init_state(&mut pool, &vec![1.; dim]).unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let (next, info) = draw(
            &mut pool,
            &mut state,
            &mut rng,
            &mut potential,
            &NutsOptions { maxdepth: 10 },
            &mut NullCollector {},
        )
        .unwrap();
        let divergence = info.divergence_info.expect("expected a divergence");
        assert!(divergence.energy_error.unwrap().abs() > 1000.);
        // The divergent step is rejected, so the draw is the initial point.
        assert_eq!(next.index_in_trajectory(), 0);
        assert_eq!(&next.q[..], &[1.; 3]);
    }

    #[test]
    fn divergence_keeps_initial_point() {
        let mut potential = EuclideanPotential::new(FlatBox, DiagMassMatrix::new(1), 1000., 0.05);
        let mut pool = StatePool::new(1);
        let options = NutsOptions { maxdepth: 10 };
        let mut deep_divergences = 0;

        for seed in 0..200 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut state = potential.init_state(&mut pool, &[0.]).unwrap();
            let (next, info) = draw(
                &mut pool,
                &mut state,
                &mut rng,
                &mut potential,
                &options,
                &mut NullCollector {},
            )
            .unwrap();
            let Some(divergence) = info.divergence_info else {
                continue;
            };
            assert!(divergence.logp_function_error.is_some());
            assert!(divergence.energy_error.is_none());
            assert_eq!(&next.q[..], &[0.]);
            assert_eq!(next.index_in_trajectory(), 0);
            if info.depth >= 1 {
                deep_divergences += 1;
            }
        }
        // Straight trajectories leave the box after many steps.
        assert!(deep_divergences > 100, "{}", deep_divergences);
    }
}
