use std::marker::PhantomData;

use itertools::izip;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    cpu_state::{State, StatePool},
    mass_matrix::{
        DiagAdaptExpSettings, DiagMassMatrix, DrawGradCollector, MassMatrix, RunningVariance,
    },
    nuts::{Collector, Direction, DivergenceInfo, Hamiltonian, NutsError, NutsOptions, SampleInfo},
    stepsize::{AcceptanceRateCollector, DualAverage, DualAverageOptions},
};

const LOWER_LIMIT: f64 = 1e-10f64;
const UPPER_LIMIT: f64 = 1e10f64;

/// Tunes sampler parameters from the draws of the warmup phase.
pub(crate) trait AdaptStrategy {
    type Potential: Hamiltonian;
    type Collector: Collector;
    type Stats: Copy + Send + std::fmt::Debug;
    type Options: Copy + Send + Default;

    fn new(options: Self::Options, num_tune: u64, dim: usize) -> Self;

    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        pool: &mut StatePool,
        position: &[f64],
        rng: &mut R,
    ) -> Result<(), NutsError>;

    /// Update the potential after draw number `draw` (counted from zero)
    /// has finished.
    fn adapt(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    );

    fn new_collector(&self) -> Self::Collector;

    fn is_tuning(&self, draw: u64) -> bool;

    fn current_stats(&self, collector: &Self::Collector) -> Self::Stats;
}

pub(crate) struct DualAverageStrategy<F, M> {
    step_size_adapt: DualAverage,
    options: DualAverageSettings,
    num_tune: u64,
    num_early: u64,
    _phantom1: PhantomData<F>,
    _phantom2: PhantomData<M>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DualAverageStats {
    pub step_size_bar: f64,
    pub mean_tree_accept: f64,
    pub n_steps: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DualAverageSettings {
    pub early_target_accept: f64,
    pub target_accept: f64,
    pub final_window_ratio: f64,
    pub params: DualAverageOptions,
}

impl Default for DualAverageSettings {
    fn default() -> Self {
        Self {
            early_target_accept: 0.5,
            target_accept: 0.95,
            final_window_ratio: 0.4,
            params: DualAverageOptions::default(),
        }
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> DualAverageStrategy<F, M> {
    /// Acceptance rate of a single leapfrog step from `state` with the
    /// current step size, or `None` if the step diverged.
    fn one_step_accept(
        potential: &mut EuclideanPotential<F, M>,
        pool: &mut StatePool,
        state: &State,
        dir: Direction,
        options: &NutsOptions,
    ) -> Result<Option<f64>, NutsError> {
        let mut collector = AcceptanceRateCollector::new();
        collector.register_init(state, options);
        let next = potential.leapfrog(pool, state, dir, state.energy(), &mut collector)?;
        Ok(next.ok().map(|_| collector.mean.current()))
    }
}

impl<F: CpuLogpFunc, M: MassMatrix> AdaptStrategy for DualAverageStrategy<F, M> {
    type Potential = EuclideanPotential<F, M>;
    type Collector = AcceptanceRateCollector;
    type Stats = DualAverageStats;
    type Options = DualAverageSettings;

    fn new(options: Self::Options, num_tune: u64, _dim: usize) -> Self {
        Self {
            num_tune,
            num_early: ((num_tune as f64) * options.final_window_ratio).ceil() as u64,
            options,
            step_size_adapt: DualAverage::new(options.params, options.params.initial_step),
            _phantom1: PhantomData,
            _phantom2: PhantomData,
        }
    }

    /// Double or halve the initial step size until a single leapfrog step
    /// crosses the target acceptance rate.
    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        pool: &mut StatePool,
        position: &[f64],
        rng: &mut R,
    ) -> Result<(), NutsError> {
        let mut state = potential.init_state(pool, position)?;
        potential.randomize_momentum(&mut state, rng);

        let initial_step = self.options.params.initial_step;
        *potential.step_size_mut() = initial_step;
        let target = self.options.target_accept;

        let accept = Self::one_step_accept(potential, pool, &state, Direction::Forward, options)?
            .unwrap_or(0.);
        let dir = if accept > target {
            Direction::Forward
        } else {
            Direction::Backward
        };

        for _ in 0..100 {
            match dir {
                Direction::Forward => *potential.step_size_mut() *= 2.,
                Direction::Backward => *potential.step_size_mut() /= 2.,
            }
            let accept = Self::one_step_accept(potential, pool, &state, dir, options)?;
            let crossed = match (dir, accept) {
                (Direction::Forward, Some(accept)) => {
                    (accept <= target) | (potential.step_size() > 1e5)
                }
                // A divergence while growing the step means we went too far.
                (Direction::Forward, None) => {
                    *potential.step_size_mut() /= 2.;
                    true
                }
                (Direction::Backward, Some(accept)) => {
                    (accept >= target) | (potential.step_size() < 1e-10)
                }
                (Direction::Backward, None) => potential.step_size() < 1e-10,
            };
            if crossed {
                break;
            }
        }
        self.step_size_adapt = DualAverage::new(self.options.params, potential.step_size());
        Ok(())
    }

    fn adapt(
        &mut self,
        _options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    ) {
        let target = if draw >= self.num_early {
            self.options.target_accept
        } else {
            let start = self.options.early_target_accept;
            let end = self.options.target_accept;
            let time = (draw as f64) / (self.num_early as f64);
            start + (end - start) * (1f64 + (6f64 * (time - 0.6)).tanh()) / 2f64
        };
        if draw < self.num_tune {
            self.step_size_adapt
                .advance(collector.mean.current(), target);
        }
        potential.step_size = if draw + 1 < self.num_tune {
            self.step_size_adapt.current_step_size()
        } else {
            self.step_size_adapt.current_step_size_adapted()
        };
    }

    fn new_collector(&self) -> Self::Collector {
        AcceptanceRateCollector::new()
    }

    fn is_tuning(&self, draw: u64) -> bool {
        draw < self.num_tune
    }

    fn current_stats(&self, collector: &Self::Collector) -> Self::Stats {
        DualAverageStats {
            step_size_bar: self.step_size_adapt.current_step_size_adapted(),
            mean_tree_accept: collector.mean.current(),
            n_steps: collector.mean.count(),
        }
    }
}

/// Adapt a diagonal mass matrix from the variances of draws and gradients.
///
/// Two estimators run side by side. The background estimator starts
/// empty and replaces the foreground one every `window_switch_freq` draws,
/// so the mass matrix always reflects between one and two windows of
/// recent draws.
pub(crate) struct ExpWindowDiagAdapt<F> {
    dim: usize,
    adapt_until: u64,
    variance_draw: RunningVariance,
    variance_grad: RunningVariance,
    variance_draw_bg: RunningVariance,
    variance_grad_bg: RunningVariance,
    settings: DiagAdaptExpSettings,
    _phantom: PhantomData<F>,
}

impl<F> ExpWindowDiagAdapt<F> {
    fn update_potential(&self, mass_matrix: &mut DiagMassMatrix) {
        mass_matrix.update_diag(
            izip!(self.variance_draw.current(), self.variance_grad.current()).map(
                |(draw, grad)| {
                    let val = (draw / grad).sqrt().clamp(LOWER_LIMIT, UPPER_LIMIT);
                    if val.is_finite() {
                        val
                    } else {
                        1f64
                    }
                },
            ),
        );
    }
}

impl<F: CpuLogpFunc> AdaptStrategy for ExpWindowDiagAdapt<F> {
    type Potential = EuclideanPotential<F, DiagMassMatrix>;
    type Collector = DrawGradCollector;
    type Stats = ();
    type Options = DiagAdaptExpSettings;

    fn new(options: Self::Options, num_tune: u64, dim: usize) -> Self {
        Self {
            dim,
            adapt_until: num_tune.saturating_sub(options.final_window),
            variance_draw: RunningVariance::new(dim),
            variance_grad: RunningVariance::new(dim),
            variance_draw_bg: RunningVariance::new(dim),
            variance_grad_bg: RunningVariance::new(dim),
            settings: options,
            _phantom: PhantomData,
        }
    }

    fn init<R: Rng + ?Sized>(
        &mut self,
        _options: &mut NutsOptions,
        potential: &mut Self::Potential,
        pool: &mut StatePool,
        position: &[f64],
        _rng: &mut R,
    ) -> Result<(), NutsError> {
        if !self.settings.grad_init {
            potential.mass_matrix.update_diag(std::iter::repeat(1f64));
            return Ok(());
        }
        let state = potential.init_state(pool, position)?;
        potential
            .mass_matrix
            .update_diag(state.grad.iter().map(|&grad| {
                let val = grad.abs().recip().clamp(LOWER_LIMIT, UPPER_LIMIT);
                if val.is_finite() {
                    val
                } else {
                    1f64
                }
            }));
        Ok(())
    }

    fn adapt(
        &mut self,
        _options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    ) {
        if (draw >= self.adapt_until) | (draw < self.settings.early_window) {
            return;
        }

        if collector.is_good {
            self.variance_draw.add_sample(&collector.draw);
            self.variance_grad.add_sample(&collector.grad);
            self.variance_draw_bg.add_sample(&collector.draw);
            self.variance_grad_bg.add_sample(&collector.grad);
        }

        if self.variance_draw_bg.count() >= self.settings.window_switch_freq {
            self.variance_draw =
                std::mem::replace(&mut self.variance_draw_bg, RunningVariance::new(self.dim));
            self.variance_grad =
                std::mem::replace(&mut self.variance_grad_bg, RunningVariance::new(self.dim));
        }

        if self.variance_draw.count() > 2 {
            assert!(self.variance_draw.count() == self.variance_grad.count());
            self.update_potential(&mut potential.mass_matrix);
        }
    }

    fn new_collector(&self) -> Self::Collector {
        DrawGradCollector::new(self.dim)
    }

    fn is_tuning(&self, draw: u64) -> bool {
        draw < self.adapt_until
    }

    fn current_stats(&self, _collector: &Self::Collector) -> Self::Stats {}
}

/// Settings for the adaptation of step size and mass matrix.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptOptions {
    pub step_size: DualAverageSettings,
    pub mass_matrix: DiagAdaptExpSettings,
}

/// Step size adaptation by dual averaging together with windowed diagonal
/// mass matrix adaptation.
pub(crate) struct GlobalStrategy<F> {
    step_size: DualAverageStrategy<F, DiagMassMatrix>,
    mass_matrix: ExpWindowDiagAdapt<F>,
}

impl<F: CpuLogpFunc> AdaptStrategy for GlobalStrategy<F> {
    type Potential = EuclideanPotential<F, DiagMassMatrix>;
    type Collector = CombinedCollector<AcceptanceRateCollector, DrawGradCollector>;
    type Stats = DualAverageStats;
    type Options = AdaptOptions;

    fn new(options: Self::Options, num_tune: u64, dim: usize) -> Self {
        Self {
            step_size: DualAverageStrategy::new(options.step_size, num_tune, dim),
            mass_matrix: ExpWindowDiagAdapt::new(options.mass_matrix, num_tune, dim),
        }
    }

    fn init<R: Rng + ?Sized>(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        pool: &mut StatePool,
        position: &[f64],
        rng: &mut R,
    ) -> Result<(), NutsError> {
        // The step size heuristic depends on the initial mass matrix.
        self.mass_matrix
            .init(options, potential, pool, position, rng)?;
        self.step_size.init(options, potential, pool, position, rng)
    }

    fn adapt(
        &mut self,
        options: &mut NutsOptions,
        potential: &mut Self::Potential,
        draw: u64,
        collector: &Self::Collector,
    ) {
        self.mass_matrix
            .adapt(options, potential, draw, &collector.collector2);
        self.step_size
            .adapt(options, potential, draw, &collector.collector1);
    }

    fn new_collector(&self) -> Self::Collector {
        CombinedCollector {
            collector1: self.step_size.new_collector(),
            collector2: self.mass_matrix.new_collector(),
        }
    }

    fn is_tuning(&self, draw: u64) -> bool {
        self.step_size.is_tuning(draw)
    }

    fn current_stats(&self, collector: &Self::Collector) -> Self::Stats {
        self.step_size.current_stats(&collector.collector1)
    }
}

pub(crate) struct CombinedCollector<C1: Collector, C2: Collector> {
    collector1: C1,
    collector2: C2,
}

impl<C1, C2> Collector for CombinedCollector<C1, C2>
where
    C1: Collector,
    C2: Collector,
{
    fn register_leapfrog(
        &mut self,
        start: &State,
        end: &State,
        divergence_info: Option<&DivergenceInfo>,
    ) {
        self.collector1
            .register_leapfrog(start, end, divergence_info);
        self.collector2
            .register_leapfrog(start, end, divergence_info);
    }

    fn register_draw(&mut self, state: &State, info: &SampleInfo) {
        self.collector1.register_draw(state, info);
        self.collector2.register_draw(state, info);
    }

    fn register_init(&mut self, state: &State, options: &NutsOptions) {
        self.collector1.register_init(state, options);
        self.collector2.register_init(state, options);
    }
}
