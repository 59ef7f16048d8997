use rand::Rng;

use crate::{
    adapt_strategy::AdaptStrategy,
    cpu_state::{State, StatePool},
    nuts::{draw, DivergenceInfo, Hamiltonian, NutsError, NutsOptions},
};

/// Draw samples from the posterior distribution using Hamiltonian MCMC.
pub(crate) trait Sampler {
    type Stats;

    /// Initialize the sampler to a position. This should be called
    /// before calling draw.
    ///
    /// This fails if the logp function returns an error.
    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError>;

    /// Draw a new sample and return the position and some diagnosic information.
    fn draw(&mut self) -> Result<(Box<[f64]>, Self::Stats), NutsError>;

    /// The dimensionality of the posterior.
    fn dim(&self) -> usize;
}

/// Statistics about one draw of a NUTS chain.
#[derive(Debug, Clone)]
pub struct NutsSampleStats<AdaptStats> {
    /// The depth of the trajectory that this point was sampled from
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub index_in_trajectory: i64,
    pub logp: f64,
    pub energy: f64,
    pub divergence_info: Option<DivergenceInfo>,
    pub chain: u64,
    pub draw: u64,
    /// Whether the draw was made during warmup.
    pub tuning: bool,
    /// Step size used for the trajectory of this draw.
    pub step_size: f64,
    pub strategy_stats: AdaptStats,
}

impl<A> NutsSampleStats<A> {
    pub fn diverging(&self) -> bool {
        self.divergence_info.is_some()
    }
}

pub(crate) struct NutsChain<R, A>
where
    R: Rng,
    A: AdaptStrategy,
{
    pool: StatePool,
    potential: A::Potential,
    collector: A::Collector,
    options: NutsOptions,
    rng: R,
    init: Option<State>,
    chain: u64,
    draw_count: u64,
    strategy: A,
}

impl<R, A> NutsChain<R, A>
where
    R: Rng,
    A: AdaptStrategy,
{
    pub(crate) fn new(potential: A::Potential, strategy: A, options: NutsOptions, rng: R, chain: u64) -> Self {
        let pool = StatePool::with_capacity(potential.dim(), 2 * options.maxdepth as usize + 8);
        let collector = strategy.new_collector();
        NutsChain {
            pool,
            potential,
            collector,
            options,
            rng,
            init: None,
            chain,
            draw_count: 0,
            strategy,
        }
    }

    pub(crate) fn potential(&self) -> &A::Potential {
        &self.potential
    }
}

impl<R, A> Sampler for NutsChain<R, A>
where
    R: Rng,
    A: AdaptStrategy,
{
    type Stats = NutsSampleStats<A::Stats>;

    fn set_position(&mut self, position: &[f64]) -> Result<(), NutsError> {
        self.strategy.init(
            &mut self.options,
            &mut self.potential,
            &mut self.pool,
            position,
            &mut self.rng,
        )?;
        self.init = Some(self.potential.init_state(&mut self.pool, position)?);
        Ok(())
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, Self::Stats), NutsError> {
        let mut init = self
            .init
            .take()
            .expect("set_position must be called before draw");
        let step_size = self.potential.step_size();
        let (state, info) = draw(
            &mut self.pool,
            &mut init,
            &mut self.rng,
            &mut self.potential,
            &self.options,
            &mut self.collector,
        )?;
        drop(init);

        let mut position: Box<[f64]> = vec![0f64; self.potential.dim()].into();
        state.write_position(&mut position);

        let stats = NutsSampleStats {
            depth: info.depth,
            maxdepth_reached: info.reached_maxdepth,
            index_in_trajectory: state.index_in_trajectory(),
            logp: -state.potential_energy(),
            energy: state.energy(),
            divergence_info: info.divergence_info,
            chain: self.chain,
            draw: self.draw_count,
            tuning: self.strategy.is_tuning(self.draw_count),
            step_size,
            strategy_stats: self.strategy.current_stats(&self.collector),
        };
        self.strategy.adapt(
            &mut self.options,
            &mut self.potential,
            self.draw_count,
            &self.collector,
        );
        self.init = Some(state);
        self.draw_count += 1;
        Ok((position, stats))
    }

    fn dim(&self) -> usize {
        self.potential.dim()
    }
}
