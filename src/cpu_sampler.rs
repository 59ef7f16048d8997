use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    adapt_strategy::{AdaptOptions, AdaptStrategy, DualAverageStats, GlobalStrategy},
    chain::{NutsChain, NutsSampleStats, Sampler},
    cpu_potential::{CpuLogpFunc, EuclideanPotential},
    mass_matrix::DiagMassMatrix,
    nuts::{NutsError, NutsOptions},
};

/// Settings of a single NUTS chain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerArgs {
    /// The number of tuning steps, where we fit the step size and mass matrix.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    /// The maximum tree depth during sampling. The number of leapfrog steps
    /// is smaller than 2 ^ maxdepth.
    pub maxdepth: u64,
    /// If the energy error is larger than this threshold we treat the leapfrog
    /// step as a divergence.
    pub max_energy_error: f64,
    /// How many initial points to try before giving up.
    pub max_init_attempts: usize,
    /// Settings for mass matrix and step size adaptation.
    pub adapt: AdaptOptions,
}

impl Default for SamplerArgs {
    fn default() -> Self {
        Self {
            num_tune: 1000,
            num_draws: 1000,
            maxdepth: 10,
            max_energy_error: 1000f64,
            max_init_attempts: 500,
            adapt: AdaptOptions::default(),
        }
    }
}

pub(crate) type ChainSampler<F, R> = NutsChain<R, GlobalStrategy<F>>;

/// Create a NUTS chain with step size and diagonal mass matrix adaptation.
pub(crate) fn new_sampler<F: CpuLogpFunc, R: Rng>(
    logp: F,
    settings: SamplerArgs,
    chain: u64,
    rng: R,
) -> ChainSampler<F, R> {
    let num_tune = settings.num_tune;
    let strategy = GlobalStrategy::new(settings.adapt, num_tune, logp.dim());
    let mass_matrix = DiagMassMatrix::new(logp.dim());
    let max_energy_error = settings.max_energy_error;
    let step_size = settings.adapt.step_size.params.initial_step;
    let potential = EuclideanPotential::new(logp, mass_matrix, max_energy_error, step_size);
    let options = NutsOptions {
        maxdepth: settings.maxdepth,
    };
    NutsChain::new(potential, strategy, options, rng, chain)
}

/// Propose initial points for a chain.
pub(crate) trait InitPointFunc {
    fn new_init_point<R: Rng + ?Sized>(&mut self, rng: &mut R, out: &mut [f64]);
}

/// Initialize chains using uniform jitter around a center point.
#[derive(Debug, Clone)]
pub(crate) struct JitterInitFunc {
    mu: Option<Box<[f64]>>,
    scale: f64,
}

impl JitterInitFunc {
    /// Initialize new chains with jitter in [-1, 1] around the origin.
    pub(crate) fn new() -> JitterInitFunc {
        JitterInitFunc {
            mu: None,
            scale: 1.,
        }
    }

    /// Initialize new chains with jitter in [mean - scale, mean + scale].
    pub(crate) fn new_with_mean(mu: Box<[f64]>, scale: f64) -> Self {
        Self {
            mu: Some(mu),
            scale,
        }
    }
}

impl Default for JitterInitFunc {
    fn default() -> Self {
        Self::new()
    }
}

impl InitPointFunc for JitterInitFunc {
    fn new_init_point<R: Rng + ?Sized>(&mut self, rng: &mut R, out: &mut [f64]) {
        out.iter_mut()
            .for_each(|val| *val = self.scale * rng.random_range(-1.0..1.0));
        if let Some(mu) = &self.mu {
            out.iter_mut().zip(mu.iter()).for_each(|(val, mu)| *val += mu);
        }
    }
}

/// Snapshot of the state of a running chain.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ChainProgress {
    pub chain: u64,
    pub finished_draws: usize,
    pub total_draws: usize,
    /// Divergences after warmup.
    pub divergences: usize,
    pub tuning: bool,
    pub latest_num_steps: usize,
    pub total_num_steps: usize,
    pub step_size: f64,
    pub runtime: Duration,
    pub divergent_draws: Vec<usize>,
}

impl ChainProgress {
    fn new(chain: u64, total: usize) -> Self {
        Self {
            chain,
            finished_draws: 0,
            total_draws: total,
            divergences: 0,
            tuning: true,
            latest_num_steps: 0,
            step_size: 0f64,
            total_num_steps: 0,
            runtime: Duration::ZERO,
            divergent_draws: Vec::new(),
        }
    }

    fn update(&mut self, stats: &NutsSampleStats<DualAverageStats>, draw_duration: Duration) {
        if stats.diverging() & !stats.tuning {
            self.divergences += 1;
            self.divergent_draws.push(self.finished_draws);
        }
        self.finished_draws += 1;
        self.tuning = stats.tuning;

        self.latest_num_steps = stats.strategy_stats.n_steps as usize;
        self.total_num_steps += stats.strategy_stats.n_steps as usize;
        self.step_size = stats.step_size;
        self.runtime += draw_duration;
    }
}

/// How callers interact with running chains.
#[derive(Clone, Copy)]
pub(crate) struct ChainControl<'a> {
    /// Chains stop before their next draw once this is set.
    pub cancel: &'a AtomicBool,
    pub progress: Option<&'a (dyn Fn(&ChainProgress) + Sync)>,
}

/// Everything a chain produced, warmup included.
#[derive(Debug, Clone)]
pub(crate) struct ChainOutput {
    pub chain: u64,
    pub draws: Vec<Box<[f64]>>,
    pub stats: Vec<NutsSampleStats<DualAverageStats>>,
    /// The chain was cancelled before it finished all draws.
    pub incomplete: bool,
    pub final_step_size: f64,
    pub mass_matrix_diag: Box<[f64]>,
}

fn init_chain<F, R, I>(
    sampler: &mut ChainSampler<F, SmallRng>,
    init: &mut I,
    rng: &mut R,
    attempts: usize,
) -> std::result::Result<(), NutsError>
where
    F: CpuLogpFunc,
    R: Rng + ?Sized,
    I: InitPointFunc,
{
    let attempts = attempts.max(1);
    let mut position = vec![0f64; sampler.dim()];
    let mut tried = 0;
    loop {
        tried += 1;
        init.new_init_point(rng, &mut position);
        match sampler.set_position(&position) {
            Ok(()) => return Ok(()),
            Err(err) if tried >= attempts => {
                return Err(NutsError::BadInitPoint {
                    attempts,
                    source: Box::new(err),
                })
            }
            Err(err) => debug!(attempt = tried, error = %err, "initial point rejected"),
        }
    }
}

/// Run one chain to completion or until it is cancelled.
pub(crate) fn sample_chain<F, I>(
    logp: F,
    mut init: I,
    settings: SamplerArgs,
    seed: u64,
    chain: u64,
    control: ChainControl<'_>,
) -> Result<ChainOutput>
where
    F: CpuLogpFunc,
    I: InitPointFunc,
{
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(chain);

    let sampler_rng = SmallRng::from_rng(&mut rng);
    let mut sampler = new_sampler(logp, settings, chain, sampler_rng);
    init_chain(&mut sampler, &mut init, &mut rng, settings.max_init_attempts)
        .with_context(|| format!("Could not initialize chain {}", chain))?;
    debug!(chain, "chain initialized");

    let total = (settings.num_tune + settings.num_draws) as usize;
    let mut progress = ChainProgress::new(chain, total);
    let mut draws = Vec::with_capacity(total);
    let mut stats = Vec::with_capacity(total);
    let mut incomplete = false;

    for _ in 0..total {
        if control.cancel.load(Ordering::Relaxed) {
            incomplete = true;
            break;
        }
        let now = Instant::now();
        let (draw, info) = sampler
            .draw()
            .with_context(|| format!("Sampling failed in chain {}", chain))?;
        progress.update(&info, now.elapsed());
        if let Some(error) = info
            .divergence_info
            .as_ref()
            .and_then(|div| div.logp_function_error.as_ref())
        {
            debug!(chain, draw = info.draw, %error, "divergence from log density error");
        }
        if let Some(callback) = control.progress {
            callback(&progress);
        }
        draws.push(draw);
        stats.push(info);
    }

    if incomplete {
        warn!(
            chain,
            finished_draws = draws.len(),
            total_draws = total,
            "chain cancelled"
        );
    } else {
        info!(
            chain,
            divergences = progress.divergences,
            step_size = sampler.potential().step_size,
            runtime_ms = progress.runtime.as_millis() as u64,
            "chain finished"
        );
    }

    Ok(ChainOutput {
        chain,
        draws,
        stats,
        incomplete,
        final_step_size: sampler.potential().step_size,
        mass_matrix_diag: sampler.potential().mass_matrix.variance.clone(),
    })
}

/// Sample one chain per init function in parallel.
///
/// Chain `i` draws its random numbers from the stream `i` of a ChaCha8
/// generator seeded with `seed`, so the result does not depend on the
/// number of threads or on scheduling.
pub(crate) fn sample_parallel<F, I>(
    logp: F,
    inits: Vec<I>,
    settings: SamplerArgs,
    seed: u64,
    num_threads: Option<usize>,
    control: ChainControl<'_>,
) -> Result<Vec<ChainOutput>>
where
    F: CpuLogpFunc + Clone + Send + Sync,
    I: InitPointFunc + Send,
{
    let mut builder = ThreadPoolBuilder::new();
    if let Some(threads) = num_threads {
        builder = builder.num_threads(threads);
    }
    let pool = builder.build().context("Could not start thread pool")?;

    pool.install(|| {
        inits
            .into_par_iter()
            .enumerate()
            .map(|(chain, init)| {
                sample_chain(logp.clone(), init, settings, seed, chain as u64, control)
            })
            .collect()
    })
}
