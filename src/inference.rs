//! Running a full inference: configuration, parallel chains and the result
//! handed to downstream consumers.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::adapt_strategy::DualAverageStats;
use crate::chain::NutsSampleStats;
use crate::cpu_sampler::{
    sample_parallel, ChainControl, ChainOutput, ChainProgress, JitterInitFunc, SamplerArgs,
};
use crate::data::{BinnedData, InputError};
use crate::derived::tail_probability;
use crate::diagnostics::{compute_diagnostics, ChainDiagnostics, DiagnosticThresholds, Diagnostics};
use crate::mixture::{MixtureComponent, MixtureModel};
use crate::posterior::{MixturePosterior, PriorConfig, Priors};
use crate::transform::MixtureTransform;

/// Everything that determines an inference run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Number of Normal components of the mixture.
    pub num_components: usize,
    pub priors: PriorConfig,
    pub num_chains: usize,
    /// Warmup and draw counts, tree depth, energy threshold and adaptation.
    pub sampler: SamplerArgs,
    /// Base seed. Chain `i` uses stream `i` of a generator seeded with it.
    pub seed: u64,
    /// Thresholds at which every sample records its tail probability.
    pub thresholds: Vec<f64>,
    pub diagnostics: DiagnosticThresholds,
    /// Half-width of the uniform jitter applied to initial points on the
    /// unconstrained scale.
    pub init_jitter: f64,
    /// Size of the thread pool. All cores when unset.
    pub num_threads: Option<usize>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            num_components: 3,
            priors: PriorConfig::default(),
            num_chains: 4,
            sampler: SamplerArgs::default(),
            seed: 0,
            thresholds: Vec::new(),
            diagnostics: DiagnosticThresholds::default(),
            init_jitter: 0.5,
            num_threads: None,
        }
    }
}

impl InferenceConfig {
    pub fn target_accept(&self) -> f64 {
        self.sampler.adapt.step_size.target_accept
    }

    pub fn set_target_accept(&mut self, target: f64) {
        self.sampler.adapt.step_size.target_accept = target;
    }

    /// Check everything that can be checked without the data.
    pub fn validate(&self) -> Result<(), InputError> {
        let invalid = |what| Err(InputError::InvalidSettings(what));
        if self.num_components == 0 {
            return Err(InputError::NoComponents);
        }
        if self.num_chains == 0 {
            return invalid("at least one chain is required");
        }
        let step = &self.sampler.adapt.step_size;
        if !(step.target_accept > 0. && step.target_accept < 1.) {
            return invalid("target acceptance must lie strictly between 0 and 1");
        }
        if !(step.early_target_accept > 0. && step.early_target_accept < 1.) {
            return invalid("early target acceptance must lie strictly between 0 and 1");
        }
        if !(step.params.initial_step.is_finite() && step.params.initial_step > 0.) {
            return invalid("the initial step size must be positive");
        }
        if self.sampler.num_draws == 0 {
            return invalid("at least one draw is required");
        }
        if self.sampler.maxdepth == 0 || self.sampler.maxdepth > 30 {
            return invalid("the maximum tree depth must be between 1 and 30");
        }
        if !(self.sampler.max_energy_error > 0.) {
            return invalid("the maximum energy error must be positive");
        }
        if self.thresholds.iter().any(|t| t.is_nan()) {
            return invalid("thresholds must not be NaN");
        }
        if !(self.init_jitter.is_finite() && self.init_jitter >= 0.) {
            return invalid("the initial jitter must be finite and non-negative");
        }
        if self.num_threads == Some(0) {
            return invalid("the thread pool needs at least one thread");
        }
        Ok(())
    }
}

/// Caller-side hooks into a running inference.
#[derive(Default)]
pub struct RunControl<'a> {
    /// Chains stop at their next iteration once this flag is set.
    pub cancel: Option<&'a AtomicBool>,
    /// Called from the chain threads after every draw.
    pub progress: Option<&'a (dyn Fn(&ChainProgress) + Sync)>,
    /// One starting model per chain, replacing the data-driven default.
    pub initial_models: Option<Vec<MixtureModel>>,
}

/// Statistics of the transition that produced a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SampleStats {
    pub depth: u64,
    pub maxdepth_reached: bool,
    pub step_size: f64,
    pub energy: f64,
    pub logp: f64,
    pub mean_tree_accept: f64,
    pub n_steps: u64,
    /// Dual averaging estimate of the final step size.
    pub step_size_bar: f64,
    pub diverging: bool,
    /// Energy error of the divergent leapfrog step, if it was finite
    /// enough to compute.
    pub divergence_energy_error: Option<f64>,
    /// Zero if the chain stayed at its previous point.
    pub index_in_trajectory: i64,
}

impl From<&NutsSampleStats<DualAverageStats>> for SampleStats {
    fn from(stats: &NutsSampleStats<DualAverageStats>) -> Self {
        Self {
            depth: stats.depth,
            maxdepth_reached: stats.maxdepth_reached,
            step_size: stats.step_size,
            energy: stats.energy,
            logp: stats.logp,
            mean_tree_accept: stats.strategy_stats.mean_tree_accept,
            n_steps: stats.strategy_stats.n_steps,
            step_size_bar: stats.strategy_stats.step_size_bar,
            diverging: stats.diverging(),
            divergence_energy_error: stats
                .divergence_info
                .as_ref()
                .and_then(|div| div.energy_error),
            index_in_trajectory: stats.index_in_trajectory,
        }
    }
}

/// One draw of the posterior.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PosteriorSample {
    pub model: MixtureModel,
    /// Tail probability at each configured threshold, in the same order.
    pub tail_probabilities: Vec<f64>,
    pub stats: SampleStats,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chain {
    pub chain: u64,
    pub warmup: Vec<PosteriorSample>,
    pub samples: Vec<PosteriorSample>,
    /// Divergent transitions after warmup.
    pub divergences: usize,
    pub warmup_divergences: usize,
    /// The chain was cancelled before finishing.
    pub incomplete: bool,
    pub step_size: f64,
    pub mass_matrix_diag: Vec<f64>,
}

/// The outcome of a run. Read-only.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceResult {
    data: BinnedData,
    config: InferenceConfig,
    priors: Priors,
    chains: Vec<Chain>,
    diagnostics: Diagnostics,
}

impl InferenceResult {
    pub fn data(&self) -> &BinnedData {
        &self.data
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    pub fn chains(&self) -> &[Chain] {
        &self.chains
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// All post-warmup samples, chain by chain.
    pub fn samples(&self) -> impl Iterator<Item = &PosteriorSample> + '_ {
        self.chains.iter().flat_map(|c| c.samples.iter())
    }

    pub fn num_samples(&self) -> usize {
        self.chains.iter().map(|c| c.samples.len()).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.chains.iter().all(|c| !c.incomplete)
    }
}

/// Starting model derived from the data: means at evenly spaced central
/// quantiles of the binned scores, equal weights and spreads proportional
/// to the width of the central 80%.
pub fn default_initial_model(data: &BinnedData, k: usize) -> Result<MixtureModel, InputError> {
    if k == 0 {
        return Err(InputError::NoComponents);
    }
    let lo = data.empirical_quantile(0.1);
    let hi = data.empirical_quantile(0.9);
    let width = if hi > lo { hi - lo } else { 1. };
    let min_gap = 1e-3 * width;

    let mut components: Vec<MixtureComponent> = Vec::with_capacity(k);
    for j in 0..k {
        let q = 0.1 + 0.8 * (j as f64 + 0.5) / k as f64;
        let mut mean = data.empirical_quantile(q);
        if let Some(prev) = components.last() {
            mean = mean.max(prev.mean + min_gap);
        }
        components.push(MixtureComponent::new(mean, width / k as f64, 1.));
    }
    MixtureModel::new(components)
}

fn initial_points(
    data: &BinnedData,
    config: &InferenceConfig,
    transform: &MixtureTransform,
    initial_models: Option<Vec<MixtureModel>>,
) -> Result<Vec<JitterInitFunc>, InputError> {
    let centers = match initial_models {
        Some(models) => {
            if models.len() != config.num_chains {
                return Err(InputError::InvalidSettings(
                    "one initial model per chain is required",
                ));
            }
            models
                .iter()
                .map(|model| transform.to_unconstrained(model))
                .collect::<Result<Vec<_>, _>>()?
        }
        None => {
            let center = transform
                .to_unconstrained(&default_initial_model(data, config.num_components)?)?;
            vec![center; config.num_chains]
        }
    };
    Ok(centers
        .into_iter()
        .map(|center| JitterInitFunc::new_with_mean(center.into(), config.init_jitter))
        .collect())
}

fn parameter_names(k: usize, thresholds: &[f64]) -> Vec<String> {
    let mut names = Vec::with_capacity(3 * k + thresholds.len());
    for kind in ["mean", "spread", "weight"] {
        names.extend((0..k).map(|j| format!("{}[{}]", kind, j)));
    }
    names.extend(thresholds.iter().map(|t| format!("tail[{}]", t)));
    names
}

impl PosteriorSample {
    /// Scalars in the order of `parameter_names`.
    fn scalars(&self) -> impl Iterator<Item = f64> + '_ {
        self.model
            .means()
            .chain(self.model.spreads())
            .chain(self.model.weights())
            .chain(self.tail_probabilities.iter().copied())
    }
}

fn build_chain(
    output: ChainOutput,
    transform: &MixtureTransform,
    data: &BinnedData,
    thresholds: &[f64],
) -> Result<Chain> {
    let mut warmup = Vec::new();
    let mut samples = Vec::with_capacity(output.draws.len());
    for (draw, stats) in output.draws.iter().zip(output.stats.iter()) {
        let model = transform.to_constrained(draw).with_context(|| {
            format!(
                "Chain {} returned a position outside the model at draw {}",
                output.chain, stats.draw
            )
        })?;
        let tail_probabilities = thresholds
            .iter()
            .map(|&t| tail_probability(&model, data, t))
            .collect();
        let sample = PosteriorSample {
            model,
            tail_probabilities,
            stats: stats.into(),
        };
        if stats.tuning {
            warmup.push(sample);
        } else {
            samples.push(sample);
        }
    }
    let count_divergent = |samples: &[PosteriorSample]| {
        samples.iter().filter(|s| s.stats.diverging).count()
    };
    Ok(Chain {
        chain: output.chain,
        divergences: count_divergent(&samples),
        warmup_divergences: count_divergent(&warmup),
        warmup,
        samples,
        incomplete: output.incomplete,
        step_size: output.final_step_size,
        mass_matrix_diag: output.mass_matrix_diag.into_vec(),
    })
}

fn diagnose(chains: &[Chain], k: usize, config: &InferenceConfig) -> Diagnostics {
    let names = parameter_names(k, &config.thresholds);
    let sampled: Vec<&Chain> = chains.iter().filter(|c| !c.samples.is_empty()).collect();
    let mut values: Vec<(String, Vec<Vec<f64>>)> = names
        .into_iter()
        .map(|name| {
            let per_chain = sampled
                .iter()
                .map(|c| Vec::with_capacity(c.samples.len()))
                .collect();
            (name, per_chain)
        })
        .collect();
    for (c, chain) in sampled.iter().enumerate() {
        for sample in chain.samples.iter() {
            for ((_, per_chain), x) in values.iter_mut().zip(sample.scalars()) {
                per_chain[c].push(x);
            }
        }
    }

    let chain_diagnostics = chains
        .iter()
        .map(|c| ChainDiagnostics {
            chain: c.chain,
            draws: c.samples.len(),
            divergences: c.divergences,
            warmup_divergences: c.warmup_divergences,
            max_depth_hits: c.samples.iter().filter(|s| s.stats.maxdepth_reached).count(),
            incomplete: c.incomplete,
        })
        .collect();
    compute_diagnostics(&values, chain_diagnostics, &config.diagnostics)
}

/// Run the sampler on `data` with the default controls.
pub fn run(data: BinnedData, config: &InferenceConfig) -> Result<InferenceResult> {
    run_with_control(data, config, RunControl::default())
}

/// Run the sampler on `data`.
///
/// Invalid input fails with an [`InputError`] before any sampling starts.
/// Convergence problems and cancellation do not fail the run, they are
/// reported in the result.
pub fn run_with_control(
    data: BinnedData,
    config: &InferenceConfig,
    control: RunControl<'_>,
) -> Result<InferenceResult> {
    config.validate()?;
    let k = config.num_components;
    let priors = config.priors.resolve(&data, k)?;
    let data = Arc::new(data);
    let posterior = MixturePosterior::new(data.clone(), Arc::new(priors.clone()), k)?;
    let transform = *posterior.transform();
    let inits = initial_points(&data, config, &transform, control.initial_models)?;

    info!(
        chains = config.num_chains,
        components = k,
        bins = data.num_bins(),
        total = data.total(),
        num_tune = config.sampler.num_tune,
        num_draws = config.sampler.num_draws,
        seed = config.seed,
        "starting inference"
    );

    let local_cancel = AtomicBool::new(false);
    let chain_control = ChainControl {
        cancel: control.cancel.unwrap_or(&local_cancel),
        progress: control.progress,
    };
    let outputs = sample_parallel(
        posterior,
        inits,
        config.sampler,
        config.seed,
        config.num_threads,
        chain_control,
    )?;

    let chains = outputs
        .into_iter()
        .map(|output| build_chain(output, &transform, &data, &config.thresholds))
        .collect::<Result<Vec<_>>>()?;
    let diagnostics = diagnose(&chains, k, config);

    info!(
        samples = chains.iter().map(|c| c.samples.len()).sum::<usize>(),
        divergences = diagnostics.total_divergences(),
        max_rhat = diagnostics.max_rhat(),
        warnings = diagnostics.warnings.len(),
        "inference finished"
    );

    Ok(InferenceResult {
        data: Arc::unwrap_or_clone(data),
        config: config.clone(),
        priors,
        chains,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::BoundaryPolicy;
    use pretty_assertions::assert_eq;

    fn small_data() -> BinnedData {
        BinnedData::from_raw(
            &[0., 1., 2., 3., 4., 5.],
            &[50, 300, 400, 200, 50],
            BoundaryPolicy::Open,
        )
        .unwrap()
    }

    #[test]
    fn config_validation() {
        assert!(InferenceConfig::default().validate().is_ok());
        assert_eq!(InferenceConfig::default().target_accept(), 0.95);

        let mut config = InferenceConfig::default();
        config.num_components = 0;
        assert_eq!(config.validate(), Err(InputError::NoComponents));

        let mut config = InferenceConfig::default();
        config.num_chains = 0;
        assert!(matches!(config.validate(), Err(InputError::InvalidSettings(_))));

        let mut config = InferenceConfig::default();
        config.set_target_accept(1.);
        assert!(config.validate().is_err());

        let mut config = InferenceConfig::default();
        config.thresholds = vec![f64::NAN];
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_from_json() {
        let config: InferenceConfig = serde_json::from_str(
            r#"{"num_components": 2, "seed": 7, "sampler": {"num_draws": 50}, "thresholds": [3.5]}"#,
        )
        .unwrap();
        assert_eq!(config.num_components, 2);
        assert_eq!(config.seed, 7);
        assert_eq!(config.sampler.num_draws, 50);
        assert_eq!(config.sampler.num_tune, 1000);
        assert_eq!(config.target_accept(), 0.95);
        assert_eq!(config.thresholds, vec![3.5]);

        let config: InferenceConfig = serde_json::from_str(
            r#"{"sampler": {"adapt": {"step_size": {"early_target_accept": 0.3}}}}"#,
        )
        .unwrap();
        assert_eq!(config.sampler.adapt.step_size.early_target_accept, 0.3);
        assert_eq!(config.target_accept(), 0.95);
        assert_eq!(config.priors, PriorConfig::default());
    }

    #[test]
    fn default_start_is_ordered() {
        let data = small_data();
        for k in 1..6 {
            let model = default_initial_model(&data, k).unwrap();
            let means: Vec<f64> = model.means().collect();
            assert!(means.windows(2).all(|w| w[0] < w[1]), "{:?}", means);
            assert!(means.iter().all(|&m| (0. ..=5.).contains(&m)));
            assert!(model.weights().all(|w| (w - 1. / k as f64).abs() < 1e-12));
        }
    }

    #[test]
    fn initial_models_are_checked() {
        let mut config = InferenceConfig::default();
        config.num_chains = 2;
        config.num_components = 2;
        let model = MixtureModel::from_parts(&[1., 2.], &[1., 1.], &[0.5, 0.5]).unwrap();
        let control = RunControl {
            initial_models: Some(vec![model]),
            ..Default::default()
        };
        let err = run_with_control(small_data(), &config, control).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InputError>(),
            Some(InputError::InvalidSettings(_))
        ));
    }

    #[test]
    fn short_run() {
        let mut config = InferenceConfig::default();
        config.num_components = 2;
        config.num_chains = 2;
        config.sampler.num_tune = 200;
        config.sampler.num_draws = 100;
        config.thresholds = vec![2.5, 3.5];
        config.seed = 11;
        let result = run(small_data(), &config).unwrap();

        assert_eq!(result.chains().len(), 2);
        assert_eq!(result.num_samples(), 200);
        assert!(result.is_complete());
        for chain in result.chains() {
            assert_eq!(chain.warmup.len(), 200);
            assert_eq!(chain.samples.len(), 100);
            assert!(chain.step_size > 0.);
            assert_eq!(chain.mass_matrix_diag.len(), 5);
        }
        for sample in result.samples() {
            assert_eq!(sample.model.num_components(), 2);
            assert!(sample.stats.step_size_bar > 0.);
            if !sample.stats.diverging {
                assert_eq!(sample.stats.divergence_energy_error, None);
            }
            assert!(sample.tail_probabilities[0] >= sample.tail_probabilities[1]);
            assert!(sample.stats.logp.is_finite());
        }
        let diagnostics = result.diagnostics();
        assert_eq!(diagnostics.parameters.len(), 3 * 2 + 2);
        assert_eq!(diagnostics.parameters[0].name, "mean[0]");
        assert_eq!(diagnostics.parameters[7].name, "tail[3.5]");
    }
}
