//! Bayesian deconvolution of binned counts into a mixture of Normal
//! distributions, sampled with NUTS.

pub(crate) mod adapt_strategy;
pub(crate) mod chain;
pub(crate) mod cpu_potential;
pub(crate) mod cpu_sampler;
pub(crate) mod cpu_state;
pub(crate) mod data;
pub(crate) mod derived;
pub(crate) mod diagnostics;
pub(crate) mod inference;
pub(crate) mod likelihood;
pub(crate) mod mass_matrix;
pub(crate) mod math;
pub(crate) mod mixture;
pub(crate) mod nuts;
pub(crate) mod posterior;
pub(crate) mod predictive;
pub(crate) mod stepsize;
pub(crate) mod transform;

pub use adapt_strategy::{AdaptOptions, DualAverageSettings};
pub use cpu_sampler::{ChainProgress, SamplerArgs};
pub use data::{BinnedData, BoundaryPolicy, Cutpoints, InputError, ObservedCounts};
pub use derived::{
    estimate_tail, parameter_summary, tail_curve, tail_probability, ParameterSummary,
    QuantileValue, Summary, TailEstimate, DEFAULT_QUANTILES,
};
pub use diagnostics::{
    bulk_ess, compute_diagnostics, ess, rank_normalized_rhat, split_rhat, tail_ess,
    ChainDiagnostics, ConvergenceWarning, DiagnosticThresholds, Diagnostics,
    ParameterDiagnostics,
};
pub use inference::{
    default_initial_model, run, run_with_control, Chain, InferenceConfig, InferenceResult,
    PosteriorSample, RunControl, SampleStats,
};
pub use likelihood::{bin_log_probabilities, bin_probabilities, log_likelihood, DegenerateError};
pub use mass_matrix::DiagAdaptExpSettings;
pub use mixture::{MixtureComponent, MixtureModel};
pub use nuts::NutsError;
pub use posterior::{Concentration, MixturePosterior, PriorConfig, Priors};
pub use predictive::{
    posterior_predictive, predictive_summary, simulate_counts, BinCheck, PredictiveConfig,
    PredictiveDraws,
};
pub use stepsize::DualAverageOptions;
pub use transform::MixtureTransform;
