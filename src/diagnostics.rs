//! Convergence diagnostics across chains: split R-hat, its rank-normalized
//! variant, bulk and tail effective sample size.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;
use tracing::warn;

use crate::math::{quantile_sorted, sort_floats};

/// Limits beyond which a run is reported as not converged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticThresholds {
    pub max_rhat: f64,
    pub min_ess: f64,
    /// Largest tolerated fraction of divergent draws after warmup, per chain.
    pub max_divergence_rate: f64,
}

impl Default for DiagnosticThresholds {
    fn default() -> Self {
        Self {
            max_rhat: 1.01,
            min_ess: 400.,
            max_divergence_rate: 0.,
        }
    }
}

/// Convergence problems. None of them stop a run.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
pub enum ConvergenceWarning {
    #[error("only {chains} chain(s) were run; between-chain diagnostics need at least two")]
    TooFewChains { chains: usize },
    #[error("R-hat of {parameter} is {rhat:.4}")]
    HighRhat { parameter: String, rhat: f64 },
    #[error("effective sample size of {parameter} is {ess:.1}")]
    LowEss { parameter: String, ess: f64 },
    #[error("chain {chain} has {count} divergent draws after warmup ({rate:.4} of draws)")]
    Divergences { chain: u64, count: usize, rate: f64 },
    #[error("chain {chain} was cancelled after {draws} draws")]
    IncompleteChain { chain: u64, draws: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterDiagnostics {
    pub name: String,
    /// Classic split R-hat.
    pub rhat: f64,
    /// Split R-hat of rank-normalized and of folded draws, whichever is
    /// larger.
    pub rank_rhat: f64,
    pub ess_bulk: f64,
    pub ess_tail: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainDiagnostics {
    pub chain: u64,
    pub draws: usize,
    pub divergences: usize,
    pub warmup_divergences: usize,
    pub max_depth_hits: usize,
    pub incomplete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub parameters: Vec<ParameterDiagnostics>,
    pub chains: Vec<ChainDiagnostics>,
    pub warnings: Vec<ConvergenceWarning>,
}

impl Diagnostics {
    pub fn max_rhat(&self) -> f64 {
        self.parameters
            .iter()
            .map(|p| p.rhat)
            .filter(|r| !r.is_nan())
            .fold(f64::NAN, f64::max)
    }

    pub fn min_ess(&self) -> f64 {
        self.parameters
            .iter()
            .map(|p| p.ess_bulk)
            .fold(f64::NAN, f64::min)
    }

    pub fn total_divergences(&self) -> usize {
        self.chains.iter().map(|c| c.divergences).sum()
    }

    pub fn is_converged(&self) -> bool {
        self.warnings.is_empty()
    }
}

fn mean_var(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss: f64 = values.iter().map(|x| (x - mean) * (x - mean)).sum();
    (mean, ss / (n - 1.))
}

/// Split every chain in two halves of equal length. `None` if a chain is
/// too short.
fn split_halves<'a>(chains: &[&'a [f64]], min_len: usize) -> Option<Vec<&'a [f64]>> {
    let half = chains.iter().map(|c| c.len() / 2).min()?;
    if half < min_len {
        return None;
    }
    Some(
        chains
            .iter()
            .flat_map(|c| {
                let (a, b) = c.split_at(c.len() / 2);
                [&a[..half], &b[..half]]
            })
            .collect(),
    )
}

/// Within-chain variance, and the pooled estimate of the marginal posterior
/// variance.
fn variance_components(halves: &[&[f64]]) -> (f64, f64) {
    let m = halves.len() as f64;
    let n = halves[0].len() as f64;
    let stats: Vec<(f64, f64)> = halves.iter().map(|c| mean_var(c)).collect();
    let grand = stats.iter().map(|s| s.0).sum::<f64>() / m;
    let between = n / (m - 1.) * stats.iter().map(|s| (s.0 - grand).powi(2)).sum::<f64>();
    let within = stats.iter().map(|s| s.1).sum::<f64>() / m;
    let var_plus = (n - 1.) / n * within + between / n;
    (within, var_plus)
}

/// Split R-hat of one scalar over several chains.
///
/// `NaN` if a chain has fewer than four draws. Draws that are constant
/// overall give 1, chains that are each constant at different values give
/// infinity.
pub fn split_rhat(chains: &[&[f64]]) -> f64 {
    let Some(halves) = split_halves(chains, 2) else {
        return f64::NAN;
    };
    let (within, var_plus) = variance_components(&halves);
    if within <= 1e-300 {
        return if var_plus <= 1e-300 { 1. } else { f64::INFINITY };
    }
    (var_plus / within).sqrt()
}

/// Replace every draw by the normal quantile of its average rank among all
/// draws.
fn rank_normalize(chains: &[&[f64]]) -> Vec<Vec<f64>> {
    let mut flat: Vec<(f64, usize, usize)> = chains
        .iter()
        .enumerate()
        .flat_map(|(c, chain)| chain.iter().enumerate().map(move |(i, &x)| (x, c, i)))
        .collect();
    flat.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Greater));

    let normal = Normal::new(0., 1.).expect("standard normal parameters are valid");
    let total = flat.len() as f64;
    let mut out: Vec<Vec<f64>> = chains.iter().map(|c| vec![0.; c.len()]).collect();
    let mut start = 0;
    while start < flat.len() {
        let end = start
            + flat[start..]
                .iter()
                .take_while(|entry| entry.0 == flat[start].0)
                .count()
                .max(1);
        // Average of the one-based ranks start + 1 ..= end.
        let rank = 0.5 * ((start + 1) as f64 + end as f64);
        let z = normal.inverse_cdf(((rank - 0.375) / (total + 0.25)).clamp(1e-12, 1. - 1e-12));
        for &(_, c, i) in &flat[start..end] {
            out[c][i] = z;
        }
        start = end;
    }
    out
}

fn as_slices(chains: &[Vec<f64>]) -> Vec<&[f64]> {
    chains.iter().map(Vec::as_slice).collect()
}

/// Rank-normalized split R-hat: the larger of the value on rank-normalized
/// draws and on rank-normalized distances from the median.
pub fn rank_normalized_rhat(chains: &[&[f64]]) -> f64 {
    let bulk = rank_normalize(chains);
    let mut all: Vec<f64> = chains.iter().flat_map(|c| c.iter().copied()).collect();
    sort_floats(&mut all);
    let median = quantile_sorted(&all, 0.5);
    let folded: Vec<Vec<f64>> = chains
        .iter()
        .map(|c| c.iter().map(|x| (x - median).abs()).collect())
        .collect();
    let folded = rank_normalize(&as_slices(&folded));
    split_rhat(&as_slices(&bulk)).max(split_rhat(&as_slices(&folded)))
}

/// Effective sample size using Geyer's initial monotone sequence on
/// autocorrelations estimated from the multi-chain variogram.
pub fn ess(chains: &[&[f64]]) -> f64 {
    let Some(halves) = split_halves(chains, 4) else {
        return 0.;
    };
    let m = halves.len();
    let n = halves[0].len();
    let total = (m * n) as f64;
    let (_, var_plus) = variance_components(&halves);
    if !(var_plus.is_finite() && var_plus > 1e-300) {
        return total;
    }

    let autocorr = |lag: usize| {
        let sq: f64 = halves
            .iter()
            .map(|c| c.windows(lag + 1).map(|w| (w[lag] - w[0]).powi(2)).sum::<f64>())
            .sum();
        let variogram = sq / (m * (n - lag)) as f64;
        (1. - variogram / (2. * var_plus)).clamp(-1., 1.)
    };

    // Sums of consecutive pairs of autocorrelations, truncated at the first
    // negative one and forced to be non-increasing.
    let mut tau = -1f64;
    let mut previous = f64::INFINITY;
    let mut lag = 0;
    while lag + 1 < n {
        let pair = if lag == 0 { 1. } else { autocorr(lag) } + autocorr(lag + 1);
        if pair < 0. {
            break;
        }
        let pair = pair.min(previous);
        tau += 2. * pair;
        previous = pair;
        lag += 2;
    }
    if !(tau.is_finite() && tau > 0.) {
        return total;
    }
    (total / tau).clamp(1., total * total.log10().max(1.))
}

/// Bulk effective sample size computed on rank-normalized draws.
pub fn bulk_ess(chains: &[&[f64]]) -> f64 {
    ess(&as_slices(&rank_normalize(chains)))
}

/// Effective sample size of the 5% and 95% quantile indicators, whichever is
/// smaller.
pub fn tail_ess(chains: &[&[f64]]) -> f64 {
    let mut all: Vec<f64> = chains.iter().flat_map(|c| c.iter().copied()).collect();
    if all.is_empty() {
        return 0.;
    }
    sort_floats(&mut all);
    let lower = quantile_sorted(&all, 0.05);
    let upper = quantile_sorted(&all, 0.95);
    let indicator = |pred: &dyn Fn(f64) -> bool| -> Vec<Vec<f64>> {
        chains
            .iter()
            .map(|c| c.iter().map(|&x| if pred(x) { 1. } else { 0. }).collect())
            .collect()
    };
    let below = indicator(&|x| x <= lower);
    let above = indicator(&|x| x >= upper);
    ess(&as_slices(&below)).min(ess(&as_slices(&above)))
}

/// Diagnose a run.
///
/// `parameters` holds, for every scalar, its name and the post-warmup draws
/// of each chain. Warnings are also emitted as `tracing` events.
pub fn compute_diagnostics(
    parameters: &[(String, Vec<Vec<f64>>)],
    chains: Vec<ChainDiagnostics>,
    thresholds: &DiagnosticThresholds,
) -> Diagnostics {
    let mut warnings = Vec::new();
    if chains.len() < 2 {
        warnings.push(ConvergenceWarning::TooFewChains {
            chains: chains.len(),
        });
    }

    let parameters: Vec<ParameterDiagnostics> = parameters
        .iter()
        .map(|(name, draws)| {
            let draws = as_slices(draws);
            ParameterDiagnostics {
                name: name.clone(),
                rhat: split_rhat(&draws),
                rank_rhat: rank_normalized_rhat(&draws),
                ess_bulk: bulk_ess(&draws),
                ess_tail: tail_ess(&draws),
            }
        })
        .collect();

    for param in parameters.iter() {
        // `f64::max` would hide a NaN.
        let rhat = if param.rhat.is_nan() || param.rank_rhat.is_nan() {
            f64::NAN
        } else {
            param.rhat.max(param.rank_rhat)
        };
        if !(rhat <= thresholds.max_rhat) {
            warnings.push(ConvergenceWarning::HighRhat {
                parameter: param.name.clone(),
                rhat,
            });
        }
        let ess = param.ess_bulk.min(param.ess_tail);
        if !(ess >= thresholds.min_ess) {
            warnings.push(ConvergenceWarning::LowEss {
                parameter: param.name.clone(),
                ess,
            });
        }
    }

    for chain in chains.iter() {
        if chain.draws > 0 {
            let rate = chain.divergences as f64 / chain.draws as f64;
            if rate > thresholds.max_divergence_rate {
                warnings.push(ConvergenceWarning::Divergences {
                    chain: chain.chain,
                    count: chain.divergences,
                    rate,
                });
            }
        }
        if chain.incomplete {
            warnings.push(ConvergenceWarning::IncompleteChain {
                chain: chain.chain,
                draws: chain.draws,
            });
        }
    }

    for warning in warnings.iter() {
        warn!(%warning, "convergence problem");
    }

    Diagnostics {
        parameters,
        chains,
        warnings,
    }
}
