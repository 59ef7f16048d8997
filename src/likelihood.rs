//! Per-bin probabilities of a mixture and the multinomial log-likelihood of
//! the observed counts, with its gradient.

use thiserror::Error;

use crate::cpu_potential::LogpError;
use crate::data::BinnedData;
use crate::math::{log1mexp, log_diff_exp, log_ndtr, log_ndtr_sf, logaddexp, logsumexp, norm_logpdf};
use crate::mixture::{MixtureComponent, MixtureModel};
use crate::transform::ConstrainedGradient;

/// The log density can not be evaluated at a parameter value.
///
/// Always recoverable: the sampler treats it like a divergence.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DegenerateError {
    #[error("bin {bin} holds {count} observations but has zero probability")]
    EmptyBin { bin: usize, count: u64 },
    #[error("probability of bin {bin} is not a number")]
    NanProbability { bin: usize },
    #[error("the mixture puts no mass inside the closed range")]
    EmptyRange,
    #[error("component {component} maps to an invalid spread or mean")]
    InvalidParameters { component: usize },
    #[error("log density is not finite")]
    NonFiniteLogp,
    #[error("gradient coordinate {index} is not finite")]
    NonFiniteGradient { index: usize },
}

impl LogpError for DegenerateError {
    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Log CDF, log survival function and log density of one component at one
/// edge.
#[derive(Debug, Clone, Copy)]
struct Edge {
    z: f64,
    log_cdf: f64,
    log_sf: f64,
}

impl Edge {
    fn new(component: &MixtureComponent, x: f64) -> Self {
        let z = (x - component.mean) / component.spread;
        Self {
            z,
            log_cdf: log_ndtr(z),
            log_sf: log_ndtr_sf(z),
        }
    }

    /// `log(phi(z))`, `-inf` at an unbounded edge.
    fn log_pdf(&self) -> f64 {
        if self.z.is_finite() {
            norm_logpdf(self.z)
        } else {
            f64::NEG_INFINITY
        }
    }

    /// `z * phi(z) / total` given `phi(z) / total`, zero at an unbounded
    /// edge.
    fn z_pdf_scaled(&self, pdf_scaled: f64) -> f64 {
        if self.z.is_finite() {
            self.z * pdf_scaled
        } else {
            0.
        }
    }
}

/// `log(Phi(hi) - Phi(lo))` for one component.
///
/// Subtracts CDFs below the mode and survival functions above it so that
/// neither difference cancels. Rounding can not make the mass negative, a
/// bin narrower than the resolution of `log_ndtr` gets zero mass.
fn log_mass(lo: &Edge, hi: &Edge) -> f64 {
    if hi.z <= 0. {
        log_diff_exp(hi.log_cdf, lo.log_cdf.min(hi.log_cdf))
    } else if lo.z >= 0. {
        log_diff_exp(lo.log_sf, hi.log_sf.min(lo.log_sf))
    } else {
        log1mexp(logaddexp(lo.log_cdf, hi.log_sf).min(0.))
    }
}

/// Per component edge terms, stored edge-major per component.
struct EdgeTable {
    edges: Vec<Edge>,
    n_edges: usize,
}

impl EdgeTable {
    fn new(model: &MixtureModel, xs: &[f64]) -> Self {
        let edges = model
            .components()
            .iter()
            .flat_map(|c| xs.iter().map(move |&x| Edge::new(c, x)))
            .collect();
        Self {
            edges,
            n_edges: xs.len(),
        }
    }

    fn get(&self, component: usize, edge: usize) -> &Edge {
        &self.edges[component * self.n_edges + edge]
    }
}

/// Log of the un-normalised mixture mass and the per component log masses
/// between two edges.
fn mixture_log_mass(
    log_weights: &[f64],
    table: &EdgeTable,
    lo: usize,
    hi: usize,
    component_log_mass: &mut [f64],
) -> f64 {
    for (j, out) in component_log_mass.iter_mut().enumerate() {
        *out = log_mass(table.get(j, lo), table.get(j, hi));
    }
    let terms: Vec<f64> = log_weights
        .iter()
        .zip(component_log_mass.iter())
        .map(|(w, m)| w + m)
        .collect();
    logsumexp(&terms)
}

/// Log of the normalising mass under a closed boundary policy, zero if the
/// bins cover the whole real line.
fn log_normalizer(model: &MixtureModel, data: &BinnedData) -> Result<f64, DegenerateError> {
    let Some((lo, hi)) = data.closed_range() else {
        return Ok(0.);
    };
    let log_weights: Vec<f64> = model.weights().map(f64::ln).collect();
    let table = EdgeTable::new(model, &[lo, hi]);
    let mut scratch = vec![0.; model.num_components()];
    let log_z = mixture_log_mass(&log_weights, &table, 0, 1, &mut scratch);
    if log_z.is_nan() || log_z == f64::NEG_INFINITY {
        return Err(DegenerateError::EmptyRange);
    }
    Ok(log_z)
}

/// Log probability of every bin. Entries may be `-inf` where the mixture
/// puts no representable mass.
pub fn bin_log_probabilities(
    model: &MixtureModel,
    data: &BinnedData,
) -> Result<Vec<f64>, DegenerateError> {
    let log_z = log_normalizer(model, data)?;
    let log_weights: Vec<f64> = model.weights().map(f64::ln).collect();
    let table = EdgeTable::new(model, data.edges());
    let mut scratch = vec![0.; model.num_components()];
    (0..data.num_bins())
        .map(|bin| {
            let log_p = mixture_log_mass(&log_weights, &table, bin, bin + 1, &mut scratch) - log_z;
            if log_p.is_nan() {
                Err(DegenerateError::NanProbability { bin })
            } else {
                Ok(log_p.min(0.))
            }
        })
        .collect()
}

/// Probability of every bin. Non-negative and summing to one.
pub fn bin_probabilities(
    model: &MixtureModel,
    data: &BinnedData,
) -> Result<Vec<f64>, DegenerateError> {
    Ok(bin_log_probabilities(model, data)?
        .into_iter()
        .map(f64::exp)
        .collect())
}

/// Multinomial log-likelihood of the observed counts.
pub fn log_likelihood(model: &MixtureModel, data: &BinnedData) -> Result<f64, DegenerateError> {
    let log_p = bin_log_probabilities(model, data)?;
    let mut total = data.log_multinomial_coef();
    for (bin, (&n, &log_p)) in data.counts().as_slice().iter().zip(&log_p).enumerate() {
        if n == 0 {
            continue;
        }
        if log_p == f64::NEG_INFINITY {
            return Err(DegenerateError::EmptyBin { bin, count: n });
        }
        total += n as f64 * log_p;
    }
    if !total.is_finite() {
        return Err(DegenerateError::NonFiniteLogp);
    }
    Ok(total)
}

/// Add `weight * d log(mass(lo, hi)) / d theta` to `grad` for every
/// component parameter.
fn accumulate_mass_gradient(
    model: &MixtureModel,
    table: &EdgeTable,
    lo: usize,
    hi: usize,
    log_total: f64,
    component_log_mass: &[f64],
    weight: f64,
    grad: &mut ConstrainedGradient,
) {
    for (j, c) in model.components().iter().enumerate() {
        let a = table.get(j, lo);
        let b = table.get(j, hi);

        // phi(z) / total, kept in log space until the end.
        let pdf_a = (a.log_pdf() - log_total).exp();
        let pdf_b = (b.log_pdf() - log_total).exp();
        let scale = weight * c.weight / c.spread;

        grad.mean[j] += scale * (pdf_a - pdf_b);
        grad.spread[j] += scale * (a.z_pdf_scaled(pdf_a) - b.z_pdf_scaled(pdf_b));
        grad.weight[j] += weight * (component_log_mass[j] - log_total).exp();
    }
}

/// Log-likelihood and its gradient with respect to the constrained
/// parameters, which are added to `grad`.
pub(crate) fn log_likelihood_grad(
    model: &MixtureModel,
    data: &BinnedData,
    grad: &mut ConstrainedGradient,
) -> Result<f64, DegenerateError> {
    let k = model.num_components();
    let log_weights: Vec<f64> = model.weights().map(f64::ln).collect();
    let table = EdgeTable::new(model, data.edges());
    let mut component_log_mass = vec![0.; k];

    let mut total = data.log_multinomial_coef();
    for (bin, &n) in data.counts().as_slice().iter().enumerate() {
        if n == 0 {
            continue;
        }
        let log_p = mixture_log_mass(&log_weights, &table, bin, bin + 1, &mut component_log_mass);
        if log_p.is_nan() {
            return Err(DegenerateError::NanProbability { bin });
        }
        if log_p == f64::NEG_INFINITY {
            return Err(DegenerateError::EmptyBin { bin, count: n });
        }
        total += n as f64 * log_p;
        accumulate_mass_gradient(
            model,
            &table,
            bin,
            bin + 1,
            log_p,
            &component_log_mass,
            n as f64,
            grad,
        );
    }

    if let Some((lo, hi)) = data.closed_range() {
        // Renormalising by the in-range mass acts like one extra bin over the
        // whole range holding `-N` observations.
        let range_table = EdgeTable::new(model, &[lo, hi]);
        let log_z = mixture_log_mass(&log_weights, &range_table, 0, 1, &mut component_log_mass);
        if log_z.is_nan() || log_z == f64::NEG_INFINITY {
            return Err(DegenerateError::EmptyRange);
        }
        let n = data.total() as f64;
        total -= n * log_z;
        accumulate_mass_gradient(
            model,
            &range_table,
            0,
            1,
            log_z,
            &component_log_mass,
            -n,
            grad,
        );
    }

    if !total.is_finite() {
        return Err(DegenerateError::NonFiniteLogp);
    }
    Ok(total)
}
