//! Binned observations: cutpoints, the counts inside each bin and their
//! validation.

use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use thiserror::Error;

/// Input that violates one of the data invariants. Reported before any
/// sampling work starts.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("at least two cutpoints are required, got {0}")]
    TooFewCutpoints(usize),
    #[error("cutpoint {index} is not a number")]
    NanCutpoint { index: usize },
    #[error("cutpoint {index} is infinite; only the first and last cutpoint may be unbounded")]
    InfiniteCutpoint { index: usize },
    #[error(
        "cutpoints must be strictly increasing: cutpoint {index} ({value}) does not exceed the previous one ({previous})"
    )]
    NotIncreasing {
        index: usize,
        previous: f64,
        value: f64,
    },
    #[error("{counts} counts given for {bins} bins")]
    LengthMismatch { bins: usize, counts: usize },
    #[error("count {index} is negative ({value})")]
    NegativeCount { index: usize, value: i64 },
    #[error("the total count is zero")]
    EmptyCounts,
    #[error("the total count does not fit into 64 bits")]
    CountOverflow,
    #[error("the number of mixture components must be positive")]
    NoComponents,
    #[error("invalid mixture component {index}: {reason}")]
    InvalidComponent { index: usize, reason: &'static str },
    #[error("invalid prior: {0}")]
    InvalidPrior(&'static str),
    #[error("invalid sampler settings: {0}")]
    InvalidSettings(&'static str),
}

/// How the outermost cutpoints are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BoundaryPolicy {
    /// The first bin extends to `-inf` and the last bin to `+inf`.
    #[default]
    Open,
    /// The latent distribution is truncated to `[first, last]`.
    Closed,
}

/// Strictly increasing bin boundaries.
///
/// Only the first value may be `-inf` and only the last may be `+inf`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cutpoints {
    values: Box<[f64]>,
}

impl Cutpoints {
    pub fn new(values: impl Into<Vec<f64>>) -> Result<Self, InputError> {
        let values: Vec<f64> = values.into();
        let n = values.len();
        if n < 2 {
            return Err(InputError::TooFewCutpoints(n));
        }
        for (index, &value) in values.iter().enumerate() {
            if value.is_nan() {
                return Err(InputError::NanCutpoint { index });
            }
            let unbounded_ok = (index == 0 && value == f64::NEG_INFINITY)
                || (index == n - 1 && value == f64::INFINITY);
            if value.is_infinite() && !unbounded_ok {
                return Err(InputError::InfiniteCutpoint { index });
            }
        }
        for (index, pair) in values.windows(2).enumerate() {
            if pair[1] <= pair[0] {
                return Err(InputError::NotIncreasing {
                    index: index + 1,
                    previous: pair[0],
                    value: pair[1],
                });
            }
        }
        Ok(Self {
            values: values.into(),
        })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn num_bins(&self) -> usize {
        self.values.len() - 1
    }

    /// The smallest and largest finite cutpoint.
    ///
    /// With a single finite cutpoint both ends are equal.
    pub fn finite_range(&self) -> Option<(f64, f64)> {
        let mut finite = self.values.iter().copied().filter(|x| x.is_finite());
        let first = finite.next()?;
        let last = finite.last().unwrap_or(first);
        Some((first, last))
    }
}

/// Non-negative counts, one per bin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObservedCounts {
    counts: Box<[u64]>,
    total: u64,
}

impl ObservedCounts {
    pub fn new(counts: impl Into<Vec<u64>>) -> Result<Self, InputError> {
        let counts: Vec<u64> = counts.into();
        let total = counts
            .iter()
            .try_fold(0u64, |acc, &count| acc.checked_add(count))
            .ok_or(InputError::CountOverflow)?;
        if total == 0 {
            return Err(InputError::EmptyCounts);
        }
        Ok(Self {
            counts: counts.into(),
            total,
        })
    }

    /// Validate counts that arrive as signed integers, as tabular inputs do.
    pub fn from_signed(counts: &[i64]) -> Result<Self, InputError> {
        let unsigned = counts
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                u64::try_from(value).map_err(|_| InputError::NegativeCount { index, value })
            })
            .collect::<Result<Vec<u64>, _>>()?;
        Self::new(unsigned)
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Validated cutpoints and counts. Read-only once constructed and shared
/// between all chains.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinnedData {
    cutpoints: Cutpoints,
    counts: ObservedCounts,
    policy: BoundaryPolicy,
    /// Edges the likelihood integrates over, after applying `policy`.
    edges: Box<[f64]>,
    log_multinomial_coef: f64,
}

impl BinnedData {
    pub fn new(
        cutpoints: Cutpoints,
        counts: ObservedCounts,
        policy: BoundaryPolicy,
    ) -> Result<Self, InputError> {
        let bins = cutpoints.num_bins();
        if counts.len() != bins {
            return Err(InputError::LengthMismatch {
                bins,
                counts: counts.len(),
            });
        }

        let mut edges: Box<[f64]> = cutpoints.as_slice().into();
        if policy == BoundaryPolicy::Open {
            edges[0] = f64::NEG_INFINITY;
            edges[bins] = f64::INFINITY;
        }

        let log_multinomial_coef = ln_gamma(counts.total() as f64 + 1.)
            - counts
                .as_slice()
                .iter()
                .map(|&n| ln_gamma(n as f64 + 1.))
                .sum::<f64>();

        Ok(Self {
            cutpoints,
            counts,
            policy,
            edges,
            log_multinomial_coef,
        })
    }

    /// Validate raw cutpoints and signed counts in one go.
    pub fn from_raw(
        cutpoints: &[f64],
        counts: &[i64],
        policy: BoundaryPolicy,
    ) -> Result<Self, InputError> {
        let cutpoints = Cutpoints::new(cutpoints)?;
        let bins = cutpoints.num_bins();
        if counts.len() != bins {
            return Err(InputError::LengthMismatch {
                bins,
                counts: counts.len(),
            });
        }
        Self::new(cutpoints, ObservedCounts::from_signed(counts)?, policy)
    }

    pub fn cutpoints(&self) -> &Cutpoints {
        &self.cutpoints
    }

    pub fn counts(&self) -> &ObservedCounts {
        &self.counts
    }

    pub fn policy(&self) -> BoundaryPolicy {
        self.policy
    }

    pub fn num_bins(&self) -> usize {
        self.cutpoints.num_bins()
    }

    pub fn total(&self) -> u64 {
        self.counts.total()
    }

    pub(crate) fn edges(&self) -> &[f64] {
        &self.edges
    }

    /// `ln(N!) - sum(ln(n_i!))`
    pub(crate) fn log_multinomial_coef(&self) -> f64 {
        self.log_multinomial_coef
    }

    /// Truncation range of the latent distribution, if any.
    pub(crate) fn closed_range(&self) -> Option<(f64, f64)> {
        match self.policy {
            BoundaryPolicy::Open => None,
            BoundaryPolicy::Closed => Some((self.edges[0], self.edges[self.num_bins()])),
        }
    }

    /// Approximate quantile of the observed scores, interpolating linearly
    /// inside bins. Unbounded outer bins are given the width of their
    /// neighbour.
    pub fn empirical_quantile(&self, q: f64) -> f64 {
        let cuts = self.cutpoints.as_slice();
        let bins = self.num_bins();
        let target = q.clamp(0., 1.) * self.total() as f64;

        let mut cumulative = 0f64;
        for (i, &count) in self.counts.as_slice().iter().enumerate() {
            let next = cumulative + count as f64;
            if next >= target && count > 0 {
                let (lo, hi) = self.bounded_bin(i, cuts, bins);
                let frac = (target - cumulative) / count as f64;
                return lo + frac * (hi - lo);
            }
            cumulative = next;
        }
        let (_, hi) = self.bounded_bin(bins - 1, cuts, bins);
        hi
    }

    fn bounded_bin(&self, i: usize, cuts: &[f64], bins: usize) -> (f64, f64) {
        let mut lo = cuts[i];
        let mut hi = cuts[i + 1];
        let width = self
            .cutpoints
            .finite_range()
            .map(|(a, b)| ((b - a) / bins as f64).max(1.))
            .unwrap_or(1.);
        if !lo.is_finite() {
            lo = hi - width;
        }
        if !hi.is_finite() {
            hi = lo + width;
        }
        (lo, hi)
    }
}
