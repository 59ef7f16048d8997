use itertools::izip;
use multiversion::multiversion;
use statrs::function::erf::erfc;

/// Natural log of `sqrt(2π)`.
pub(crate) const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// Below this value `log_ndtr` switches to the asymptotic expansion.
const LOG_NDTR_ASYMPTOTIC: f64 = -20.;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// `log(sum(exp(values)))` without overflow. Returns `-inf` for an empty
/// slice or if every value is `-inf`.
pub(crate) fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// `log(1 - exp(x))` for `x <= 0`.
#[inline]
pub(crate) fn log1mexp(x: f64) -> f64 {
    if x > -std::f64::consts::LN_2 {
        (-x.exp_m1()).ln()
    } else {
        (-x.exp()).ln_1p()
    }
}

/// `log(exp(a) - exp(b))` for `a >= b`.
///
/// Returns `-inf` if `a == b` and NAN if `a < b`.
#[inline]
pub(crate) fn log_diff_exp(a: f64, b: f64) -> f64 {
    if b == f64::NEG_INFINITY {
        return a;
    }
    if a < b {
        return f64::NAN;
    }
    if a == b {
        return f64::NEG_INFINITY;
    }
    a + log1mexp(b - a)
}

/// Log density of the standard normal distribution.
#[inline]
pub(crate) fn norm_logpdf(z: f64) -> f64 {
    -0.5 * z * z - LN_SQRT_2PI
}

/// Log of the standard normal cumulative distribution function.
///
/// Accurate in the far lower tail, where `ln(Φ(z))` would underflow if it
/// were computed from `Φ(z)` directly.
pub(crate) fn log_ndtr(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    if z == f64::INFINITY {
        return 0.;
    }
    if z == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if z > 6. {
        return (-0.5 * erfc(z / std::f64::consts::SQRT_2)).ln_1p();
    }
    if z > LOG_NDTR_ASYMPTOTIC {
        return log_ndtr_erfc(z);
    }
    // Blend both methods over one unit so that the result stays continuous
    // and increasing where they meet.
    let blend = z - (LOG_NDTR_ASYMPTOTIC - 1.);
    if blend > 0. {
        return blend * log_ndtr_erfc(z) + (1. - blend) * log_ndtr_mills(z);
    }
    log_ndtr_mills(z)
}

#[inline]
fn log_ndtr_erfc(z: f64) -> f64 {
    (0.5 * erfc(-z / std::f64::consts::SQRT_2)).ln()
}

/// Mills ratio expansion: Φ(z) ≈ φ(z) / -z * (1 - 1/z² + 3/z⁴ - 15/z⁶ + 105/z⁸)
#[inline]
fn log_ndtr_mills(z: f64) -> f64 {
    let inv = (z * z).recip();
    let series = 1. - inv * (1. - 3. * inv * (1. - 5. * inv * (1. - 7. * inv)));
    norm_logpdf(z) - (-z).ln() + series.ln()
}

/// Log of the standard normal survival function `1 - Φ(z)`.
#[inline]
pub(crate) fn log_ndtr_sf(z: f64) -> f64 {
    log_ndtr(-z)
}

/// Linear interpolation quantile of an already sorted slice.
pub(crate) fn quantile_sorted(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let q = q.clamp(0., 1.);
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        return sorted[lo];
    }
    let frac = pos - lo as f64;
    sorted[lo] * (1. - frac) + sorted[hi] * frac
}

pub(crate) fn sort_floats(values: &mut [f64]) {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Greater));
}

/// Returns `((a + b) · x, (a + b) · y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn scalar_prods2(
    positive1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, positive2, x, y).fold((0., 0.), |(s1, s2), (a, b, x, y)| {
        (s1 + x * (a + b), s2 + y * (a + b))
    })
}

/// Returns `((a - b + c) · x, (a - b + c) · y)`.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn scalar_prods3(
    positive1: &[f64],
    negative1: &[f64],
    positive2: &[f64],
    x: &[f64],
    y: &[f64],
) -> (f64, f64) {
    let n = positive1.len();

    assert!(positive2.len() == n);
    assert!(negative1.len() == n);
    assert!(x.len() == n);
    assert!(y.len() == n);

    izip!(positive1, negative1, positive2, x, y).fold((0., 0.), |(s1, s2), (a, b, c, x, y)| {
        (s1 + x * (a - b + c), s2 + y * (a - b + c))
    })
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());

    let mut result = 0.;
    for (val1, val2) in a.iter().zip(b) {
        result += *val1 * *val2;
    }
    result
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(y.len() == x.len());

    izip!(x, y).for_each(|(x, y)| {
        *y = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a.mul_add(*x, *y);
    });
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x * y;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use statrs::distribution::{ContinuousCDF, Normal};

    proptest! {
        #[test]
        fn check_logaddexp(x in -10f64..10f64, y in -10f64..10f64) {
            let a = (x.exp() + y.exp()).ln();
            let b = logaddexp(x, y);
            let neginf = f64::NEG_INFINITY;
            let nan = f64::NAN;
            prop_assert!((a - b).abs() < 1e-10);
            prop_assert_eq!(b, logaddexp(y, x));
            prop_assert_eq!(x, logaddexp(x, neginf));
            prop_assert_eq!(logaddexp(neginf, neginf), neginf);
            prop_assert!(logaddexp(nan, x).is_nan());
        }

        #[test]
        fn check_log_diff_exp(x in -10f64..10f64, d in 1e-6f64..10f64) {
            let y = x - d;
            let direct = (x.exp() - y.exp()).ln();
            prop_assert!((log_diff_exp(x, y) - direct).abs() < 1e-8);
        }

        #[test]
        fn check_logsumexp(values in proptest::collection::vec(-30f64..30f64, 1..8)) {
            let direct = values.iter().map(|x| x.exp()).sum::<f64>().ln();
            prop_assert!((logsumexp(&values) - direct).abs() < 1e-9);
        }

        #[test]
        fn log_ndtr_matches_statrs(z in -8f64..8f64) {
            let normal = Normal::new(0., 1.).unwrap();
            let direct = normal.cdf(z).ln();
            prop_assert!((log_ndtr(z) - direct).abs() < 1e-9);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
        assert_eq!(logsumexp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]), f64::NEG_INFINITY);
        assert_eq!(log_diff_exp(1., f64::NEG_INFINITY), 1.);
        assert_eq!(log_diff_exp(1., 1.), f64::NEG_INFINITY);
        assert!(log_diff_exp(0., 1.).is_nan());
    }

    #[test]
    fn log_ndtr_far_tail_is_finite_and_continuous() {
        for edge in [LOG_NDTR_ASYMPTOTIC, LOG_NDTR_ASYMPTOTIC - 1.] {
            let below = log_ndtr(edge - 1e-9);
            let above = log_ndtr(edge + 1e-9);
            assert!(below < above);
            assert_abs_diff_eq!(below, above, epsilon = 1e-6);
        }
        let grid: Vec<f64> = (0..=3000)
            .map(|i| LOG_NDTR_ASYMPTOTIC - 2. + i as f64 * 1e-3)
            .map(log_ndtr)
            .collect();
        assert!(grid.windows(2).all(|w| w[0] < w[1]));

        let far = log_ndtr(-60.);
        assert!(far.is_finite());
        assert!(far < -1700.);
        assert!(log_ndtr(-60.) < log_ndtr(-59.));

        assert_eq!(log_ndtr(f64::INFINITY), 0.);
        assert_eq!(log_ndtr(f64::NEG_INFINITY), f64::NEG_INFINITY);
        assert!(log_ndtr(40.) <= 0.);
        assert_abs_diff_eq!(log_ndtr_sf(0.), 0.5f64.ln(), epsilon = 1e-14);
    }

    #[test]
    fn quantiles_interpolate() {
        let sorted = [1., 2., 3., 4., 5.];
        assert_eq!(quantile_sorted(&sorted, 0.5), 3.);
        assert_eq!(quantile_sorted(&sorted, 0.), 1.);
        assert_eq!(quantile_sorted(&sorted, 1.), 5.);
        assert_abs_diff_eq!(quantile_sorted(&sorted, 0.125), 1.5, epsilon = 1e-12);
        assert!(quantile_sorted(&[], 0.5).is_nan());
    }

    #[test]
    fn vector_kernels() {
        let x = [1., 2., 3., 4., 5.];
        let y = [5., 4., 3., 2., 1.];
        assert_eq!(vector_dot(&x, &y), 35.);

        let mut out = [0.; 5];
        axpy_out(&x, &y, 2., &mut out);
        assert_eq!(out, [7., 8., 9., 10., 11.]);

        let mut z = y;
        axpy(&x, &mut z, -1.);
        assert_eq!(z, [4., 2., 0., -2., -4.]);

        multiply(&x, &y, &mut out);
        assert_eq!(out, [5., 8., 9., 8., 5.]);

        let (a, b) = scalar_prods2(&x, &y, &x, &y);
        assert_eq!((a, b), (6. * 15., 6. * 15.));
        let (a, b) = scalar_prods3(&x, &y, &y, &x, &y);
        assert_eq!((a, b), (vector_dot(&x, &x), vector_dot(&x, &y)));
    }
}
