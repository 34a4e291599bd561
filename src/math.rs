use itertools::izip;
use multiversion::multiversion;
use statrs::function::gamma::ln_gamma;

pub(crate) const LOG_SQRT_TWO_PI: f64 = 0.918_938_533_204_672_8;

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

#[inline]
pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0. {
        1. / (1. + (-x).exp())
    } else {
        let e = x.exp();
        e / (1. + e)
    }
}

#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(x, y)| x * y).sum()
}

/// `y += a * x`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn axpy(x: &[f64], y: &mut [f64], a: f64) {
    assert!(x.len() == y.len());
    izip!(x, y).for_each(|(x, y)| {
        *y = a.mul_add(*x, *y);
    });
}

/// Element-wise `out = x * y`
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn multiply(x: &[f64], y: &[f64], out: &mut [f64]) {
    assert!(x.len() == y.len());
    assert!(out.len() == x.len());
    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = x * y;
    });
}

/// `(a + b) . x`, the dot product of a joined momentum path with `x`.
pub(crate) fn sum_dot(a: &[f64], b: &[f64], x: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    assert!(a.len() == x.len());
    izip!(a, b, x).map(|(a, b, x)| (a + b) * x).sum()
}

/// Logarithm of the multivariate gamma function of dimension `p`.
pub(crate) fn ln_multi_gamma(p: usize, x: f64) -> f64 {
    let p_f = p as f64;
    let base = 0.25 * p_f * (p_f - 1.) * std::f64::consts::PI.ln();
    (0..p).fold(base, |acc, j| acc + ln_gamma(x - 0.5 * j as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

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
        fn check_sigmoid(x in -30f64..30f64) {
            let s = sigmoid(x);
            prop_assert!(s > 0. && s < 1.);
            prop_assert!((s + sigmoid(-x) - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn check_neginf() {
        assert_eq!(logaddexp(f64::NEG_INFINITY, 2.), 2.);
        assert_eq!(logaddexp(2., f64::NEG_INFINITY), 2.);
    }

    #[test]
    fn check_kernels() {
        let x = [1., 2., 3.];
        let mut y = [1., 1., 1.];
        axpy(&x, &mut y, 2.);
        assert_eq!(y, [3., 5., 7.]);

        let mut out = [0.; 3];
        multiply(&x, &y, &mut out);
        assert_eq!(out, [3., 10., 21.]);

        assert_eq!(vector_dot(&x, &y), 34.);
        assert_eq!(sum_dot(&x, &y, &[1., 0., -1.]), -6.);
    }

    #[test]
    fn check_ln_multi_gamma() {
        // Gamma_1(x) == Gamma(x)
        assert_abs_diff_eq!(ln_multi_gamma(1, 3.5), ln_gamma(3.5), epsilon = 1e-12);
        assert_abs_diff_eq!(ln_multi_gamma(1, 5.), 24f64.ln(), epsilon = 1e-10);
        // Gamma_2(x) = sqrt(pi) Gamma(x) Gamma(x - 1/2)
        let expected = 0.5 * std::f64::consts::PI.ln() + ln_gamma(3.) + ln_gamma(2.5);
        assert_abs_diff_eq!(ln_multi_gamma(2, 3.), expected, epsilon = 1e-10);
    }
}
