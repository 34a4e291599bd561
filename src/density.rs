//! Log densities of the supported distributions.
//!
//! Every function returns `f64::NEG_INFINITY` outside of the support of the
//! distribution or for invalid distribution parameters instead of failing.
//! The `*_grad` variants return the partial derivatives of the log density
//! with respect to each argument, in argument order.

use faer::linalg::solvers::Solve;
use faer::{Mat, MatRef, Side};

use crate::math::{ln_multi_gamma, LOG_SQRT_TWO_PI};

pub fn normal_log_pdf(x: f64, mean: f64, sd: f64) -> f64 {
    if !(sd > 0.) {
        return f64::NEG_INFINITY;
    }
    let z = (x - mean) / sd;
    -0.5 * z * z - sd.ln() - LOG_SQRT_TWO_PI
}

pub(crate) fn normal_log_pdf_grad(x: f64, mean: f64, sd: f64) -> (f64, f64, f64) {
    if !(sd > 0.) {
        return (0., 0., 0.);
    }
    let z = (x - mean) / sd;
    let dx = -z / sd;
    (dx, -dx, (z * z - 1.) / sd)
}

pub fn uniform_log_pdf(x: f64, min: f64, max: f64) -> f64 {
    if min < x && x < max {
        -(max - min).ln()
    } else {
        f64::NEG_INFINITY
    }
}

pub(crate) fn uniform_log_pdf_grad(x: f64, min: f64, max: f64) -> (f64, f64, f64) {
    if min < x && x < max {
        let inv = 1. / (max - min);
        (0., inv, -inv)
    } else {
        (0., 0., 0.)
    }
}

pub fn cauchy_log_pdf(x: f64, loc: f64, scale: f64) -> f64 {
    if !(scale > 0.) {
        return f64::NEG_INFINITY;
    }
    let z = (x - loc) / scale;
    -std::f64::consts::PI.ln() - scale.ln() - z.mul_add(z, 1.).ln()
}

pub(crate) fn cauchy_log_pdf_grad(x: f64, loc: f64, scale: f64) -> (f64, f64, f64) {
    if !(scale > 0.) {
        return (0., 0., 0.);
    }
    let z = (x - loc) / scale;
    let denom = z.mul_add(z, 1.);
    let dx = -2. * z / (scale * denom);
    (dx, -dx, -1. / scale + 2. * z * z / (scale * denom))
}

/// Bernoulli log mass, with `p` clipped to `[0, 1]`.
pub fn bernoulli_log_pdf(x: f64, p: f64) -> f64 {
    if p <= 0. {
        return if x == 0. { 0. } else { f64::NEG_INFINITY };
    }
    if p >= 1. {
        return if x == 1. { 0. } else { f64::NEG_INFINITY };
    }
    if x == 1. {
        p.ln()
    } else if x == 0. {
        (-p).ln_1p()
    } else {
        f64::NEG_INFINITY
    }
}

/// Derivative of `bernoulli_log_pdf` with respect to `p`.
pub(crate) fn bernoulli_log_pdf_grad(x: f64, p: f64) -> f64 {
    if p <= 0. || p >= 1. {
        return 0.;
    }
    if x == 1. {
        1. / p
    } else if x == 0. {
        -1. / (1. - p)
    } else {
        0.
    }
}

/// Categorical log mass of the index `x` given unnormalized `weights`.
pub fn discrete_log_pdf(x: f64, weights: &[f64]) -> f64 {
    let Some(total) = weight_sum(weights) else {
        return f64::NEG_INFINITY;
    };
    if x.fract() != 0. || !(0. <= x && x < weights.len() as f64) {
        return f64::NEG_INFINITY;
    }
    (weights[x as usize] / total).ln()
}

/// Add the derivative of `discrete_log_pdf` with respect to the weights to `grad`.
pub(crate) fn discrete_log_pdf_grad(x: f64, weights: &[f64], grad: &mut [f64]) {
    if !discrete_log_pdf(x, weights).is_finite() {
        return;
    }
    let Some(total) = weight_sum(weights) else {
        return;
    };
    let i = x as usize;
    grad.iter_mut().for_each(|g| *g -= 1. / total);
    grad[i] += 1. / weights[i];
}

fn weight_sum(weights: &[f64]) -> Option<f64> {
    if !weights.iter().all(|w| w.is_finite() && *w >= 0.) {
        return None;
    }
    let total: f64 = weights.iter().sum();
    (total > 0.).then_some(total)
}

/// Wishart log density of the symmetric positive definite `x` given the
/// scale matrix `v` and `n` degrees of freedom.
///
/// If `grad` is given, the derivative with respect to `x`,
/// `((n - p - 1) / 2) x^-1 - v^-1 / 2`, is added to it.
pub fn wishart_log_pdf(x: MatRef<'_, f64>, v: MatRef<'_, f64>, n: f64) -> f64 {
    wishart_log_pdf_impl(x, v, n, None)
}

pub(crate) fn wishart_log_pdf_grad(
    x: MatRef<'_, f64>,
    v: MatRef<'_, f64>,
    n: f64,
    grad: &mut Mat<f64>,
) -> f64 {
    wishart_log_pdf_impl(x, v, n, Some(grad))
}

fn wishart_log_pdf_impl(
    x: MatRef<'_, f64>,
    v: MatRef<'_, f64>,
    n: f64,
    grad: Option<&mut Mat<f64>>,
) -> f64 {
    let p = x.nrows();
    if x.ncols() != p || v.nrows() != p || v.ncols() != p {
        return f64::NEG_INFINITY;
    }
    let p_f = p as f64;
    if !(n > p_f - 1.) {
        return f64::NEG_INFINITY;
    }
    let Ok(x_chol) = x.llt(Side::Lower) else {
        return f64::NEG_INFINITY;
    };
    let Ok(v_chol) = v.llt(Side::Lower) else {
        return f64::NEG_INFINITY;
    };

    let log_det = |l: MatRef<'_, f64>| (0..p).map(|i| l[(i, i)].ln()).sum::<f64>() * 2.;
    let log_det_x = log_det(x_chol.L());
    let log_det_v = log_det(v_chol.L());

    let identity = Mat::<f64>::identity(p, p);
    let v_inv = v_chol.solve(identity.as_ref());
    let trace = (0..p)
        .flat_map(|i| (0..p).map(move |j| (i, j)))
        .map(|(i, j)| v_inv[(i, j)] * x[(j, i)])
        .sum::<f64>();

    if let Some(grad) = grad {
        let x_inv = x_chol.solve(identity.as_ref());
        let weight = 0.5 * (n - p_f - 1.);
        for j in 0..p {
            for i in 0..p {
                grad[(i, j)] += weight * x_inv[(i, j)] - 0.5 * v_inv[(i, j)];
            }
        }
    }

    0.5 * (n - p_f - 1.) * log_det_x
        - 0.5 * trace
        - 0.5 * n * p_f * 2f64.ln()
        - 0.5 * n * log_det_v
        - ln_multi_gamma(p, 0.5 * n)
}
