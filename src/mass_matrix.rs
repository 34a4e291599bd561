use itertools::izip;
use rand_distr::StandardNormal;

use crate::math::{multiply, vector_dot};

/// The mass matrix `M` of the kinetic energy `0.5 rᵀ M⁻¹ r`.
pub trait MassMatrix {
    /// Draw a momentum `r ~ N(0, M)`.
    fn sample<R: rand::Rng + ?Sized>(&self, r: &mut [f64], rng: &mut R);

    fn kinetic(&self, r: &[f64]) -> f64;

    /// Gradient of the kinetic energy with respect to the momentum, `M⁻¹ r`.
    fn dkinetic_dr(&self, r: &[f64], out: &mut [f64]);

    fn dim(&self) -> usize;
}

/// Identity mass matrix.
#[derive(Debug, Clone)]
pub struct UnitMassMatrix {
    dim: usize,
}

impl UnitMassMatrix {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl MassMatrix for UnitMassMatrix {
    fn sample<R: rand::Rng + ?Sized>(&self, r: &mut [f64], rng: &mut R) {
        r.iter_mut().for_each(|r| *r = rng.sample(StandardNormal));
    }

    fn kinetic(&self, r: &[f64]) -> f64 {
        0.5 * vector_dot(r, r)
    }

    fn dkinetic_dr(&self, r: &[f64], out: &mut [f64]) {
        out.copy_from_slice(r);
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

/// Diagonal mass matrix, stored through its inverse `M⁻¹`, the per-coordinate
/// variance estimate of the posterior.
#[derive(Debug, Clone)]
pub struct DiagMassMatrix {
    m_inverse: Box<[f64]>,
    inv_stds: Box<[f64]>,
}

impl DiagMassMatrix {
    pub fn new(dim: usize) -> Self {
        Self {
            m_inverse: vec![1f64; dim].into(),
            inv_stds: vec![1f64; dim].into(),
        }
    }

    pub fn m_inverse(&self) -> &[f64] {
        &self.m_inverse
    }

    /// Replace `M⁻¹` with a new variance estimate.
    pub(crate) fn update_diag(&mut self, new_variance: impl Iterator<Item = f64>) {
        izip!(self.m_inverse.iter_mut(), self.inv_stds.iter_mut(), new_variance).for_each(
            |(var, inv_std, x)| {
                debug_assert!(x.is_finite() && x > 0., "Illegal value on mass matrix: {}", x);
                *var = x;
                *inv_std = (1. / x).sqrt();
            },
        );
    }
}

impl MassMatrix for DiagMassMatrix {
    fn sample<R: rand::Rng + ?Sized>(&self, r: &mut [f64], rng: &mut R) {
        r.iter_mut()
            .zip(self.inv_stds.iter())
            .for_each(|(r, &s)| {
                let norm: f64 = rng.sample(StandardNormal);
                *r = s * norm;
            });
    }

    fn kinetic(&self, r: &[f64]) -> f64 {
        izip!(r, self.m_inverse.iter())
            .map(|(r, m)| r * m * r)
            .sum::<f64>()
            * 0.5
    }

    fn dkinetic_dr(&self, r: &[f64], out: &mut [f64]) {
        multiply(&self.m_inverse, r, out);
    }

    fn dim(&self) -> usize {
        self.m_inverse.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;

    #[test]
    fn unit_kinetic() {
        let mass = UnitMassMatrix::new(3);
        let r = [1., -2., 2.];
        assert_eq!(mass.kinetic(&r), 4.5);
        let mut out = [0.; 3];
        mass.dkinetic_dr(&r, &mut out);
        assert_eq!(out, r);
    }

    #[test]
    fn diag_starts_as_unit() {
        let unit = UnitMassMatrix::new(4);
        let diag = DiagMassMatrix::new(4);
        let mut r_unit = [0.; 4];
        let mut r_diag = [0.; 4];
        unit.sample(&mut r_unit, &mut rand_chacha::ChaCha8Rng::seed_from_u64(3));
        diag.sample(&mut r_diag, &mut rand_chacha::ChaCha8Rng::seed_from_u64(3));
        assert_eq!(r_unit, r_diag);
        assert_eq!(unit.kinetic(&r_unit), diag.kinetic(&r_diag));
    }

    #[test]
    fn diag_kinetic() {
        let mut mass = DiagMassMatrix::new(2);
        mass.update_diag([4., 0.25].into_iter());
        let r = [1., 2.];
        assert_abs_diff_eq!(mass.kinetic(&r), 0.5 * (4. + 1.), epsilon = 1e-15);
        let mut out = [0.; 2];
        mass.dkinetic_dr(&r, &mut out);
        assert_eq!(out, [4., 0.5]);
    }

    #[test]
    fn diag_sample_scale() {
        let mut mass = DiagMassMatrix::new(1);
        // M = 1 / 0.01, so r has standard deviation 10
        mass.update_diag([0.01].into_iter());
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
        let n = 20_000;
        let mut r = [0.];
        let sum_sq: f64 = (0..n)
            .map(|_| {
                mass.sample(&mut r, &mut rng);
                r[0] * r[0]
            })
            .sum();
        let var = sum_sq / n as f64;
        assert!((var - 100.).abs() < 5., "variance was {}", var);
    }
}
