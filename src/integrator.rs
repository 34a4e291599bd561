use crate::mass_matrix::MassMatrix;
use crate::math::axpy;
use crate::potential::LogpFunc;

/// Total energy of a point in phase space.
#[inline]
pub fn hamiltonian(potential: f64, kinetic: f64) -> f64 {
    potential + kinetic
}

/// Zero the gradient buffer and evaluate the log density and its gradient.
pub(crate) fn reset_autodiff<F: LogpFunc>(
    logp: &mut F,
    theta: &[f64],
    theta_adj: &mut [f64],
) -> Result<f64, F::LogpError> {
    theta_adj.fill(0.);
    logp.logp(theta, theta_adj)
}

/// One leapfrog step of size `epsilon` for the momentum and position in place.
///
/// `theta_adj` holds the gradient of the log density at `theta` on return.
/// With `reuse_adj` the caller guarantees that it already holds the gradient
/// at the incoming `theta`, and the initial gradient evaluation is skipped.
///
/// Returns the potential energy (the negative log density) at the new position.
#[allow(clippy::too_many_arguments)]
pub fn leapfrog<F, M>(
    logp: &mut F,
    theta: &mut [f64],
    theta_adj: &mut [f64],
    r: &mut [f64],
    scratch: &mut [f64],
    mass_matrix: &M,
    epsilon: f64,
    reuse_adj: bool,
) -> Result<f64, F::LogpError>
where
    F: LogpFunc,
    M: MassMatrix,
{
    if !reuse_adj {
        reset_autodiff(logp, theta, theta_adj)?;
    }
    let half_step = epsilon / 2.;
    axpy(theta_adj, r, half_step);
    mass_matrix.dkinetic_dr(r, scratch);
    axpy(scratch, theta, epsilon);
    let new_potential = -reset_autodiff(logp, theta, theta_adj)?;
    axpy(theta_adj, r, half_step);
    Ok(new_potential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_matrix::UnitMassMatrix;
    use crate::potential::test_logps::{Bilinear, NormalLogp};
    use pretty_assertions::assert_eq;

    struct Fixture {
        theta: [f64; 3],
        theta_adj: [f64; 3],
        r: [f64; 3],
        scratch: [f64; 3],
    }

    impl Fixture {
        fn new() -> Self {
            // The gradient buffer starts with garbage so that we can see whether
            // it is recomputed.
            Fixture {
                theta: [1., 2., 3.],
                theta_adj: [1., 2., 3.],
                r: [-1., 0., 1.],
                scratch: [0.; 3],
            }
        }
    }

    #[test]
    fn leapfrog_no_reuse_adj() {
        let mut f = Fixture::new();
        let mass = UnitMassMatrix::new(3);
        let potential = leapfrog(
            &mut Bilinear,
            &mut f.theta,
            &mut f.theta_adj,
            &mut f.r,
            &mut f.scratch,
            &mass,
            2.,
            false,
        )
        .unwrap();
        assert_eq!(potential, -19.);
        assert_eq!(f.theta, [3., 4., 7.]);
        assert_eq!(f.theta_adj, [4., 3., 1.]);
        assert_eq!(f.r, [5., 4., 3.]);
    }

    #[test]
    fn leapfrog_reuse_adj() {
        let mut f = Fixture::new();
        let mass = UnitMassMatrix::new(3);
        let potential = leapfrog(
            &mut Bilinear,
            &mut f.theta,
            &mut f.theta_adj,
            &mut f.r,
            &mut f.scratch,
            &mass,
            2.,
            true,
        )
        .unwrap();
        assert_eq!(potential, -17.);
        assert_eq!(f.theta, [1., 6., 11.]);
        assert_eq!(f.theta_adj, [6., 1., 1.]);
        assert_eq!(f.r, [6., 3., 5.]);
    }

    #[test]
    fn energy_error_shrinks_quadratically() {
        let mass = UnitMassMatrix::new(3);
        let mut logp = NormalLogp { mu: vec![0.; 3] };
        let energy_error = |epsilon: f64, logp: &mut NormalLogp| {
            let mut theta = [1., 2., 3.];
            let mut theta_adj = [0.; 3];
            let mut r = [-1., 0., 1.];
            let mut scratch = [0.; 3];
            let start = hamiltonian(
                -reset_autodiff(logp, &theta, &mut theta_adj).unwrap(),
                mass.kinetic(&r),
            );
            let potential = leapfrog(
                logp,
                &mut theta,
                &mut theta_adj,
                &mut r,
                &mut scratch,
                &mass,
                epsilon,
                true,
            )
            .unwrap();
            (hamiltonian(potential, mass.kinetic(&r)) - start).abs()
        };
        let coarse = energy_error(0.1, &mut logp);
        let fine = energy_error(0.05, &mut logp);
        assert!(coarse > 0.);
        assert!(coarse < 0.1 * 0.1);
        assert!(fine < coarse / 3.);
    }
}
