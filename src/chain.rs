use log::{debug, warn};
use rand::Rng;

use crate::integrator::reset_autodiff;
use crate::mass_matrix::MassMatrix;
use crate::mass_matrix_adapt::VarianceAdapt;
use crate::nuts::{draw, find_reasonable_epsilon, NutsError, NutsWorkspace, Result};
use crate::potential::LogpFunc;
use crate::stepsize::{StepAdapter, StepConfig};

/// Diagnostic information about one iteration of a chain.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct SampleStats {
    pub draw: u64,
    pub tuning: bool,
    /// Step size used for the trajectory of this draw.
    pub step_size: f64,
    pub depth: u64,
    pub num_steps: u64,
    pub mean_accept_prob: f64,
    pub diverging: bool,
}

/// Draw samples from the posterior distribution using Hamiltonian MCMC.
pub trait Chain {
    /// Initialize the sampler to a position and find an initial step size.
    /// This should be called before calling draw.
    ///
    /// This fails if the logp function returns an error.
    fn set_position(&mut self, position: &[f64]) -> Result<()>;

    /// Draw a new sample and return the position and some diagnostic information.
    fn draw(&mut self) -> Result<(Box<[f64]>, SampleStats)>;

    /// The dimensionality of the posterior.
    fn dim(&self) -> usize;
}

/// A single NUTS chain with dual averaging of the step size and adaptation of
/// the mass matrix during the first `warmup` draws.
pub struct NutsChain<F, M, V, R>
where
    F: LogpFunc,
    M: MassMatrix,
    V: VarianceAdapt<M>,
    R: Rng,
{
    logp: F,
    mass_matrix: M,
    var_adapter: V,
    step_adapter: StepAdapter,
    step_config: StepConfig,
    workspace: NutsWorkspace,
    theta: Box<[f64]>,
    theta_adj: Box<[f64]>,
    potential: f64,
    warmup: u64,
    max_depth: usize,
    draw_count: u64,
    rng: R,
}

impl<F, M, V, R> NutsChain<F, M, V, R>
where
    F: LogpFunc,
    M: MassMatrix,
    V: VarianceAdapt<M>,
    R: Rng,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logp: F,
        mass_matrix: M,
        var_adapter: V,
        step_config: StepConfig,
        warmup: u64,
        max_depth: usize,
        rng: R,
    ) -> Self {
        let dim = logp.dim();
        NutsChain {
            logp,
            mass_matrix,
            var_adapter,
            step_adapter: StepAdapter::new(step_config, 0.),
            step_config,
            workspace: NutsWorkspace::new(dim, max_depth),
            theta: vec![0f64; dim].into(),
            theta_adj: vec![0f64; dim].into(),
            potential: f64::INFINITY,
            warmup,
            max_depth,
            draw_count: 0,
            rng,
        }
    }

    pub fn is_tuning(&self) -> bool {
        self.draw_count < self.warmup
    }

    pub fn step_size(&self) -> f64 {
        self.step_adapter.step_size()
    }

    pub fn mass_matrix(&self) -> &M {
        &self.mass_matrix
    }

    /// Give the log density back, ending the chain.
    pub fn into_logp(self) -> F {
        self.logp
    }

    fn reasonable_log_step_size(&mut self, epsilon: f64) -> Result<f64> {
        let epsilon = find_reasonable_epsilon(
            epsilon,
            &mut self.logp,
            &mut self.theta,
            &mut self.theta_adj,
            &self.mass_matrix,
            &mut self.rng,
        )?;
        Ok(epsilon.ln())
    }

    fn adapt(&mut self, mean_accept_prob: f64) -> Result<()> {
        self.step_adapter.adapt(mean_accept_prob);
        if self.var_adapter.adapt(&self.theta, &mut self.mass_matrix) {
            let log_eps = self.reasonable_log_step_size(self.step_adapter.step_size())?;
            debug!(
                "Mass matrix changed at draw {}, restarting step size adaptation at {}",
                self.draw_count,
                log_eps.exp()
            );
            self.step_adapter.reset();
            self.step_adapter.init(log_eps);
        }
        if self.draw_count + 1 == self.warmup {
            self.step_adapter.finalize();
            debug!(
                "Final step size after {} warmup draws: {}",
                self.warmup,
                self.step_adapter.step_size()
            );
        }
        Ok(())
    }
}

impl<F, M, V, R> Chain for NutsChain<F, M, V, R>
where
    F: LogpFunc,
    M: MassMatrix,
    V: VarianceAdapt<M>,
    R: Rng,
{
    fn set_position(&mut self, position: &[f64]) -> Result<()> {
        if position.len() != self.dim() {
            return Err(NutsError::DimensionMismatch {
                expected: self.dim(),
                found: position.len(),
            });
        }
        self.theta.copy_from_slice(position);
        let logp = reset_autodiff(&mut self.logp, &self.theta, &mut self.theta_adj)
            .map_err(|err| NutsError::LogpFailure(Box::new(err)))?;
        if !logp.is_finite() || !self.theta_adj.iter().all(|g| g.is_finite()) {
            return Err(NutsError::BadInitGrad);
        }
        self.potential = -logp;

        let log_eps = self.reasonable_log_step_size(1.)?;
        debug!("Initial step size {}", log_eps.exp());
        self.step_adapter = StepAdapter::new(self.step_config, log_eps);
        self.draw_count = 0;
        Ok(())
    }

    fn draw(&mut self) -> Result<(Box<[f64]>, SampleStats)> {
        let step_size = self.step_adapter.step_size();
        let info = draw(
            &mut self.logp,
            &self.mass_matrix,
            &mut self.workspace,
            &mut self.theta,
            &mut self.potential,
            step_size,
            self.max_depth,
            &mut self.rng,
        )?;
        let tuning = self.is_tuning();
        if info.diverging && !tuning {
            warn!("Divergence in draw {}", self.draw_count - self.warmup);
        }

        if tuning {
            self.adapt(info.mean_accept_prob)?;
        }

        let stats = SampleStats {
            draw: self.draw_count,
            tuning,
            step_size,
            depth: info.depth,
            num_steps: info.n_leapfrog,
            mean_accept_prob: info.mean_accept_prob,
            diverging: info.diverging,
        };
        self.draw_count += 1;
        Ok((self.theta.clone(), stats))
    }

    fn dim(&self) -> usize {
        self.theta.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_matrix::{DiagMassMatrix, UnitMassMatrix};
    use crate::mass_matrix_adapt::{NoVarAdapt, VarAdapter, VarConfig};
    use crate::potential::test_logps::NormalLogp;
    use crate::potential::LogpError;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use thiserror::Error;

    #[test]
    fn rejects_wrong_dimension() {
        let logp = NormalLogp { mu: vec![0.; 3] };
        let mut chain = NutsChain::new(
            logp,
            UnitMassMatrix::new(3),
            NoVarAdapt,
            StepConfig::default(),
            10,
            10,
            ChaCha8Rng::seed_from_u64(0),
        );
        assert!(matches!(
            chain.set_position(&[0.; 2]),
            Err(NutsError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
    }

    #[derive(Debug, Error)]
    #[error("log density failed")]
    struct Failure {
        recoverable: bool,
    }

    impl LogpError for Failure {
        fn is_recoverable(&self) -> bool {
            self.recoverable
        }
    }

    /// A standard normal in one dimension that fails for `x > bound`.
    struct Walled {
        bound: f64,
        recoverable: bool,
    }

    impl LogpFunc for Walled {
        type LogpError = Failure;

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> std::result::Result<f64, Failure> {
            if position[0] > self.bound {
                return Err(Failure {
                    recoverable: self.recoverable,
                });
            }
            grad[0] -= position[0];
            Ok(-position[0] * position[0] / 2.)
        }

        fn dim(&self) -> usize {
            1
        }
    }

    fn walled_chain(recoverable: bool) -> NutsChain<Walled, UnitMassMatrix, NoVarAdapt, ChaCha8Rng> {
        let logp = Walled {
            bound: 0.5,
            recoverable,
        };
        NutsChain::new(
            logp,
            UnitMassMatrix::new(1),
            NoVarAdapt,
            StepConfig::default(),
            0,
            10,
            ChaCha8Rng::seed_from_u64(5),
        )
    }

    #[test]
    fn recoverable_errors_are_divergences() {
        let mut chain = walled_chain(true);
        chain.set_position(&[0.]).unwrap();
        let mut diverging = 0;
        for _ in 0..200 {
            let (position, stats) = chain.draw().unwrap();
            assert!(position[0] <= 0.5);
            diverging += stats.diverging as usize;
        }
        assert!(diverging > 0);
    }

    #[test]
    fn unrecoverable_errors_stop_sampling() {
        let mut chain = walled_chain(false);
        // The step size search may already step over the wall.
        let result = chain
            .set_position(&[0.])
            .and_then(|()| (0..200).try_for_each(|_| chain.draw().map(|_| ())));
        assert!(matches!(result, Err(NutsError::LogpFailure(_))));
    }

    #[test]
    fn bad_initial_point() {
        let mut chain = walled_chain(true);
        assert!(matches!(
            chain.set_position(&[1.]),
            Err(NutsError::LogpFailure(_))
        ));
    }

    #[test]
    fn warmup_adapts_variance() {
        let mu = vec![0.; 2];
        let logp = ScaledNormal {
            mu,
            sd: vec![0.1, 10.],
        };
        let warmup = 1000;
        let mut chain = NutsChain::new(
            logp,
            DiagMassMatrix::new(2),
            VarAdapter::new(2, warmup as usize, VarConfig::default()),
            StepConfig::default(),
            warmup,
            10,
            ChaCha8Rng::seed_from_u64(1),
        );
        chain.set_position(&[0.5, 0.5]).unwrap();
        let mut accept = 0.;
        for i in 0..2000 {
            let (_, stats) = chain.draw().unwrap();
            assert_eq!(stats.tuning, i < warmup);
            assert_eq!(stats.draw, i);
            if !stats.tuning {
                accept += stats.mean_accept_prob;
            }
        }
        let m_inv = chain.mass_matrix().m_inverse();
        assert!(m_inv[0] < 0.05, "variance estimate {}", m_inv[0]);
        assert!(m_inv[1] > 20., "variance estimate {}", m_inv[1]);
        let accept = accept / 1000.;
        assert!(accept > 0.6 && accept < 1., "mean acceptance {}", accept);
    }

    /// Independent normals with standard deviations `sd`.
    struct ScaledNormal {
        mu: Vec<f64>,
        sd: Vec<f64>,
    }

    impl LogpFunc for ScaledNormal {
        type LogpError = std::convert::Infallible;

        fn logp(
            &mut self,
            position: &[f64],
            grad: &mut [f64],
        ) -> std::result::Result<f64, Self::LogpError> {
            let mut logp = 0.;
            for i in 0..position.len() {
                let z = (position[i] - self.mu[i]) / self.sd[i];
                logp -= z * z / 2.;
                grad[i] -= z / self.sd[i];
            }
            Ok(logp)
        }

        fn dim(&self) -> usize {
            self.mu.len()
        }
    }
}
