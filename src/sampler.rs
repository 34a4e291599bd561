use std::time::{Duration, Instant};

use faer::Mat;
use log::info;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::chain::{Chain, NutsChain, SampleStats};
use crate::mass_matrix::{DiagMassMatrix, UnitMassMatrix};
use crate::mass_matrix_adapt::{NoVarAdapt, VarAdapter, VarConfig};
use crate::nuts::{NutsError, Result};
use crate::potential::LogpFunc;
use crate::program::{ModelError, Program};
use crate::stepsize::{RunningMean, StepConfig};

/// Which mass matrix to use and adapt during warmup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VarPolicy {
    /// Identity mass matrix, never adapted.
    Unit,
    /// Diagonal mass matrix from windowed variance estimates.
    #[default]
    Diag,
    /// Dense mass matrix. Not supported.
    Dense,
}

/// Settings for the NUTS sampler
#[derive(Debug, Clone, Copy)]
pub struct NutsConfig {
    /// The number of warmup iterations, where we fit the step size and mass matrix.
    pub warmup: usize,
    /// The number of draws after warmup
    pub samples: usize,
    /// Seed of the random number generator. A random seed is used if this is `None`.
    pub seed: Option<u64>,
    /// Redraw initial values outside of the support of their prior.
    pub prune: bool,
    /// The maximum tree depth. The number of leapfrog steps is at most
    /// `2 ^ max_depth - 1`.
    pub max_depth: usize,
    pub step_config: StepConfig,
    pub var_config: VarConfig,
    pub var_policy: VarPolicy,
}

impl Default for NutsConfig {
    fn default() -> Self {
        Self {
            warmup: 1000,
            samples: 1000,
            seed: None,
            prune: true,
            max_depth: 10,
            step_config: StepConfig::default(),
            var_config: VarConfig::default(),
            var_policy: VarPolicy::Diag,
        }
    }
}

/// The draws of a sampler run.
#[derive(Debug, Clone)]
pub struct McmcResult {
    pub name: &'static str,
    /// One row per draw. The last column holds the log density of the draw.
    pub cont_samples: Mat<f64>,
    /// One row per draw of the discrete parameters.
    pub disc_samples: Mat<f64>,
    /// Names of the columns of `cont_samples`.
    pub columns: Vec<String>,
    pub warmup_time: Duration,
    pub sampling_time: Duration,
    /// Statistics of all warmup and sampling iterations.
    pub stats: Vec<SampleStats>,
}

impl McmcResult {
    /// Mean acceptance probability over the sampling iterations.
    pub fn mean_accept_prob(&self) -> f64 {
        let mut mean = RunningMean::default();
        self.stats
            .iter()
            .filter(|stats| !stats.tuning)
            .for_each(|stats| mean.add(stats.mean_accept_prob));
        mean.current()
    }

    /// Number of divergent sampling iterations.
    pub fn num_divergences(&self) -> usize {
        self.stats
            .iter()
            .filter(|stats| !stats.tuning && stats.diverging)
            .count()
    }

    /// Values of the column `name` for all draws.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let j = self.columns.iter().position(|column| column == name)?;
        Some(
            (0..self.cont_samples.nrows())
                .map(|i| self.cont_samples[(i, j)])
                .collect(),
        )
    }
}

struct Run {
    draws: Vec<Box<[f64]>>,
    stats: Vec<SampleStats>,
    warmup_time: Duration,
    sampling_time: Duration,
}

fn new_rng(seed: Option<u64>) -> ChaCha8Rng {
    let seed = seed.unwrap_or_else(|| rand::rng().random());
    ChaCha8Rng::seed_from_u64(seed)
}

fn run_chain<C: Chain>(mut chain: C, init: &[f64], config: &NutsConfig) -> Result<Run> {
    chain.set_position(init)?;

    let total = config.warmup + config.samples;
    let report_every = (total / 10).max(1);
    let mut draws = Vec::with_capacity(config.samples);
    let mut stats = Vec::with_capacity(total);

    let start = Instant::now();
    let mut sampling_start = start;
    let mut warmup_time = Duration::ZERO;
    for i in 0..total {
        if i == config.warmup {
            warmup_time = start.elapsed();
            sampling_start = Instant::now();
        }
        let (position, info) = chain.draw()?;
        if !info.tuning {
            draws.push(position);
        }
        stats.push(info);
        if (i + 1) % report_every == 0 {
            info!(
                "Iteration {}/{} [{}]",
                i + 1,
                total,
                if i < config.warmup { "warmup" } else { "sampling" }
            );
        }
    }
    if config.samples == 0 {
        warmup_time = start.elapsed();
        sampling_start = Instant::now();
    }
    let sampling_time = sampling_start.elapsed();
    info!(
        "Finished {} warmup iterations in {:.3}s and {} draws in {:.3}s",
        config.warmup,
        warmup_time.as_secs_f64(),
        config.samples,
        sampling_time.as_secs_f64()
    );

    Ok(Run {
        draws,
        stats,
        warmup_time,
        sampling_time,
    })
}

fn run<F: LogpFunc>(
    logp: F,
    init: &[f64],
    config: &NutsConfig,
    rng: ChaCha8Rng,
) -> Result<Run> {
    let dim = logp.dim();
    info!(
        "Sampling {} parameters with {:?} mass matrix",
        dim, config.var_policy
    );
    match config.var_policy {
        VarPolicy::Unit => {
            let chain = NutsChain::new(
                logp,
                UnitMassMatrix::new(dim),
                NoVarAdapt,
                config.step_config,
                config.warmup as u64,
                config.max_depth,
                rng,
            );
            run_chain(chain, init, config)
        }
        VarPolicy::Diag => {
            let chain = NutsChain::new(
                logp,
                DiagMassMatrix::new(dim),
                VarAdapter::new(dim, config.warmup, config.var_config),
                config.step_config,
                config.warmup as u64,
                config.max_depth,
                rng,
            );
            run_chain(chain, init, config)
        }
        VarPolicy::Dense => Err(NutsError::UnsupportedVarPolicy(VarPolicy::Dense)),
    }
}

fn check_config(config: &NutsConfig) -> Result<()> {
    if config.var_policy == VarPolicy::Dense {
        return Err(NutsError::UnsupportedVarPolicy(config.var_policy));
    }
    if config.max_depth == 0 {
        return Err(NutsError::ZeroMaxDepth);
    }
    Ok(())
}

fn to_matrix(rows: &[Vec<f64>], ncols: usize) -> Mat<f64> {
    Mat::from_fn(rows.len(), ncols, |i, j| rows[i][j])
}

/// Sample the continuous parameters of `program` with NUTS.
///
/// The program is activated, bound to new buffers and initialized with
/// `Program::init_params`. Programs with discrete parameters are rejected.
pub fn nuts(program: &mut Program, config: NutsConfig) -> Result<McmcResult> {
    check_config(&config)?;
    let (_, disc) = program.activate_and_bind()?;
    if disc.uc_offset > 0 {
        return Err(NutsError::DiscreteParameters {
            count: disc.uc_offset,
        });
    }

    let mut rng = new_rng(config.seed);
    program.init_params(&mut rng, config.prune)?;
    let init = program.cont_pack().ok_or(ModelError::NotBound)?.uc.clone();

    let output = run(program.ad_log_pdf()?, &init, &config, rng)?;

    let ncols = program.constrained_size() + 1;
    let mut rows = Vec::with_capacity(output.draws.len());
    for draw in output.draws.iter() {
        program.set_unconstrained(draw)?;
        let mut row = vec![0f64; ncols];
        let logp = program.write_constrained(&mut row[..ncols - 1])?;
        row[ncols - 1] = logp;
        rows.push(row);
    }

    let mut columns = program.param_names();
    columns.push("log_pdf".to_string());

    Ok(McmcResult {
        name: "nuts",
        cont_samples: to_matrix(&rows, ncols),
        disc_samples: Mat::from_fn(rows.len(), 0, |_, _| 0.),
        columns,
        warmup_time: output.warmup_time,
        sampling_time: output.sampling_time,
        stats: output.stats,
    })
}

/// Sample a log density over an unconstrained space, starting at `init`.
///
/// The columns of the result are the coordinates `x[i]` and the log density
/// of the draw.
pub fn nuts_log_density<F: LogpFunc>(
    func: &mut F,
    init: &[f64],
    config: NutsConfig,
) -> Result<McmcResult> {
    check_config(&config)?;
    let dim = func.dim();
    if init.len() != dim {
        return Err(NutsError::DimensionMismatch {
            expected: dim,
            found: init.len(),
        });
    }
    let output = run(&mut *func, init, &config, new_rng(config.seed))?;

    let mut rows = Vec::with_capacity(output.draws.len());
    for draw in output.draws.iter() {
        let logp = func
            .logp_value(draw)
            .map_err(|err| NutsError::LogpFailure(Box::new(err)))?;
        let mut row = draw.to_vec();
        row.push(logp);
        rows.push(row);
    }

    let mut columns: Vec<String> = (0..dim).map(|i| format!("x[{}]", i)).collect();
    columns.push("log_density".to_string());

    Ok(McmcResult {
        name: "nuts",
        cont_samples: to_matrix(&rows, dim + 1),
        disc_samples: Mat::from_fn(rows.len(), 0, |_, _| 0.),
        columns,
        warmup_time: output.warmup_time,
        sampling_time: output.sampling_time,
        stats: output.stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::potential::test_logps::NormalLogp;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config() {
        let config = NutsConfig::default();
        assert_eq!(config.warmup, 1000);
        assert_eq!(config.samples, 1000);
        assert_eq!(config.seed, None);
        assert!(config.prune);
        assert_eq!(config.max_depth, 10);
        assert_eq!(config.var_policy, VarPolicy::Diag);
    }

    #[test]
    fn dense_is_unsupported() {
        let mut logp = NormalLogp { mu: vec![0.; 2] };
        let config = NutsConfig {
            var_policy: VarPolicy::Dense,
            seed: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            nuts_log_density(&mut logp, &[0., 0.], config),
            Err(NutsError::UnsupportedVarPolicy(VarPolicy::Dense))
        ));
        assert!(matches!(
            nuts(&mut Program::new(), config),
            Err(NutsError::UnsupportedVarPolicy(VarPolicy::Dense))
        ));
    }

    #[test]
    fn zero_max_depth_is_rejected() {
        let mut logp = NormalLogp { mu: vec![0.; 2] };
        let config = NutsConfig {
            max_depth: 0,
            seed: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            nuts_log_density(&mut logp, &[0., 0.], config),
            Err(NutsError::ZeroMaxDepth)
        ));
        assert!(matches!(
            nuts(&mut Program::new(), config),
            Err(NutsError::ZeroMaxDepth)
        ));
    }

    #[test]
    fn log_density_draws() {
        let mut logp = NormalLogp { mu: vec![1., -1.] };
        let config = NutsConfig {
            warmup: 200,
            samples: 300,
            seed: Some(7),
            ..Default::default()
        };
        let result = nuts_log_density(&mut logp, &[0., 0.], config).unwrap();
        assert_eq!(result.name, "nuts");
        assert_eq!(result.cont_samples.nrows(), 300);
        assert_eq!(result.cont_samples.ncols(), 3);
        assert_eq!(result.disc_samples.nrows(), 300);
        assert_eq!(result.disc_samples.ncols(), 0);
        assert_eq!(result.stats.len(), 500);
        assert_eq!(result.columns, vec!["x[0]", "x[1]", "log_density"]);

        let x = result.column("x[0]").unwrap();
        let logp_column = result.column("log_density").unwrap();
        let y = result.column("x[1]").unwrap();
        for i in 0..300 {
            let expected = -((x[i] - 1.).powi(2) + (y[i] + 1.).powi(2)) / 2.;
            assert!((logp_column[i] - expected).abs() < 1e-12);
        }
        assert!(result.mean_accept_prob() > 0.5);
    }

    #[test]
    fn log_density_checks_init() {
        let mut logp = NormalLogp { mu: vec![0.; 2] };
        assert!(matches!(
            nuts_log_density(&mut logp, &[0.], NutsConfig::default()),
            Err(NutsError::DimensionMismatch {
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn seeds_are_reproducible() {
        let config = NutsConfig {
            warmup: 50,
            samples: 20,
            seed: Some(3),
            ..Default::default()
        };
        let mut logp = NormalLogp { mu: vec![0.; 3] };
        let first = nuts_log_density(&mut logp, &[0.1, 0.2, 0.3], config).unwrap();
        let second = nuts_log_density(&mut logp, &[0.1, 0.2, 0.3], config).unwrap();
        assert_eq!(first.column("x[2]"), second.column("x[2]"));
        assert_eq!(first.stats, second.stats);
    }
}
