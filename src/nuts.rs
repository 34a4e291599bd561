use log::trace;
use rand::distr::{Distribution, StandardUniform};
use rand::Rng;
use thiserror::Error;

use crate::integrator::{hamiltonian, leapfrog, reset_autodiff};
use crate::mass_matrix::MassMatrix;
use crate::math::{logaddexp, sum_dot, vector_dot};
use crate::potential::{LogpError, LogpFunc};
use crate::program::ModelError;
use crate::sampler::VarPolicy;

/// Energy errors above this are divergences.
const DELTA_MAX: f64 = 1000.;

#[derive(Error, Debug)]
pub enum NutsError {
    #[error("NUTS can not sample discrete parameters, found {count} discrete values")]
    DiscreteParameters { count: usize },
    #[error("Mass matrix policy {0:?} is not supported")]
    UnsupportedVarPolicy(VarPolicy),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("Logp function returned unrecoverable error")]
    LogpFailure(Box<dyn std::error::Error + Send + Sync>),
    #[error("Log density or gradient is not finite at the initial point")]
    BadInitGrad,
    #[error("Initial point has dimension {found}, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("The maximum tree depth must be at least 1")]
    ZeroMaxDepth,
}

pub type Result<T> = std::result::Result<T, NutsError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    /// The sign of the time direction.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Forward => 1.,
            Direction::Backward => -1.,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Map recoverable logp errors to `None`.
fn recover<T, E: LogpError>(result: std::result::Result<T, E>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_recoverable() => Ok(None),
        Err(err) => Err(NutsError::LogpFailure(Box::new(err))),
    }
}

#[inline]
fn accept<R: Rng + ?Sized>(prob: f64, rng: &mut R) -> bool {
    rng.random::<f64>() <= prob
}

/// Generalized no-U-turn criterion: the trajectory with integrated momentum
/// `rho` still expands at both ends.
pub fn check_entropy(rho: &[f64], p_begin_scaled: &[f64], p_end_scaled: &[f64]) -> bool {
    vector_dot(rho, p_begin_scaled) > 0. && vector_dot(rho, p_end_scaled) > 0.
}

/// Result of building one subtree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TreeOutput {
    /// False if the subtree diverged or made a U-turn.
    pub(crate) valid: bool,
    /// Potential energy at the proposal of the subtree.
    pub(crate) potential: f64,
}

/// Buffers a subtree is built into. Begin and end are meant in the direction
/// of integration.
pub(crate) struct TreeInput<'a> {
    pub(crate) theta: &'a mut [f64],
    pub(crate) theta_adj: &'a mut [f64],
    /// Receives the proposal of the subtree.
    pub(crate) theta_prime: &'a mut [f64],
    /// Momentum at the outermost point, advanced by every leapfrog step.
    pub(crate) p_most: &'a mut [f64],
    pub(crate) p_beg: &'a mut [f64],
    /// `None` if the caller tracks the end momentum in `p_most`.
    pub(crate) p_end: Option<&'a mut [f64]>,
    pub(crate) p_beg_scaled: &'a mut [f64],
    pub(crate) p_end_scaled: &'a mut [f64],
    /// Integrated momentum, the momenta of all new points are added.
    pub(crate) rho: &'a mut [f64],
    pub(crate) log_sum_weight: &'a mut f64,
}

/// Scratch vectors of one recursion level.
#[derive(Debug, Clone)]
pub(crate) struct TreeLevel {
    p_end_inner: Box<[f64]>,
    p_end_scaled_inner: Box<[f64]>,
    rho_first: Box<[f64]>,
    theta_double_prime: Box<[f64]>,
    p_beg_inner: Box<[f64]>,
    p_beg_scaled_inner: Box<[f64]>,
    rho_second: Box<[f64]>,
}

impl TreeLevel {
    pub(crate) fn new(dim: usize) -> TreeLevel {
        let zeros = || vec![0f64; dim].into_boxed_slice();
        TreeLevel {
            p_end_inner: zeros(),
            p_end_scaled_inner: zeros(),
            rho_first: zeros(),
            theta_double_prime: zeros(),
            p_beg_inner: zeros(),
            p_beg_scaled_inner: zeros(),
            rho_second: zeros(),
        }
    }
}

/// State shared by all subtrees of one trajectory.
pub(crate) struct TreeBuilder<'a, F, M> {
    pub(crate) logp: &'a mut F,
    pub(crate) mass_matrix: &'a M,
    pub(crate) scratch: &'a mut [f64],
    /// Signed step size.
    pub(crate) epsilon: f64,
    /// Hamiltonian at the root of the trajectory.
    pub(crate) ham: f64,
    pub(crate) n_leapfrog: u64,
    pub(crate) sum_metro_prob: f64,
    pub(crate) diverging: bool,
}

impl<F: LogpFunc, M: MassMatrix> TreeBuilder<'_, F, M> {
    /// Integrate `2^depth` steps from `input.theta` and sample a proposal
    /// from them.
    ///
    /// `input.theta_adj` must hold the gradient at `input.theta`.
    /// `levels` needs at least `depth` entries.
    pub(crate) fn build_tree<R: Rng + ?Sized>(
        &mut self,
        input: &mut TreeInput<'_>,
        depth: usize,
        levels: &mut [TreeLevel],
        rng: &mut R,
    ) -> Result<TreeOutput> {
        if depth == 0 {
            return self.single_step(input);
        }

        let (deeper, level) = levels.split_at_mut(depth - 1);
        let level = &mut level[0];
        let TreeLevel {
            p_end_inner,
            p_end_scaled_inner,
            rho_first,
            theta_double_prime,
            p_beg_inner,
            p_beg_scaled_inner,
            rho_second,
        } = level;

        rho_first.fill(0.);
        let mut log_sum_weight_first = f64::NEG_INFINITY;
        let first = self.build_tree(
            &mut TreeInput {
                theta: &mut *input.theta,
                theta_adj: &mut *input.theta_adj,
                theta_prime: &mut *input.theta_prime,
                p_most: &mut *input.p_most,
                p_beg: &mut *input.p_beg,
                p_end: Some(&mut **p_end_inner),
                p_beg_scaled: &mut *input.p_beg_scaled,
                p_end_scaled: p_end_scaled_inner,
                rho: rho_first,
                log_sum_weight: &mut log_sum_weight_first,
            },
            depth - 1,
            deeper,
            rng,
        )?;
        if !first.valid {
            return Ok(first);
        }

        rho_second.fill(0.);
        let mut log_sum_weight_second = f64::NEG_INFINITY;
        let second = self.build_tree(
            &mut TreeInput {
                theta: &mut *input.theta,
                theta_adj: &mut *input.theta_adj,
                theta_prime: theta_double_prime,
                p_most: &mut *input.p_most,
                p_beg: p_beg_inner,
                p_end: input.p_end.as_deref_mut(),
                p_beg_scaled: p_beg_scaled_inner,
                p_end_scaled: &mut *input.p_end_scaled,
                rho: rho_second,
                log_sum_weight: &mut log_sum_weight_second,
            },
            depth - 1,
            deeper,
            rng,
        )?;
        if !second.valid {
            return Ok(TreeOutput {
                valid: false,
                ..first
            });
        }

        let log_sum_weight_curr = logaddexp(log_sum_weight_first, log_sum_weight_second);
        *input.log_sum_weight = logaddexp(*input.log_sum_weight, log_sum_weight_curr);

        let potential = if accept((log_sum_weight_second - log_sum_weight_curr).exp(), rng) {
            input.theta_prime.copy_from_slice(theta_double_prime);
            second.potential
        } else {
            first.potential
        };

        input
            .rho
            .iter_mut()
            .zip(rho_first.iter().zip(rho_second.iter()))
            .for_each(|(rho, (a, b))| *rho += a + b);

        // The merged subtree, and each half joined with the boundary of the other.
        let rho_curr_beg = sum_dot(rho_first, rho_second, input.p_beg_scaled);
        let rho_curr_end = sum_dot(rho_first, rho_second, input.p_end_scaled);
        let valid = rho_curr_beg > 0.
            && rho_curr_end > 0.
            && sum_dot(rho_first, p_beg_inner, input.p_beg_scaled) > 0.
            && sum_dot(rho_first, p_beg_inner, p_beg_scaled_inner) > 0.
            && sum_dot(p_end_inner, rho_second, p_end_scaled_inner) > 0.
            && sum_dot(p_end_inner, rho_second, input.p_end_scaled) > 0.;

        Ok(TreeOutput { valid, potential })
    }

    fn single_step(&mut self, input: &mut TreeInput<'_>) -> Result<TreeOutput> {
        let step = leapfrog(
            self.logp,
            input.theta,
            input.theta_adj,
            input.p_most,
            self.scratch,
            self.mass_matrix,
            self.epsilon,
            true,
        );
        self.n_leapfrog += 1;
        let Some(new_potential) = recover(step)? else {
            trace!("Logp error during leapfrog, treating as divergence");
            self.diverging = true;
            return Ok(TreeOutput {
                valid: false,
                potential: f64::INFINITY,
            });
        };
        let new_ham = hamiltonian(new_potential, self.mass_matrix.kinetic(input.p_most));

        let log_weight = self.ham - new_ham;
        *input.log_sum_weight = logaddexp(*input.log_sum_weight, log_weight);
        self.sum_metro_prob += if log_weight > 0. { 1. } else { log_weight.exp() };

        input.theta_prime.copy_from_slice(input.theta);

        input.p_beg.copy_from_slice(input.p_most);
        self.mass_matrix.dkinetic_dr(input.p_most, input.p_beg_scaled);
        if let Some(p_end) = input.p_end.as_deref_mut() {
            p_end.copy_from_slice(input.p_most);
        }
        input.p_end_scaled.copy_from_slice(input.p_beg_scaled);

        input
            .rho
            .iter_mut()
            .zip(input.p_most.iter())
            .for_each(|(rho, p)| *rho += p);

        let valid = new_ham - self.ham <= DELTA_MAX;
        if !valid {
            trace!("Divergence with energy error {}", new_ham - self.ham);
            self.diverging = true;
        }
        Ok(TreeOutput {
            valid,
            potential: new_potential,
        })
    }
}

/// Heuristic for an initial step size: double or halve `epsilon` until the
/// acceptance probability of a single leapfrog step crosses 0.8.
///
/// `theta` and `theta_adj` are restored before returning.
pub fn find_reasonable_epsilon<F, M, R>(
    mut epsilon: f64,
    logp: &mut F,
    theta: &mut [f64],
    theta_adj: &mut [f64],
    mass_matrix: &M,
    rng: &mut R,
) -> Result<f64>
where
    F: LogpFunc,
    M: MassMatrix,
    R: Rng + ?Sized,
{
    if epsilon == 0. || epsilon > 1e7 {
        return Ok(epsilon);
    }
    let diff_bound = 0.8f64.ln();
    let dim = theta.len();
    let mut r = vec![0f64; dim];
    let mut scratch = vec![0f64; dim];

    mass_matrix.sample(&mut r, rng);
    let potential_orig = match recover(reset_autodiff(logp, theta, theta_adj))? {
        Some(logp) => -logp,
        None => return Ok(epsilon),
    };
    let mut ham_orig = hamiltonian(potential_orig, mass_matrix.kinetic(&r));
    let theta_orig = theta.to_vec();
    let theta_adj_orig = theta_adj.to_vec();

    let mut step = |epsilon: f64, theta: &mut [f64], theta_adj: &mut [f64], r: &mut [f64]| {
        let potential = recover(leapfrog(
            &mut *logp,
            theta,
            theta_adj,
            r,
            &mut scratch,
            mass_matrix,
            epsilon,
            true,
        ))?;
        Ok::<_, NutsError>(
            potential.map_or(f64::INFINITY, |potential| {
                hamiltonian(potential, mass_matrix.kinetic(r))
            }),
        )
    };

    let mut ham_curr = step(epsilon, theta, theta_adj, &mut r)?;
    let direction = if ham_orig - ham_curr > diff_bound {
        1
    } else {
        -1
    };

    loop {
        let diff = ham_orig - ham_curr;
        if (direction == 1 && !(diff > diff_bound)) || (direction == -1 && !(diff < diff_bound)) {
            break;
        }
        epsilon *= if direction == -1 { 0.5 } else { 2. };
        if epsilon == 0. || epsilon > 1e7 {
            break;
        }

        theta.copy_from_slice(&theta_orig);
        theta_adj.copy_from_slice(&theta_adj_orig);
        mass_matrix.sample(&mut r, rng);
        ham_orig = hamiltonian(potential_orig, mass_matrix.kinetic(&r));
        ham_curr = step(epsilon, theta, theta_adj, &mut r)?;
    }

    theta.copy_from_slice(&theta_orig);
    theta_adj.copy_from_slice(&theta_adj_orig);
    Ok(epsilon)
}

/// Position, gradient and momentum buffers of a trajectory, reused across
/// draws.
#[derive(Debug, Clone)]
pub(crate) struct NutsWorkspace {
    theta_bb: Box<[f64]>,
    theta_bb_adj: Box<[f64]>,
    theta_ff: Box<[f64]>,
    theta_ff_adj: Box<[f64]>,
    theta_prime: Box<[f64]>,
    // Outermost (bb, ff) and inner (bf, fb) momenta of the backward and
    // forward half of the trajectory.
    p_bb: Box<[f64]>,
    p_bf: Box<[f64]>,
    p_fb: Box<[f64]>,
    p_ff: Box<[f64]>,
    p_bb_scaled: Box<[f64]>,
    p_bf_scaled: Box<[f64]>,
    p_fb_scaled: Box<[f64]>,
    p_ff_scaled: Box<[f64]>,
    rho: Box<[f64]>,
    rho_b: Box<[f64]>,
    rho_f: Box<[f64]>,
    scratch: Box<[f64]>,
    levels: Vec<TreeLevel>,
}

impl NutsWorkspace {
    pub(crate) fn new(dim: usize, max_depth: usize) -> NutsWorkspace {
        let zeros = || vec![0f64; dim].into_boxed_slice();
        NutsWorkspace {
            theta_bb: zeros(),
            theta_bb_adj: zeros(),
            theta_ff: zeros(),
            theta_ff_adj: zeros(),
            theta_prime: zeros(),
            p_bb: zeros(),
            p_bf: zeros(),
            p_fb: zeros(),
            p_ff: zeros(),
            p_bb_scaled: zeros(),
            p_bf_scaled: zeros(),
            p_fb_scaled: zeros(),
            p_ff_scaled: zeros(),
            rho: zeros(),
            rho_b: zeros(),
            rho_f: zeros(),
            scratch: zeros(),
            levels: (0..max_depth).map(|_| TreeLevel::new(dim)).collect(),
        }
    }
}

/// Summary of one NUTS transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawInfo {
    /// Number of trajectory doublings.
    pub depth: u64,
    pub n_leapfrog: u64,
    /// Mean Metropolis acceptance probability over all leapfrog steps.
    pub mean_accept_prob: f64,
    pub diverging: bool,
}

/// One NUTS transition starting at `theta_curr`, which is replaced by the
/// new draw. `potential` holds the potential energy at `theta_curr`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn draw<F, M, R>(
    logp: &mut F,
    mass_matrix: &M,
    ws: &mut NutsWorkspace,
    theta_curr: &mut [f64],
    potential: &mut f64,
    epsilon: f64,
    max_depth: usize,
    rng: &mut R,
) -> Result<DrawInfo>
where
    F: LogpFunc,
    M: MassMatrix,
    R: Rng + ?Sized,
{
    ws.theta_bb.copy_from_slice(theta_curr);
    ws.theta_ff.copy_from_slice(theta_curr);
    reset_autodiff(logp, &ws.theta_bb, &mut ws.theta_bb_adj)
        .map_err(|err| NutsError::LogpFailure(Box::new(err)))?;
    ws.theta_ff_adj.copy_from_slice(&ws.theta_bb_adj);

    let mut log_sum_weight = 0f64;

    mass_matrix.sample(&mut ws.p_bb, rng);
    ws.p_bf.copy_from_slice(&ws.p_bb);
    ws.p_fb.copy_from_slice(&ws.p_bb);
    ws.p_ff.copy_from_slice(&ws.p_bb);
    mass_matrix.dkinetic_dr(&ws.p_bb, &mut ws.p_bb_scaled);
    ws.p_bf_scaled.copy_from_slice(&ws.p_bb_scaled);
    ws.p_fb_scaled.copy_from_slice(&ws.p_bb_scaled);
    ws.p_ff_scaled.copy_from_slice(&ws.p_bb_scaled);
    ws.rho.copy_from_slice(&ws.p_bb);

    let ham_prev = hamiltonian(*potential, mass_matrix.kinetic(&ws.p_bb));

    let mut builder = TreeBuilder {
        logp,
        mass_matrix,
        scratch: &mut ws.scratch,
        epsilon,
        ham: ham_prev,
        n_leapfrog: 0,
        sum_metro_prob: 0.,
        diverging: false,
    };

    let mut n_doublings = 0;
    for depth in 0..max_depth {
        ws.rho_b.fill(0.);
        ws.rho_f.fill(0.);
        let mut log_sum_weight_subtree = f64::MIN;
        n_doublings += 1;

        let direction: Direction = rng.random();
        builder.epsilon = direction.sign() * epsilon;
        let levels = &mut ws.levels[..depth];
        let output = match direction {
            Direction::Backward => {
                ws.rho_f.copy_from_slice(&ws.rho);
                ws.p_fb.copy_from_slice(&ws.p_bb);
                ws.p_fb_scaled.copy_from_slice(&ws.p_bb_scaled);
                let mut input = TreeInput {
                    theta: &mut ws.theta_bb,
                    theta_adj: &mut ws.theta_bb_adj,
                    theta_prime: &mut ws.theta_prime,
                    p_most: &mut ws.p_bb,
                    p_beg: &mut ws.p_bf,
                    p_end: None,
                    p_beg_scaled: &mut ws.p_bf_scaled,
                    p_end_scaled: &mut ws.p_bb_scaled,
                    rho: &mut ws.rho_b,
                    log_sum_weight: &mut log_sum_weight_subtree,
                };
                builder.build_tree(&mut input, depth, levels, rng)?
            }
            Direction::Forward => {
                ws.rho_b.copy_from_slice(&ws.rho);
                ws.p_bf.copy_from_slice(&ws.p_ff);
                ws.p_bf_scaled.copy_from_slice(&ws.p_ff_scaled);
                let mut input = TreeInput {
                    theta: &mut ws.theta_ff,
                    theta_adj: &mut ws.theta_ff_adj,
                    theta_prime: &mut ws.theta_prime,
                    p_most: &mut ws.p_ff,
                    p_beg: &mut ws.p_fb,
                    p_end: None,
                    p_beg_scaled: &mut ws.p_fb_scaled,
                    p_end_scaled: &mut ws.p_ff_scaled,
                    rho: &mut ws.rho_f,
                    log_sum_weight: &mut log_sum_weight_subtree,
                };
                builder.build_tree(&mut input, depth, levels, rng)?
            }
        };

        if !output.valid {
            break;
        }

        // Subtrees with more weight than the existing trajectory are always accepted.
        if log_sum_weight_subtree > log_sum_weight
            || accept((log_sum_weight_subtree - log_sum_weight).exp(), rng)
        {
            theta_curr.copy_from_slice(&ws.theta_prime);
            *potential = output.potential;
        }
        log_sum_weight = logaddexp(log_sum_weight, log_sum_weight_subtree);

        ws.rho
            .iter_mut()
            .zip(ws.rho_b.iter().zip(ws.rho_f.iter()))
            .for_each(|(rho, (b, f))| *rho = b + f);

        let valid = check_entropy(&ws.rho, &ws.p_bb_scaled, &ws.p_ff_scaled)
            && sum_dot(&ws.rho_b, &ws.p_fb, &ws.p_bb_scaled) > 0.
            && sum_dot(&ws.rho_b, &ws.p_fb, &ws.p_fb_scaled) > 0.
            && sum_dot(&ws.p_bf, &ws.rho_f, &ws.p_bf_scaled) > 0.
            && sum_dot(&ws.p_bf, &ws.rho_f, &ws.p_ff_scaled) > 0.;
        if !valid {
            break;
        }
    }

    let mean_accept_prob = if builder.n_leapfrog == 0 {
        0.
    } else {
        builder.sum_metro_prob / builder.n_leapfrog as f64
    };
    Ok(DrawInfo {
        depth: n_doublings,
        n_leapfrog: builder.n_leapfrog,
        mean_accept_prob,
        diverging: builder.diverging,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mass_matrix::UnitMassMatrix;
    use crate::potential::test_logps::{Bilinear, NormalLogp};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn entropy_one_dimensional() {
        let rho = [1.];
        assert!(!check_entropy(&rho, &[-1.], &[3.]));
        assert!(!check_entropy(&rho, &[1.], &[-1.]));
        assert!(check_entropy(&rho, &[1.], &[3.]));
        // Orthogonal momentum is a U-turn.
        assert!(!check_entropy(&[1., 0.], &[0., 1.], &[1., 1.]));
    }

    #[test]
    fn direction_is_balanced() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let forward = (0..10_000)
            .filter(|_| rng.random::<Direction>() == Direction::Forward)
            .count();
        assert!((4_500..5_500).contains(&forward));
        assert_eq!(Direction::Backward.sign(), -1.);
    }

    struct Buffers {
        theta: Vec<f64>,
        theta_adj: Vec<f64>,
        theta_prime: Vec<f64>,
        p_most: Vec<f64>,
        p_beg: Vec<f64>,
        p_end: Vec<f64>,
        p_beg_scaled: Vec<f64>,
        p_end_scaled: Vec<f64>,
        rho: Vec<f64>,
        log_sum_weight: f64,
    }

    impl Buffers {
        fn new(theta: &[f64], theta_adj: &[f64], r: &[f64]) -> Self {
            let zeros = vec![0.; theta.len()];
            Buffers {
                theta: theta.to_vec(),
                theta_adj: theta_adj.to_vec(),
                theta_prime: zeros.clone(),
                p_most: r.to_vec(),
                p_beg: zeros.clone(),
                p_end: zeros.clone(),
                p_beg_scaled: zeros.clone(),
                p_end_scaled: zeros.clone(),
                rho: zeros,
                log_sum_weight: f64::NEG_INFINITY,
            }
        }

        fn input(&mut self, track_end: bool) -> TreeInput<'_> {
            TreeInput {
                theta: &mut self.theta,
                theta_adj: &mut self.theta_adj,
                theta_prime: &mut self.theta_prime,
                p_most: &mut self.p_most,
                p_beg: &mut self.p_beg,
                p_end: if track_end {
                    Some(self.p_end.as_mut_slice())
                } else {
                    None
                },
                p_beg_scaled: &mut self.p_beg_scaled,
                p_end_scaled: &mut self.p_end_scaled,
                rho: &mut self.rho,
                log_sum_weight: &mut self.log_sum_weight,
            }
        }
    }

    fn builder<'a, F: LogpFunc>(
        logp: &'a mut F,
        mass_matrix: &'a UnitMassMatrix,
        scratch: &'a mut [f64],
        epsilon: f64,
        ham: f64,
    ) -> TreeBuilder<'a, F, UnitMassMatrix> {
        TreeBuilder {
            logp,
            mass_matrix,
            scratch,
            epsilon,
            ham,
            n_leapfrog: 0,
            sum_metro_prob: 0.,
            diverging: false,
        }
    }

    #[test]
    fn build_tree_single_step() {
        // Same leapfrog step as in the integrator tests: the new point has
        // potential -17 and momentum (6, 3, 5), so its hamiltonian is 18.
        let mass = UnitMassMatrix::new(3);
        let mut scratch = [0.; 3];
        let mut logp = Bilinear;
        let mut buffers = Buffers::new(&[1., 2., 3.], &[1., 2., 3.], &[-1., 0., 1.]);
        let mut tree = builder(&mut logp, &mass, &mut scratch, 2., 20.);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let output = tree
            .build_tree(&mut buffers.input(true), 0, &mut [], &mut rng)
            .unwrap();

        assert_eq!(
            output,
            TreeOutput {
                valid: true,
                potential: -17.,
            }
        );
        assert_eq!(tree.n_leapfrog, 1);
        assert_eq!(tree.sum_metro_prob, 1.);
        assert!(!tree.diverging);
        assert_eq!(buffers.log_sum_weight, 2.);
        assert_eq!(buffers.theta, vec![1., 6., 11.]);
        assert_eq!(buffers.theta_prime, vec![1., 6., 11.]);
        assert_eq!(buffers.p_beg, vec![6., 3., 5.]);
        assert_eq!(buffers.p_end, vec![6., 3., 5.]);
        assert_eq!(buffers.p_beg_scaled, vec![6., 3., 5.]);
        assert_eq!(buffers.p_end_scaled, vec![6., 3., 5.]);
        assert_eq!(buffers.rho, vec![6., 3., 5.]);
    }

    #[test]
    fn build_tree_energy_loss() {
        let mass = UnitMassMatrix::new(3);
        let mut scratch = [0.; 3];
        let mut logp = Bilinear;
        let mut buffers = Buffers::new(&[1., 2., 3.], &[1., 2., 3.], &[-1., 0., 1.]);
        let mut tree = builder(&mut logp, &mass, &mut scratch, 2., 10.);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let output = tree
            .build_tree(&mut buffers.input(false), 0, &mut [], &mut rng)
            .unwrap();
        assert!(output.valid);
        assert_eq!(buffers.log_sum_weight, -8.);
        assert_abs_diff_eq!(tree.sum_metro_prob, (-8f64).exp(), epsilon = 1e-15);
        // Without an end buffer the end momentum is only tracked in p_most.
        assert_eq!(buffers.p_end, vec![0.; 3]);
        assert_eq!(buffers.p_most, vec![6., 3., 5.]);
    }

    #[test]
    fn build_tree_divergence() {
        let mass = UnitMassMatrix::new(3);
        let mut scratch = [0.; 3];
        let mut logp = Bilinear;
        let mut buffers = Buffers::new(&[1., 2., 3.], &[1., 2., 3.], &[-1., 0., 1.]);
        let mut tree = builder(&mut logp, &mass, &mut scratch, 2., -2000.);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let output = tree
            .build_tree(&mut buffers.input(true), 0, &mut [], &mut rng)
            .unwrap();
        assert!(!output.valid);
        assert!(tree.diverging);
    }

    #[test]
    fn build_tree_depth_two() {
        let mass = UnitMassMatrix::new(1);
        let mut logp = NormalLogp { mu: vec![0.] };
        let epsilon = 0.1;

        // Reference trajectory of four steps.
        let mut theta = [1.];
        let mut theta_adj = [0.];
        let mut r = [0.5];
        let mut scratch = [0.];
        let potential_start = -reset_autodiff(&mut logp, &theta, &mut theta_adj).unwrap();
        let ham = hamiltonian(potential_start, mass.kinetic(&r));
        let initial_adj = theta_adj;
        let mut positions = vec![];
        let mut momenta = vec![];
        for _ in 0..4 {
            leapfrog(
                &mut logp,
                &mut theta,
                &mut theta_adj,
                &mut r,
                &mut scratch,
                &mass,
                epsilon,
                true,
            )
            .unwrap();
            positions.push(theta[0]);
            momenta.push(r[0]);
        }

        let mut buffers = Buffers::new(&[1.], &initial_adj, &[0.5]);
        let mut levels = vec![TreeLevel::new(1), TreeLevel::new(1)];
        let mut tree = builder(&mut logp, &mass, &mut scratch, epsilon, ham);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let output = tree
            .build_tree(&mut buffers.input(false), 2, &mut levels, &mut rng)
            .unwrap();

        assert!(output.valid);
        assert_eq!(tree.n_leapfrog, 4);
        assert_abs_diff_eq!(buffers.theta[0], positions[3], epsilon = 1e-14);
        assert_abs_diff_eq!(buffers.p_most[0], momenta[3], epsilon = 1e-14);
        assert_abs_diff_eq!(buffers.p_beg[0], momenta[0], epsilon = 1e-14);
        assert_abs_diff_eq!(buffers.p_end_scaled[0], momenta[3], epsilon = 1e-14);
        assert_abs_diff_eq!(buffers.rho[0], momenta.iter().sum::<f64>(), epsilon = 1e-13);
        assert!(positions
            .iter()
            .any(|&x| (x - buffers.theta_prime[0]).abs() < 1e-14));
        // The proposal comes with its potential.
        assert_abs_diff_eq!(
            output.potential,
            0.5 * buffers.theta_prime[0] * buffers.theta_prime[0],
            epsilon = 1e-14
        );
        assert!(tree.sum_metro_prob > 3.9 && tree.sum_metro_prob <= 4.);
    }

    #[test]
    fn reasonable_epsilon_restores_state() {
        let mass = UnitMassMatrix::new(4);
        let mut logp = NormalLogp {
            mu: vec![0., 1., -1., 2.],
        };
        let mut theta = [0.5, 0.5, 0.5, 0.5];
        let mut theta_adj = [0.; 4];
        let mut rng = ChaCha8Rng::seed_from_u64(11);

        assert_eq!(
            find_reasonable_epsilon(0., &mut logp, &mut theta, &mut theta_adj, &mass, &mut rng)
                .unwrap(),
            0.
        );
        assert_eq!(
            find_reasonable_epsilon(2e7, &mut logp, &mut theta, &mut theta_adj, &mass, &mut rng)
                .unwrap(),
            2e7
        );

        let epsilon =
            find_reasonable_epsilon(1., &mut logp, &mut theta, &mut theta_adj, &mass, &mut rng)
                .unwrap();
        assert_eq!(theta, [0.5, 0.5, 0.5, 0.5]);
        assert_eq!(theta_adj, [-0.5, 0.5, -1.5, 1.5]);
        assert!(epsilon > 0.);
        assert_eq!(epsilon.log2().fract(), 0.);
    }

    #[test]
    fn zero_depth_keeps_position() {
        let mass = UnitMassMatrix::new(2);
        let mut logp = NormalLogp { mu: vec![0.; 2] };
        let mut ws = NutsWorkspace::new(2, 0);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut theta = vec![0.5, -0.5];
        let mut grad = vec![0.; 2];
        let mut potential = -reset_autodiff(&mut logp, &theta, &mut grad).unwrap();
        let before = potential;

        let info = draw(
            &mut logp,
            &mass,
            &mut ws,
            &mut theta,
            &mut potential,
            0.5,
            0,
            &mut rng,
        )
        .unwrap();
        assert_eq!(info.n_leapfrog, 0);
        assert_eq!(info.depth, 0);
        assert_eq!(info.mean_accept_prob, 0.);
        assert!(!info.diverging);
        assert_eq!(theta, vec![0.5, -0.5]);
        assert_eq!(potential, before);
    }

    #[test]
    fn draws_from_standard_normal() {
        let dim = 3;
        let mass = UnitMassMatrix::new(dim);
        let mut logp = NormalLogp { mu: vec![0.; dim] };
        let mut ws = NutsWorkspace::new(dim, 10);
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let mut theta = vec![0.3; dim];
        let mut grad = vec![0.; dim];
        let mut potential = -reset_autodiff(&mut logp, &theta, &mut grad).unwrap();

        let n = 4000;
        let mut sum = vec![0.; dim];
        let mut sum_sq = vec![0.; dim];
        let mut accept = 0.;
        for _ in 0..n {
            let info = draw(
                &mut logp,
                &mass,
                &mut ws,
                &mut theta,
                &mut potential,
                0.5,
                10,
                &mut rng,
            )
            .unwrap();
            assert!(!info.diverging);
            assert!(info.depth >= 1 && info.depth <= 10);
            accept += info.mean_accept_prob;
            for i in 0..dim {
                sum[i] += theta[i];
                sum_sq[i] += theta[i] * theta[i];
            }
            assert_abs_diff_eq!(
                potential,
                0.5 * theta.iter().map(|x| x * x).sum::<f64>(),
                epsilon = 1e-12
            );
        }
        for i in 0..dim {
            let mean = sum[i] / n as f64;
            let var = sum_sq[i] / n as f64 - mean * mean;
            assert!(mean.abs() < 0.1, "mean {} of coordinate {}", mean, i);
            assert!((var - 1.).abs() < 0.15, "variance {} of coordinate {}", var, i);
        }
        assert!(accept / n as f64 > 0.8);
    }
}
