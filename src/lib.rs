//! Probabilistic programs over continuous parameters with reverse-mode
//! gradients, sampled by the No-U-Turn Sampler.
//!
//! A model is built as a [`Program`]: parameters with [`Constraint`]s, data,
//! expressions over them and sampling statements. [`nuts`] activates the
//! program, runs one adapted NUTS chain over the unconstrained space and
//! returns the draws in constrained space.
//!
//! ```
//! use nuts_ppl::{nuts, Constraint, Dist, NutsConfig, Program, Shape};
//!
//! let mut program = Program::new();
//! let mu = program.param("mu", Shape::Scalar, Constraint::Unconstrained)?;
//! let zero = program.constant(0.);
//! let one = program.constant(1.);
//! program.sample(mu, Dist::Normal { mu: zero, sigma: one })?;
//!
//! let config = NutsConfig {
//!     warmup: 100,
//!     samples: 100,
//!     seed: Some(42),
//!     ..Default::default()
//! };
//! let result = nuts(&mut program, config)?;
//! assert_eq!(result.cont_samples.nrows(), 100);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub(crate) mod chain;
pub(crate) mod constraint;
pub mod density;
pub(crate) mod graph;
pub(crate) mod integrator;
pub(crate) mod mass_matrix;
pub(crate) mod mass_matrix_adapt;
pub(crate) mod math;
pub(crate) mod nuts;
pub(crate) mod potential;
pub(crate) mod program;
pub(crate) mod sampler;
pub(crate) mod stepsize;

pub use chain::{Chain, NutsChain, SampleStats};
pub use constraint::{Constraint, ConstraintError, VisitCount};
pub use graph::{AdLogPdf, Dist, Shape, Var};
pub use integrator::{hamiltonian, leapfrog};
pub use mass_matrix::{DiagMassMatrix, MassMatrix, UnitMassMatrix};
pub use mass_matrix_adapt::{NoVarAdapt, VarAdapter, VarConfig, VarianceAdapt, WelfordVar};
pub use nuts::{check_entropy, find_reasonable_epsilon, Direction, DrawInfo, NutsError};
pub use potential::{LogpError, LogpFunc};
pub use program::{ModelError, OffsetPack, Program, PtrPack, INIT_RADIUS};
pub use sampler::{nuts, nuts_log_density, McmcResult, NutsConfig, VarPolicy};
pub use stepsize::{StepAdapter, StepConfig};
