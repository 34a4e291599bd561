//! Building, activating and binding models.
//!
//! A model is declared through a [`Program`]: parameters, data and
//! expressions are added as nodes and connected by statements of the form
//! `target ~ distribution`. Before evaluation the program is activated,
//! which lays out every parameter in flat coordinate spaces, and bound to
//! buffers of the resulting sizes.

use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use rand::Rng;
use thiserror::Error;

use crate::constraint::{Constraint, ConstraintError, VisitCount};
use crate::graph::{
    AdLogPdf, BinaryOp, Bound, Dist, Graph, Op, ParamEntry, ParamOffsets, Shape, Statement,
    TParamEntry, Tape, UnaryOp, Var,
};
use crate::potential::LogpFunc;

/// Initial unconstrained values are drawn from `Uniform(-INIT_RADIUS, INIT_RADIUS)`.
pub const INIT_RADIUS: f64 = 2.;

static NEXT_PROGRAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("shape mismatch in {context}: {left:?} and {right:?}")]
    ShapeMismatch {
        context: &'static str,
        left: Shape,
        right: Shape,
    },
    #[error("parameter '{0}' has no prior")]
    MissingPrior(String),
    #[error("parameter '{0}' has more than one prior")]
    DuplicatePrior(String),
    #[error("could not find initial values with a finite log density")]
    InitializationFailed,
    #[error("{buffer} buffer has length {found}, expected {expected}")]
    BindMismatch {
        buffer: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("variable does not belong to this program")]
    UnknownNode,
    #[error("scale and degrees of freedom of a wishart distribution must not depend on parameters")]
    ParameterDependentWishart,
    #[error("program has to be activated before binding")]
    NotActivated,
    #[error("program has to be bound before evaluation")]
    NotBound,
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}

/// Total sizes per coordinate space, accumulated over all parameters of one
/// kind (continuous or discrete) during activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OffsetPack {
    /// Unconstrained coordinates.
    pub uc_offset: usize,
    /// Transformed parameter values.
    pub tp_offset: usize,
    /// Constrained value scratch.
    pub c_offset: usize,
    /// Visit counters.
    pub v_offset: usize,
}

impl OffsetPack {
    pub fn is_empty(&self) -> bool {
        *self == OffsetPack::default()
    }
}

/// The flat buffers a program is bound to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PtrPack {
    pub uc: Vec<f64>,
    pub uc_adj: Vec<f64>,
    pub tp: Vec<f64>,
    pub tp_adj: Vec<f64>,
    pub c: Vec<f64>,
    pub v: Vec<VisitCount>,
}

impl PtrPack {
    /// Allocate zeroed buffers of the sizes in `offsets`.
    pub fn new(offsets: &OffsetPack) -> PtrPack {
        PtrPack {
            uc: vec![0.; offsets.uc_offset],
            uc_adj: vec![0.; offsets.uc_offset],
            tp: vec![0.; offsets.tp_offset],
            tp_adj: vec![0.; offsets.tp_offset],
            c: vec![0.; offsets.c_offset],
            v: vec![VisitCount::default(); offsets.v_offset],
        }
    }

    fn check(&self, offsets: &OffsetPack) -> Result<(), ModelError> {
        let check = |buffer, expected, found| {
            if expected == found {
                Ok(())
            } else {
                Err(ModelError::BindMismatch {
                    buffer,
                    expected,
                    found,
                })
            }
        };
        check("uc", offsets.uc_offset, self.uc.len())?;
        check("uc_adj", offsets.uc_offset, self.uc_adj.len())?;
        check("tp", offsets.tp_offset, self.tp.len())?;
        check("tp_adj", offsets.tp_offset, self.tp_adj.len())?;
        check("c", offsets.c_offset, self.c.len())?;
        check("v", offsets.v_offset, self.v.len())
    }
}

#[derive(Debug, Clone)]
struct Binding {
    cont: PtrPack,
    disc: PtrPack,
    tape: Tape,
}

/// A model under construction or ready for evaluation.
#[derive(Debug, Clone)]
pub struct Program {
    id: u64,
    graph: Graph,
    offsets: Option<(OffsetPack, OffsetPack)>,
    binding: Option<Binding>,
    epoch: u64,
}

impl Default for Program {
    fn default() -> Self {
        Self::new()
    }
}

impl Program {
    pub fn new() -> Program {
        Program {
            id: NEXT_PROGRAM_ID.fetch_add(1, Ordering::Relaxed),
            graph: Graph::default(),
            offsets: None,
            binding: None,
            epoch: 0,
        }
    }

    fn node(&self, var: Var) -> Result<usize, ModelError> {
        if var.program != self.id || var.node >= self.graph.nodes.len() {
            return Err(ModelError::UnknownNode);
        }
        Ok(var.node)
    }

    fn shape(&self, var: Var) -> Result<Shape, ModelError> {
        Ok(self.graph.nodes[self.node(var)?].shape)
    }

    fn push(&mut self, op: Op, shape: Shape) -> Var {
        // Any structural change invalidates the layout.
        self.offsets = None;
        self.binding = None;
        Var {
            program: self.id,
            node: self.graph.push(op, shape),
        }
    }

    /// Declare a continuous parameter.
    pub fn param(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
        constraint: Constraint,
    ) -> Result<Var, ModelError> {
        constraint.check_shape(shape.rows(), shape.cols())?;
        let index = self.graph.params.len();
        let var = self.push(Op::Param(index), shape);
        self.graph.params.push(ParamEntry {
            name: name.into(),
            shape,
            constraint,
            node: var.node,
            offsets: ParamOffsets::default(),
            n_priors: 0,
        });
        Ok(var)
    }

    /// Declare a parameter with values in `{0, 1, ..}`.
    pub fn discrete_param(&mut self, name: impl Into<String>, shape: Shape) -> Var {
        let index = self.graph.discrete.len();
        let var = self.push(Op::DiscreteParam(index), shape);
        self.graph.discrete.push(ParamEntry {
            name: name.into(),
            shape,
            constraint: Constraint::Unconstrained,
            node: var.node,
            offsets: ParamOffsets::default(),
            n_priors: 0,
        });
        var
    }

    /// Observed values, column-major for matrices.
    pub fn data(
        &mut self,
        name: impl Into<String>,
        shape: Shape,
        values: impl Into<Vec<f64>>,
    ) -> Result<Var, ModelError> {
        let values = values.into();
        if values.len() != shape.size() {
            return Err(ModelError::ShapeMismatch {
                context: "data",
                left: shape,
                right: Shape::Vector(values.len()),
            });
        }
        let name = name.into();
        debug!("Adding data '{}' of shape {:?}", name, shape);
        Ok(self.push(Op::Fixed(values.into()), shape))
    }

    pub fn constant(&mut self, value: f64) -> Var {
        self.push(Op::Fixed(Box::new([value])), Shape::Scalar)
    }

    /// A deterministic function of the parameters, stored in the transformed
    /// parameter buffer on every evaluation.
    pub fn tparam(&mut self, name: impl Into<String>, expr: Var) -> Result<Var, ModelError> {
        let expr_node = self.node(expr)?;
        let shape = self.graph.nodes[expr_node].shape;
        let index = self.graph.tparams.len();
        let var = self.push(
            Op::TParam {
                index,
                expr: expr_node,
            },
            shape,
        );
        self.graph.tparams.push(TParamEntry {
            name: name.into(),
            node: var.node,
            tp_offset: 0,
        });
        Ok(var)
    }

    fn binary(
        &mut self,
        op: BinaryOp,
        context: &'static str,
        a: Var,
        b: Var,
    ) -> Result<Var, ModelError> {
        let (left, right) = (self.shape(a)?, self.shape(b)?);
        let shape = if left.same_dims(&right) || right.is_scalar() {
            left
        } else if left.is_scalar() {
            right
        } else {
            return Err(ModelError::ShapeMismatch {
                context,
                left,
                right,
            });
        };
        Ok(self.push(Op::Binary(op, a.node, b.node), shape))
    }

    fn unary(&mut self, op: UnaryOp, a: Var) -> Result<Var, ModelError> {
        let shape = self.shape(a)?;
        Ok(self.push(Op::Unary(op, a.node), shape))
    }

    pub fn add(&mut self, a: Var, b: Var) -> Result<Var, ModelError> {
        self.binary(BinaryOp::Add, "add", a, b)
    }

    pub fn sub(&mut self, a: Var, b: Var) -> Result<Var, ModelError> {
        self.binary(BinaryOp::Sub, "sub", a, b)
    }

    pub fn mul(&mut self, a: Var, b: Var) -> Result<Var, ModelError> {
        self.binary(BinaryOp::Mul, "mul", a, b)
    }

    pub fn div(&mut self, a: Var, b: Var) -> Result<Var, ModelError> {
        self.binary(BinaryOp::Div, "div", a, b)
    }

    pub fn neg(&mut self, a: Var) -> Result<Var, ModelError> {
        self.unary(UnaryOp::Neg, a)
    }

    pub fn exp(&mut self, a: Var) -> Result<Var, ModelError> {
        self.unary(UnaryOp::Exp, a)
    }

    pub fn log(&mut self, a: Var) -> Result<Var, ModelError> {
        self.unary(UnaryOp::Log, a)
    }

    pub fn sqrt(&mut self, a: Var) -> Result<Var, ModelError> {
        self.unary(UnaryOp::Sqrt, a)
    }

    pub fn square(&mut self, a: Var) -> Result<Var, ModelError> {
        self.unary(UnaryOp::Square, a)
    }

    /// Sum of all entries.
    pub fn sum(&mut self, a: Var) -> Result<Var, ModelError> {
        self.node(a)?;
        Ok(self.push(Op::Sum(a.node), Shape::Scalar))
    }

    /// Inner product of two vectors of equal length, or the matrix product.
    pub fn dot(&mut self, a: Var, b: Var) -> Result<Var, ModelError> {
        let (left, right) = (self.shape(a)?, self.shape(b)?);
        let (op, shape) = if left.cols() == 1 && right.cols() == 1 && left.rows() == right.rows() {
            (
                Op::Dot {
                    lhs: a.node,
                    rhs: b.node,
                    inner: true,
                },
                Shape::Scalar,
            )
        } else if left.cols() == right.rows() {
            (
                Op::Dot {
                    lhs: a.node,
                    rhs: b.node,
                    inner: false,
                },
                Shape::from_dims(left.rows(), right.cols()),
            )
        } else {
            return Err(ModelError::ShapeMismatch {
                context: "dot",
                left,
                right,
            });
        };
        Ok(self.push(op, shape))
    }

    /// Add the statement `target ~ dist`.
    ///
    /// A statement with a parameter as target is the prior of that parameter.
    pub fn sample(&mut self, target: Var, dist: Dist) -> Result<(), ModelError> {
        let target_node = self.node(target)?;
        let target_shape = self.graph.nodes[target_node].shape;
        let [first, second] = dist.args();
        let first = first.map(|arg| self.shape(arg)).transpose()?;
        let second = second.map(|arg| self.shape(arg)).transpose()?;

        let mismatch = |right: Shape| ModelError::ShapeMismatch {
            context: dist.name(),
            left: target_shape,
            right,
        };
        match dist {
            Dist::Wishart { scale, df } => {
                if target_shape.rows() != target_shape.cols() {
                    return Err(mismatch(target_shape));
                }
                if let Some(shape) = first.filter(|shape| !shape.same_dims(&target_shape)) {
                    return Err(mismatch(shape));
                }
                if let Some(shape) = second.filter(|shape| !shape.is_scalar()) {
                    return Err(mismatch(shape));
                }
                if self.graph.nodes[scale.node].random || self.graph.nodes[df.node].random {
                    return Err(ModelError::ParameterDependentWishart);
                }
            }
            Dist::Discrete { .. } => {
                if let Some(shape) = first.filter(|shape| shape.cols() != 1) {
                    return Err(mismatch(shape));
                }
            }
            _ => {
                for shape in first.into_iter().chain(second) {
                    if !(shape.is_scalar() || shape.same_dims(&target_shape)) {
                        return Err(mismatch(shape));
                    }
                }
            }
        }

        match self.graph.nodes[target_node].op {
            Op::Param(index) => self.note_prior(index, false)?,
            Op::DiscreteParam(index) => self.note_prior(index, true)?,
            _ => {}
        }
        self.offsets = None;
        self.binding = None;
        self.graph.statements.push(Statement {
            target: target_node,
            dist,
        });
        Ok(())
    }

    fn note_prior(&mut self, index: usize, discrete: bool) -> Result<(), ModelError> {
        let entry = if discrete {
            &mut self.graph.discrete[index]
        } else {
            &mut self.graph.params[index]
        };
        if entry.n_priors > 0 {
            return Err(ModelError::DuplicatePrior(entry.name.clone()));
        }
        entry.n_priors += 1;
        Ok(())
    }

    /// Lay out all parameters and transformed parameters in flat coordinate
    /// spaces. Returns the continuous and the discrete offset pack.
    pub fn activate(&mut self) -> Result<(OffsetPack, OffsetPack), ModelError> {
        if let Some(entry) = self
            .graph
            .params
            .iter()
            .chain(self.graph.discrete.iter())
            .find(|entry| entry.n_priors == 0)
        {
            return Err(ModelError::MissingPrior(entry.name.clone()));
        }

        let mut cont = OffsetPack::default();
        for entry in self.graph.params.iter_mut() {
            entry.offsets = ParamOffsets {
                uc: cont.uc_offset,
                c: cont.c_offset,
                v: cont.v_offset,
            };
            cont.uc_offset += entry.uc_size();
            cont.c_offset += entry.c_size();
            if !entry.constraint.is_unconstrained() {
                cont.v_offset += 1;
            }
        }
        for entry in self.graph.tparams.iter_mut() {
            entry.tp_offset = cont.tp_offset;
            cont.tp_offset += self.graph.nodes[entry.node].shape.size();
        }

        let mut disc = OffsetPack::default();
        for entry in self.graph.discrete.iter_mut() {
            entry.offsets.uc = disc.uc_offset;
            disc.uc_offset += entry.shape.size();
        }

        debug!("Activated program: continuous {:?}, discrete {:?}", cont, disc);
        self.offsets = Some((cont, disc));
        self.binding = None;
        Ok((cont, disc))
    }

    /// Bind the program to buffers for continuous and discrete parameters.
    ///
    /// The buffer sizes must match the offset packs returned by `activate`.
    pub fn bind(&mut self, cont: PtrPack, disc: PtrPack) -> Result<(), ModelError> {
        let (cont_offsets, disc_offsets) = self.offsets.ok_or(ModelError::NotActivated)?;
        cont.check(&cont_offsets)?;
        disc.check(&disc_offsets)?;
        self.binding = Some(Binding {
            cont,
            disc,
            tape: Tape::new(&self.graph),
        });
        Ok(())
    }

    /// Activate the program and bind it to freshly allocated buffers.
    pub fn activate_and_bind(&mut self) -> Result<(OffsetPack, OffsetPack), ModelError> {
        let (cont, disc) = self.activate()?;
        self.bind(PtrPack::new(&cont), PtrPack::new(&disc))?;
        Ok((cont, disc))
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// The buffers of the continuous parameters.
    pub fn cont_pack(&self) -> Option<&PtrPack> {
        self.binding.as_ref().map(|binding| &binding.cont)
    }

    /// The buffers of the discrete parameters.
    pub fn disc_pack(&self) -> Option<&PtrPack> {
        self.binding.as_ref().map(|binding| &binding.disc)
    }

    /// Overwrite the unconstrained values of the continuous parameters.
    pub fn set_unconstrained(&mut self, uc: &[f64]) -> Result<(), ModelError> {
        let binding = self.binding.as_mut().ok_or(ModelError::NotBound)?;
        if binding.cont.uc.len() != uc.len() {
            return Err(ModelError::BindMismatch {
                buffer: "uc",
                expected: binding.cont.uc.len(),
                found: uc.len(),
            });
        }
        binding.cont.uc.copy_from_slice(uc);
        Ok(())
    }

    /// Log density at the bound unconstrained values, in constrained space
    /// and without the log jacobians of the transforms.
    pub fn log_pdf(&mut self) -> Result<f64, ModelError> {
        let binding = self.binding.as_mut().ok_or(ModelError::NotBound)?;
        self.epoch += 1;
        let Binding { cont, disc, tape } = binding;
        let mut bound = Bound {
            uc: &cont.uc,
            disc: &disc.uc,
            tp: &mut cont.tp,
            c: &mut cont.c,
            v: &mut cont.v,
            epoch: self.epoch,
        };
        Ok(self.graph.forward(tape, &mut bound))
    }

    /// Differentiable log density over the unconstrained space, including the
    /// log jacobians of the transforms.
    pub fn ad_log_pdf(&mut self) -> Result<AdLogPdf<'_>, ModelError> {
        let binding = self.binding.as_mut().ok_or(ModelError::NotBound)?;
        let Binding { cont, disc, tape } = binding;
        Ok(AdLogPdf {
            graph: &self.graph,
            tape,
            pack: cont,
            disc: &disc.uc,
            epoch: &mut self.epoch,
        })
    }

    /// Evaluate `ad_log_pdf` at the bound unconstrained values and store the
    /// gradient into the bound `uc_adj` buffer.
    pub fn autodiff(&mut self) -> Result<f64, ModelError> {
        let binding = self.binding.as_mut().ok_or(ModelError::NotBound)?;
        let position = binding.cont.uc.clone();
        let mut grad = vec![0.; position.len()];
        let logp = match self.ad_log_pdf()?.logp(&position, &mut grad) {
            Ok(logp) => logp,
            Err(never) => match never {},
        };
        if let Some(binding) = self.binding.as_mut() {
            binding.cont.uc_adj.copy_from_slice(&grad);
        }
        Ok(logp)
    }

    /// Draw initial values for all parameters.
    ///
    /// Continuous parameters are drawn uniformly in `(-INIT_RADIUS, INIT_RADIUS)`
    /// in unconstrained space, discrete ones uniformly from `{0, 1}` or from the
    /// categories of their `Discrete` prior. With
    /// `prune`, values outside of the support of their uniform prior are
    /// redrawn inside of it until the log density is finite.
    pub fn init_params<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        prune: bool,
    ) -> Result<(), ModelError> {
        let binding = self.binding.as_mut().ok_or(ModelError::NotBound)?;
        binding
            .cont
            .uc
            .iter_mut()
            .for_each(|uc| *uc = rng.random_range(-INIT_RADIUS..INIT_RADIUS));
        binding
            .disc
            .uc
            .iter_mut()
            .for_each(|x| *x = rng.random_range(0..2u8) as f64);
        for stmt in self.graph.statements.iter() {
            let (Op::DiscreteParam(index), Dist::Discrete { weights }) =
                (&self.graph.nodes[stmt.target].op, stmt.dist)
            else {
                continue;
            };
            let categories = self.graph.nodes[weights.node].shape.size();
            if categories == 0 {
                continue;
            }
            let entry = &self.graph.discrete[*index];
            let start = entry.offsets.uc;
            binding.disc.uc[start..start + entry.shape.size()]
                .iter_mut()
                .for_each(|x| *x = rng.random_range(0..categories) as f64);
        }

        if !prune {
            return Ok(());
        }

        let mut logp = self.log_pdf()?;
        for _ in 0..self.graph.params.len() {
            if logp != f64::NEG_INFINITY {
                break;
            }
            if !self.prune(rng)? {
                break;
            }
            logp = self.log_pdf()?;
        }
        if logp == f64::NEG_INFINITY {
            return Err(ModelError::InitializationFailed);
        }
        Ok(())
    }

    /// Redraw parameter values that are outside of the support of a uniform
    /// prior. Needs the tape of a forward pass at the current values.
    fn prune<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<bool, ModelError> {
        let binding = self.binding.as_mut().ok_or(ModelError::NotBound)?;
        let values = &binding.tape.values;
        let mut modified = false;
        for stmt in self.graph.statements.iter() {
            let (Op::Param(index), Dist::Uniform { min, max }) =
                (&self.graph.nodes[stmt.target].op, stmt.dist)
            else {
                continue;
            };
            let entry = &self.graph.params[*index];
            let min = self.graph.node_values(values, min.node);
            let max = self.graph.node_values(values, max.node);
            let mut current = self.graph.node_values(values, entry.node).to_vec();
            let mut changed = false;
            for (k, x) in current.iter_mut().enumerate() {
                let (lower, upper) = (pick(min, k), pick(max, k));
                if !(lower < *x && *x < upper) && lower < upper {
                    *x = rng.random_range(lower..upper);
                    changed = true;
                }
            }
            if changed {
                let start = entry.offsets.uc;
                let uc = &mut binding.cont.uc[start..start + entry.uc_size()];
                entry
                    .constraint
                    .transform(&current, uc)
                    .map_err(|_| ModelError::InitializationFailed)?;
                modified = true;
            }
        }
        Ok(modified)
    }

    /// Number of constrained values of all continuous parameters.
    pub fn constrained_size(&self) -> usize {
        self.graph.params.iter().map(|entry| entry.shape.size()).sum()
    }

    /// Names of the constrained values of all continuous parameters, in the
    /// order of `write_constrained`.
    pub fn param_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.constrained_size());
        for entry in self.graph.params.iter() {
            let shape = entry.shape;
            match shape {
                Shape::Scalar => names.push(entry.name.clone()),
                Shape::Vector(n) => {
                    names.extend((0..n).map(|i| format!("{}[{}]", entry.name, i)))
                }
                Shape::Matrix(rows, cols) => names.extend(
                    (0..cols)
                        .flat_map(|j| (0..rows).map(move |i| (i, j)))
                        .map(|(i, j)| format!("{}[{},{}]", entry.name, i, j)),
                ),
            }
        }
        names
    }

    /// Names of the transformed parameters.
    pub fn tparam_names(&self) -> Vec<String> {
        self.graph.tparams.iter().map(|tp| tp.name.clone()).collect()
    }

    /// Write the constrained values of all continuous parameters at the bound
    /// unconstrained values into `row` and return `log_pdf`.
    pub fn write_constrained(&mut self, row: &mut [f64]) -> Result<f64, ModelError> {
        if row.len() != self.constrained_size() {
            return Err(ModelError::BindMismatch {
                buffer: "row",
                expected: self.constrained_size(),
                found: row.len(),
            });
        }
        let logp = self.log_pdf()?;
        let binding = self.binding.as_ref().ok_or(ModelError::NotBound)?;
        let mut pos = 0;
        for entry in self.graph.params.iter() {
            let values = self.graph.node_values(&binding.tape.values, entry.node);
            row[pos..pos + values.len()].copy_from_slice(values);
            pos += values.len();
        }
        Ok(logp)
    }
}

fn pick(values: &[f64], k: usize) -> f64 {
    if values.len() == 1 {
        values[0]
    } else {
        values[k]
    }
}
