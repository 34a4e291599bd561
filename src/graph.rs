//! Runtime expression graph of a model and its reverse mode evaluator.
//!
//! Nodes are stored in topological order: a node only refers to nodes that
//! were added before it. Each node owns a column-major region of a flat
//! value tape and of a parallel adjoint tape. One forward pass fills the value
//! tape and sums the log densities of all statements, one backward pass in
//! reverse node order accumulates the gradient into the unconstrained
//! adjoints.

use faer::Mat;

use crate::constraint::{Constraint, VisitCount};
use crate::density::{
    bernoulli_log_pdf, bernoulli_log_pdf_grad, cauchy_log_pdf, cauchy_log_pdf_grad,
    discrete_log_pdf, discrete_log_pdf_grad, normal_log_pdf, normal_log_pdf_grad, uniform_log_pdf, uniform_log_pdf_grad, wishart_log_pdf,
    wishart_log_pdf_grad,
};
use crate::math::vector_dot;
use crate::potential::LogpFunc;
use crate::program::PtrPack;

/// Shape of a value in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    /// A column vector.
    Vector(usize),
    /// A `rows x cols` matrix, stored column-major.
    Matrix(usize, usize),
}

impl Shape {
    pub fn rows(&self) -> usize {
        match *self {
            Shape::Scalar => 1,
            Shape::Vector(n) => n,
            Shape::Matrix(rows, _) => rows,
        }
    }

    pub fn cols(&self) -> usize {
        match *self {
            Shape::Matrix(_, cols) => cols,
            _ => 1,
        }
    }

    pub fn size(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn is_scalar(&self) -> bool {
        self.size() == 1
    }

    pub(crate) fn from_dims(rows: usize, cols: usize) -> Shape {
        match (rows, cols) {
            (1, 1) => Shape::Scalar,
            (n, 1) => Shape::Vector(n),
            (rows, cols) => Shape::Matrix(rows, cols),
        }
    }

    pub(crate) fn same_dims(&self, other: &Shape) -> bool {
        self.rows() == other.rows() && self.cols() == other.cols()
    }
}

/// Handle to a value (parameter, data, constant or expression) of a `Program`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var {
    pub(crate) program: u64,
    pub(crate) node: usize,
}

/// Distribution on the right hand side of a model statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dist {
    Normal { mu: Var, sigma: Var },
    Uniform { min: Var, max: Var },
    Cauchy { loc: Var, scale: Var },
    Bernoulli { p: Var },
    /// Categorical distribution over the indices of a vector of unnormalized weights.
    Discrete { weights: Var },
    /// Distribution over symmetric positive definite matrices.
    Wishart { scale: Var, df: Var },
}

impl Dist {
    pub(crate) fn args(&self) -> [Option<Var>; 2] {
        match *self {
            Dist::Normal { mu, sigma } => [Some(mu), Some(sigma)],
            Dist::Uniform { min, max } => [Some(min), Some(max)],
            Dist::Cauchy { loc, scale } => [Some(loc), Some(scale)],
            Dist::Bernoulli { p } => [Some(p), None],
            Dist::Discrete { weights } => [Some(weights), None],
            Dist::Wishart { scale, df } => [Some(scale), Some(df)],
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Dist::Normal { .. } => "normal",
            Dist::Uniform { .. } => "uniform",
            Dist::Cauchy { .. } => "cauchy",
            Dist::Bernoulli { .. } => "bernoulli",
            Dist::Discrete { .. } => "discrete",
            Dist::Wishart { .. } => "wishart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    Square,
}

impl UnaryOp {
    fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Square => x * x,
        }
    }

    /// Derivative at input `x` with output `y`.
    fn derivative(self, x: f64, y: f64) -> f64 {
        match self {
            UnaryOp::Neg => -1.,
            UnaryOp::Exp => y,
            UnaryOp::Log => 1. / x,
            UnaryOp::Sqrt => 0.5 / y,
            UnaryOp::Square => 2. * x,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
        }
    }

    fn partials(self, x: f64, y: f64) -> (f64, f64) {
        match self {
            BinaryOp::Add => (1., 1.),
            BinaryOp::Sub => (1., -1.),
            BinaryOp::Mul => (y, x),
            BinaryOp::Div => (1. / y, -x / (y * y)),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Op {
    /// Continuous parameter, index into `Graph::params`.
    Param(usize),
    /// Discrete parameter, index into `Graph::discrete`.
    DiscreteParam(usize),
    /// Data or constant. The values are written into the tape once.
    Fixed(Box<[f64]>),
    /// Transformed parameter, index into `Graph::tparams`.
    TParam { index: usize, expr: usize },
    Unary(UnaryOp, usize),
    /// Element-wise, a scalar operand is broadcast.
    Binary(BinaryOp, usize, usize),
    Sum(usize),
    /// `lhsᵀ rhs` of two vectors if `inner`, the matrix product otherwise.
    Dot { lhs: usize, rhs: usize, inner: bool },
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) op: Op,
    pub(crate) shape: Shape,
    pub(crate) offset: usize,
    /// The value depends on a continuous parameter.
    pub(crate) needs_grad: bool,
    /// The value depends on any parameter.
    pub(crate) random: bool,
}

/// Location of a parameter in the coordinate spaces of an `OffsetPack`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ParamOffsets {
    pub(crate) uc: usize,
    pub(crate) c: usize,
    pub(crate) v: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct ParamEntry {
    pub(crate) name: String,
    pub(crate) shape: Shape,
    pub(crate) constraint: Constraint,
    pub(crate) node: usize,
    pub(crate) offsets: ParamOffsets,
    pub(crate) n_priors: usize,
}

impl ParamEntry {
    pub(crate) fn uc_size(&self) -> usize {
        self.constraint.uc_size(self.shape.rows(), self.shape.cols())
    }

    pub(crate) fn c_size(&self) -> usize {
        self.constraint.c_size(self.shape.rows(), self.shape.cols())
    }

    fn uc<'a>(&self, uc: &'a [f64]) -> &'a [f64] {
        &uc[self.offsets.uc..self.offsets.uc + self.uc_size()]
    }

    fn c<'a>(&self, c: &'a [f64]) -> &'a [f64] {
        &c[self.offsets.c..self.offsets.c + self.c_size()]
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TParamEntry {
    pub(crate) name: String,
    pub(crate) node: usize,
    pub(crate) tp_offset: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Statement {
    pub(crate) target: usize,
    pub(crate) dist: Dist,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) params: Vec<ParamEntry>,
    pub(crate) discrete: Vec<ParamEntry>,
    pub(crate) tparams: Vec<TParamEntry>,
    pub(crate) statements: Vec<Statement>,
    tape_size: usize,
}

/// Value and adjoint storage for every node of a graph.
#[derive(Debug, Clone)]
pub(crate) struct Tape {
    pub(crate) values: Box<[f64]>,
    adjoints: Box<[f64]>,
}

impl Tape {
    pub(crate) fn new(graph: &Graph) -> Tape {
        let mut values = vec![0f64; graph.tape_size].into_boxed_slice();
        for node in graph.nodes.iter() {
            if let Op::Fixed(ref fixed) = node.op {
                values[node.offset..node.offset + fixed.len()].copy_from_slice(fixed);
            }
        }
        Tape {
            adjoints: vec![0f64; graph.tape_size].into(),
            values,
        }
    }
}

/// The buffers a forward pass reads from and writes to.
pub(crate) struct Bound<'a> {
    pub(crate) uc: &'a [f64],
    pub(crate) disc: &'a [f64],
    pub(crate) tp: &'a mut [f64],
    pub(crate) c: &'a mut [f64],
    pub(crate) v: &'a mut [VisitCount],
    pub(crate) epoch: u64,
}

#[inline]
fn at(values: &[f64], k: usize) -> f64 {
    if values.len() == 1 {
        values[0]
    } else {
        values[k]
    }
}

#[inline]
fn index(len: usize, k: usize) -> usize {
    if len == 1 {
        0
    } else {
        k
    }
}

impl Graph {
    pub(crate) fn push(&mut self, op: Op, shape: Shape) -> usize {
        let (needs_grad, random) = match &op {
            Op::Param(_) => (true, true),
            Op::DiscreteParam(_) => (false, true),
            Op::Fixed(_) => (false, false),
            Op::TParam { expr: a, .. } | Op::Unary(_, a) | Op::Sum(a) => {
                (self.nodes[*a].needs_grad, self.nodes[*a].random)
            }
            Op::Binary(_, a, b) | Op::Dot { lhs: a, rhs: b, .. } => {
                let (a, b) = (&self.nodes[*a], &self.nodes[*b]);
                (a.needs_grad || b.needs_grad, a.random || b.random)
            }
        };
        let offset = self.tape_size;
        self.tape_size += shape.size();
        self.nodes.push(Node {
            op,
            shape,
            offset,
            needs_grad,
            random,
        });
        self.nodes.len() - 1
    }

    pub(crate) fn node_values<'a>(&self, values: &'a [f64], node: usize) -> &'a [f64] {
        let node = &self.nodes[node];
        &values[node.offset..node.offset + node.shape.size()]
    }

    /// Evaluate every node and return the sum of the statement log densities.
    ///
    /// Constrained parameters are transformed at most once per epoch.
    pub(crate) fn forward(&self, tape: &mut Tape, bound: &mut Bound) -> f64 {
        for node in self.nodes.iter() {
            let size = node.shape.size();
            let (inputs, rest) = tape.values.split_at_mut(node.offset);
            let inputs: &[f64] = inputs;
            let out = &mut rest[..size];
            let input = |id: usize| {
                let node = &self.nodes[id];
                &inputs[node.offset..node.offset + node.shape.size()]
            };
            match node.op {
                Op::Param(index) => {
                    let entry = &self.params[index];
                    let uc = entry.uc(bound.uc);
                    if entry.constraint.is_unconstrained() {
                        out.copy_from_slice(uc);
                    } else {
                        let offsets = entry.offsets;
                        let c = &mut bound.c[offsets.c..offsets.c + entry.c_size()];
                        if bound.v[offsets.v].visit(bound.epoch) {
                            entry.constraint.inv_transform(uc, c);
                        }
                        out.copy_from_slice(&c[..size]);
                    }
                }
                Op::DiscreteParam(index) => {
                    let start = self.discrete[index].offsets.uc;
                    out.copy_from_slice(&bound.disc[start..start + size]);
                }
                Op::Fixed(_) => {}
                Op::TParam { index, expr } => {
                    out.copy_from_slice(input(expr));
                    let start = self.tparams[index].tp_offset;
                    bound.tp[start..start + size].copy_from_slice(out);
                }
                Op::Unary(op, a) => {
                    out.iter_mut()
                        .zip(input(a))
                        .for_each(|(out, &x)| *out = op.apply(x));
                }
                Op::Binary(op, a, b) => {
                    let (a, b) = (input(a), input(b));
                    out.iter_mut()
                        .enumerate()
                        .for_each(|(k, out)| *out = op.apply(at(a, k), at(b, k)));
                }
                Op::Sum(a) => out[0] = input(a).iter().sum(),
                Op::Dot { lhs, rhs, inner } => {
                    if inner {
                        out[0] = vector_dot(input(lhs), input(rhs));
                    } else {
                        let (a_shape, b_shape) = (self.nodes[lhs].shape, self.nodes[rhs].shape);
                        let (m, inner_dim, n) = (a_shape.rows(), a_shape.cols(), b_shape.cols());
                        let (a, b) = (input(lhs), input(rhs));
                        for j in 0..n {
                            for i in 0..m {
                                out[i + j * m] = (0..inner_dim)
                                    .map(|l| a[i + l * m] * b[l + j * inner_dim])
                                    .sum();
                            }
                        }
                    }
                }
            }
        }

        self.statements
            .iter()
            .map(|stmt| self.statement_log_pdf(&tape.values, stmt))
            .sum()
    }

    fn statement_log_pdf(&self, values: &[f64], stmt: &Statement) -> f64 {
        let x = self.node_values(values, stmt.target);
        let [a, b] = stmt.dist.args().map(|arg| arg.map(|arg| self.node_values(values, arg.node)));
        let elementwise = |f: fn(f64, f64, f64) -> f64| -> f64 {
            let (a, b) = (a.unwrap_or(&[]), b.unwrap_or(&[]));
            x.iter()
                .enumerate()
                .map(|(k, &x)| f(x, at(a, k), at(b, k)))
                .sum()
        };
        match stmt.dist {
            Dist::Normal { .. } => elementwise(normal_log_pdf),
            Dist::Uniform { .. } => elementwise(uniform_log_pdf),
            Dist::Cauchy { .. } => elementwise(cauchy_log_pdf),
            Dist::Bernoulli { .. } => {
                let p = a.unwrap_or(&[]);
                x.iter()
                    .enumerate()
                    .map(|(k, &x)| bernoulli_log_pdf(x, at(p, k)))
                    .sum()
            }
            Dist::Discrete { .. } => {
                let weights = a.unwrap_or(&[]);
                x.iter().map(|&x| discrete_log_pdf(x, weights)).sum()
            }
            Dist::Wishart { .. } => {
                let (x, v) = (as_mat(x), as_mat(a.unwrap_or(&[])));
                let df = b.map_or(f64::NAN, |df| df[0]);
                wishart_log_pdf(x.as_ref(), v.as_ref(), df)
            }
        }
    }

    /// Add the derivatives of the statement log densities to the node adjoints.
    fn statement_grad(&self, values: &[f64], adjoints: &mut [f64], stmt: &Statement) {
        let target = &self.nodes[stmt.target];
        let x = self.node_values(values, stmt.target);
        let args = stmt.dist.args().map(|arg| arg.map(|arg| &self.nodes[arg.node]));
        let offset = |node: Option<&Node>| node.map_or(0, |node| node.offset);
        let len = |node: Option<&Node>| node.map_or(1, |node| node.shape.size());
        let [a, b] = args;
        let (a_off, b_off, a_len, b_len) = (offset(a), offset(b), len(a), len(b));

        let mut elementwise = |f: fn(f64, f64, f64) -> (f64, f64, f64)| {
            for (k, &x) in x.iter().enumerate() {
                let (ia, ib) = (a_off + index(a_len, k), b_off + index(b_len, k));
                let (dx, da, db) = f(x, values[ia], values[ib]);
                adjoints[target.offset + k] += dx;
                adjoints[ia] += da;
                adjoints[ib] += db;
            }
        };
        match stmt.dist {
            Dist::Normal { .. } => elementwise(normal_log_pdf_grad),
            Dist::Uniform { .. } => elementwise(uniform_log_pdf_grad),
            Dist::Cauchy { .. } => elementwise(cauchy_log_pdf_grad),
            Dist::Bernoulli { .. } => {
                for (k, &x) in x.iter().enumerate() {
                    let ia = a_off + index(a_len, k);
                    adjoints[ia] += bernoulli_log_pdf_grad(x, values[ia]);
                }
            }
            Dist::Discrete { .. } => {
                let weights = &values[a_off..a_off + a_len];
                for &x in x.iter() {
                    discrete_log_pdf_grad(x, weights, &mut adjoints[a_off..a_off + a_len]);
                }
            }
            Dist::Wishart { .. } => {
                if !target.needs_grad {
                    return;
                }
                let p = target.shape.rows();
                let (xm, v) = (as_mat(x), as_mat(&values[a_off..a_off + a_len]));
                let mut grad = Mat::<f64>::zeros(p, p);
                let logp = wishart_log_pdf_grad(xm.as_ref(), v.as_ref(), values[b_off], &mut grad);
                if logp.is_finite() {
                    for j in 0..p {
                        for i in 0..p {
                            adjoints[target.offset + i + j * p] += grad[(i, j)];
                        }
                    }
                }
            }
        }
    }

    /// Accumulate the gradient of the last forward pass into `uc_adj`.
    ///
    /// `tape` and `c` must hold the results of a forward pass at `uc`.
    pub(crate) fn backward(
        &self,
        tape: &mut Tape,
        uc: &[f64],
        c: &[f64],
        uc_adj: &mut [f64],
        tp_adj: &mut [f64],
    ) {
        let Tape { values, adjoints } = tape;
        let values: &[f64] = values;
        adjoints.fill(0.);

        for stmt in self.statements.iter() {
            self.statement_grad(values, adjoints, stmt);
        }

        for node in self.nodes.iter().rev() {
            if !node.needs_grad {
                continue;
            }
            let size = node.shape.size();
            let (before, rest) = adjoints.split_at_mut(node.offset);
            let adj = &rest[..size];
            let out = &values[node.offset..node.offset + size];
            match node.op {
                Op::Param(index) => {
                    let entry = &self.params[index];
                    let start = entry.offsets.uc;
                    let uc_adj = &mut uc_adj[start..start + entry.uc_size()];
                    entry
                        .constraint
                        .inv_transform_grad(entry.uc(uc), entry.c(c), adj, uc_adj);
                }
                Op::DiscreteParam(_) | Op::Fixed(_) => {}
                Op::TParam { index, expr } => {
                    let start = self.tparams[index].tp_offset;
                    tp_adj[start..start + size].copy_from_slice(adj);
                    let expr_off = self.nodes[expr].offset;
                    adj.iter()
                        .enumerate()
                        .for_each(|(k, adj)| before[expr_off + k] += adj);
                }
                Op::Unary(op, a) => {
                    let a = &self.nodes[a];
                    for k in 0..size {
                        let x = values[a.offset + k];
                        before[a.offset + k] += adj[k] * op.derivative(x, out[k]);
                    }
                }
                Op::Binary(op, a, b) => {
                    let (a, b) = (&self.nodes[a], &self.nodes[b]);
                    let (a_len, b_len) = (a.shape.size(), b.shape.size());
                    for k in 0..size {
                        let (ia, ib) = (a.offset + index(a_len, k), b.offset + index(b_len, k));
                        let (da, db) = op.partials(values[ia], values[ib]);
                        before[ia] += adj[k] * da;
                        before[ib] += adj[k] * db;
                    }
                }
                Op::Sum(a) => {
                    let a = &self.nodes[a];
                    before[a.offset..a.offset + a.shape.size()]
                        .iter_mut()
                        .for_each(|x| *x += adj[0]);
                }
                Op::Dot { lhs, rhs, inner } => {
                    let (a, b) = (&self.nodes[lhs], &self.nodes[rhs]);
                    if inner {
                        for k in 0..a.shape.size() {
                            let (xa, xb) = (values[a.offset + k], values[b.offset + k]);
                            before[a.offset + k] += adj[0] * xb;
                            before[b.offset + k] += adj[0] * xa;
                        }
                    } else {
                        let (m, inner_dim, n) = (a.shape.rows(), a.shape.cols(), b.shape.cols());
                        // d(AB) / dA = G Bᵀ, d(AB) / dB = Aᵀ G
                        for j in 0..n {
                            for i in 0..m {
                                let g = adj[i + j * m];
                                for l in 0..inner_dim {
                                    let (ia, ib) = (a.offset + i + l * m, b.offset + l + j * inner_dim);
                                    let (xa, xb) = (values[ia], values[ib]);
                                    before[ia] += g * xb;
                                    before[ib] += g * xa;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sum of the log jacobians of all continuous parameters.
    pub(crate) fn log_jacobian(&self, uc: &[f64], c: &[f64]) -> f64 {
        self.params
            .iter()
            .map(|entry| entry.constraint.log_jacobian(entry.uc(uc), entry.c(c)))
            .sum()
    }

    pub(crate) fn log_jacobian_grad(&self, uc: &[f64], uc_adj: &mut [f64]) {
        for entry in self.params.iter() {
            let start = entry.offsets.uc;
            entry
                .constraint
                .log_jacobian_grad(entry.uc(uc), &mut uc_adj[start..start + entry.uc_size()]);
        }
    }
}

fn as_mat(values: &[f64]) -> Mat<f64> {
    let p = (values.len() as f64).sqrt() as usize;
    Mat::from_fn(p, p, |i, j| values[i + j * p])
}

/// Differentiable log density of a bound program over its unconstrained
/// parameters, including the log jacobians of the constraint transforms.
///
/// Created by `Program::ad_log_pdf`.
pub struct AdLogPdf<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) tape: &'a mut Tape,
    pub(crate) pack: &'a mut PtrPack,
    pub(crate) disc: &'a [f64],
    pub(crate) epoch: &'a mut u64,
}

impl AdLogPdf<'_> {
    fn evaluate(&mut self, position: &[f64]) -> f64 {
        *self.epoch += 1;
        let PtrPack { tp, c, v, .. } = &mut *self.pack;
        let mut bound = Bound {
            uc: position,
            disc: self.disc,
            tp,
            c,
            v,
            epoch: *self.epoch,
        };
        let logp = self.graph.forward(self.tape, &mut bound);
        logp + self.graph.log_jacobian(position, &self.pack.c)
    }
}

impl LogpFunc for AdLogPdf<'_> {
    type LogpError = std::convert::Infallible;

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
        let logp = self.evaluate(position);
        let PtrPack { c, tp_adj, .. } = &mut *self.pack;
        self.graph.backward(self.tape, position, c, grad, tp_adj);
        self.graph.log_jacobian_grad(position, grad);
        Ok(logp)
    }

    fn logp_value(&mut self, position: &[f64]) -> Result<f64, Self::LogpError> {
        Ok(self.evaluate(position))
    }

    fn dim(&self) -> usize {
        self.pack.uc.len()
    }
}
