//! Bijections between the unconstrained space the sampler moves in and the
//! natural domain of a parameter.
//!
//! All transforms work on flat column-major slices. The constrained storage of
//! a positive definite parameter holds the matrix `L Lᵀ` followed by its
//! Cholesky factor `L`, which the backward pass needs.

use faer::{Mat, Side};
use thiserror::Error;

use crate::math::sigmoid;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConstraintError {
    #[error("value {value} is outside of the support of {constraint:?}")]
    OutOfSupport { value: f64, constraint: Constraint },
    #[error("matrix is not symmetric positive definite")]
    NotPositiveDefinite,
    #[error("positive definite constraint needs a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
}

/// The support of a continuous parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Constraint {
    #[default]
    Unconstrained,
    /// `(l, inf)`
    Lower(f64),
    /// `(l, u)`
    Bounded(f64, f64),
    /// Symmetric positive definite `n x n` matrices, parametrized through
    /// the log-diagonal and strictly lower part of the Cholesky factor.
    PosDef,
}

impl Constraint {
    pub fn is_unconstrained(&self) -> bool {
        matches!(self, Constraint::Unconstrained)
    }

    /// Number of unconstrained coordinates for a value with `rows x cols` entries.
    pub fn uc_size(&self, rows: usize, cols: usize) -> usize {
        match self {
            Constraint::PosDef => rows * (rows + 1) / 2,
            _ => rows * cols,
        }
    }

    /// Size of the constrained scratch storage.
    ///
    /// Zero for unconstrained parameters, which read their unconstrained
    /// coordinates directly.
    pub fn c_size(&self, rows: usize, cols: usize) -> usize {
        match self {
            Constraint::Unconstrained => 0,
            Constraint::PosDef => 2 * rows * cols,
            _ => rows * cols,
        }
    }

    pub(crate) fn check_shape(&self, rows: usize, cols: usize) -> Result<(), ConstraintError> {
        match self {
            Constraint::PosDef if rows != cols => Err(ConstraintError::NotSquare { rows, cols }),
            _ => Ok(()),
        }
    }

    /// Map an unconstrained vector to the constrained storage.
    pub fn inv_transform(&self, uc: &[f64], c: &mut [f64]) {
        match *self {
            Constraint::Unconstrained => c.copy_from_slice(uc),
            Constraint::Lower(lower) => {
                c.iter_mut()
                    .zip(uc)
                    .for_each(|(c, &uc)| *c = uc.exp() + lower);
            }
            Constraint::Bounded(lower, upper) => {
                let range = upper - lower;
                c.iter_mut()
                    .zip(uc)
                    .for_each(|(c, &uc)| *c = lower + range * sigmoid(uc));
            }
            Constraint::PosDef => {
                let n = posdef_dim(uc.len());
                let (value, chol) = c.split_at_mut(n * n);
                fill_cholesky(uc, n, chol);
                for j in 0..n {
                    for i in j..n {
                        // Only the first `j + 1` columns of rows i and j overlap.
                        let dot: f64 = (0..=j).map(|k| chol[i + k * n] * chol[j + k * n]).sum();
                        value[i + j * n] = dot;
                        value[j + i * n] = dot;
                    }
                }
            }
        }
    }

    /// Map a constrained value to unconstrained coordinates.
    ///
    /// For positive definite parameters `c` only needs to contain the matrix.
    pub fn transform(&self, c: &[f64], uc: &mut [f64]) -> Result<(), ConstraintError> {
        match *self {
            Constraint::Unconstrained => uc.copy_from_slice(&c[..uc.len()]),
            Constraint::Lower(lower) => {
                for (uc, &c) in uc.iter_mut().zip(c) {
                    if !(c > lower) {
                        return Err(ConstraintError::OutOfSupport {
                            value: c,
                            constraint: *self,
                        });
                    }
                    *uc = (c - lower).ln();
                }
            }
            Constraint::Bounded(lower, upper) => {
                for (uc, &c) in uc.iter_mut().zip(c) {
                    if !(lower < c && c < upper) {
                        return Err(ConstraintError::OutOfSupport {
                            value: c,
                            constraint: *self,
                        });
                    }
                    *uc = ((c - lower) / (upper - c)).ln();
                }
            }
            Constraint::PosDef => {
                let n = posdef_dim(uc.len());
                let mat = Mat::from_fn(n, n, |i, j| c[i + j * n]);
                let llt = mat
                    .as_ref()
                    .llt(Side::Lower)
                    .map_err(|_| ConstraintError::NotPositiveDefinite)?;
                let l = llt.L();
                let mut pos = 0;
                for j in 0..n {
                    uc[pos] = l[(j, j)].ln();
                    pos += 1;
                    for i in (j + 1)..n {
                        uc[pos] = l[(i, j)];
                        pos += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Log absolute determinant of the jacobian of `inv_transform`.
    ///
    /// The positive definite variant drops the constant `n ln 2`.
    pub fn log_jacobian(&self, uc: &[f64], c: &[f64]) -> f64 {
        match *self {
            Constraint::Unconstrained => 0.,
            Constraint::Lower(_) => uc.iter().sum(),
            Constraint::Bounded(lower, upper) => {
                let range = upper - lower;
                c.iter()
                    .map(|&c| {
                        let scaled = c - lower;
                        scaled.ln() + (-scaled / range).ln_1p()
                    })
                    .sum()
            }
            Constraint::PosDef => {
                let n = posdef_dim(uc.len());
                diag_positions(n)
                    .enumerate()
                    .map(|(k, pos)| (n + 1 - k) as f64 * uc[pos])
                    .sum()
            }
        }
    }

    /// Add the derivative of `log_jacobian` with respect to `uc` to `uc_adj`.
    pub fn log_jacobian_grad(&self, uc: &[f64], uc_adj: &mut [f64]) {
        match *self {
            Constraint::Unconstrained => {}
            Constraint::Lower(_) => uc_adj.iter_mut().for_each(|adj| *adj += 1.),
            Constraint::Bounded(_, _) => {
                // d/dx [ln s(x) + ln(1 - s(x))] = 1 - 2 s(x)
                uc_adj
                    .iter_mut()
                    .zip(uc)
                    .for_each(|(adj, &uc)| *adj += 1. - 2. * sigmoid(uc));
            }
            Constraint::PosDef => {
                let n = posdef_dim(uc.len());
                diag_positions(n)
                    .enumerate()
                    .for_each(|(k, pos)| uc_adj[pos] += (n + 1 - k) as f64);
            }
        }
    }

    /// Backpropagate the adjoint `c_adj` of the constrained value into `uc_adj`.
    ///
    /// `c` must hold the output of `inv_transform` at `uc`.
    pub fn inv_transform_grad(&self, uc: &[f64], c: &[f64], c_adj: &[f64], uc_adj: &mut [f64]) {
        match *self {
            Constraint::Unconstrained => {
                uc_adj.iter_mut().zip(c_adj).for_each(|(out, adj)| *out += adj);
            }
            Constraint::Lower(lower) => {
                itertools::izip!(uc_adj, c, c_adj).for_each(|(out, &c, &adj)| {
                    *out += adj * (c - lower);
                });
            }
            Constraint::Bounded(lower, upper) => {
                let range = upper - lower;
                itertools::izip!(uc_adj, c, c_adj).for_each(|(out, &c, &adj)| {
                    let s = (c - lower) / range;
                    *out += adj * range * s * (1. - s);
                });
            }
            Constraint::PosDef => {
                let n = posdef_dim(uc.len());
                let chol = &c[n * n..2 * n * n];
                let mut pos = 0;
                for j in 0..n {
                    for i in j..n {
                        // (G + Gᵀ) L at (i, j)
                        let adj_l: f64 = (j..n)
                            .map(|k| (c_adj[i + k * n] + c_adj[k + i * n]) * chol[k + j * n])
                            .sum();
                        if i == j {
                            uc_adj[pos] += adj_l * chol[j + j * n];
                        } else {
                            uc_adj[pos] += adj_l;
                        }
                        pos += 1;
                    }
                }
            }
        }
    }
}

/// Records the evaluation epoch a constrained value was computed in, so that
/// a parameter referenced from several places in a model is transformed once
/// per evaluation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisitCount {
    last_epoch: u64,
    computed: u64,
}

impl VisitCount {
    /// Returns true if the value has to be recomputed for `epoch`.
    ///
    /// Epochs start at 1, so a fresh counter is always stale.
    pub fn visit(&mut self, epoch: u64) -> bool {
        if self.last_epoch == epoch {
            return false;
        }
        self.last_epoch = epoch;
        self.computed += 1;
        true
    }

    /// How often the value was recomputed in total.
    pub fn computed(&self) -> u64 {
        self.computed
    }
}

fn posdef_dim(uc_len: usize) -> usize {
    // uc_len = n (n + 1) / 2
    let n = (((8 * uc_len + 1) as f64).sqrt() as usize).saturating_sub(1) / 2;
    debug_assert_eq!(n * (n + 1) / 2, uc_len);
    n
}

/// Positions of the log-diagonal entries in the unconstrained vector.
fn diag_positions(n: usize) -> impl Iterator<Item = usize> {
    (0..n).scan(0, move |pos, k| {
        let current = *pos;
        *pos += n - k;
        Some(current)
    })
}

fn fill_cholesky(uc: &[f64], n: usize, chol: &mut [f64]) {
    chol.fill(0.);
    let mut pos = 0;
    for j in 0..n {
        chol[j + j * n] = uc[pos].exp();
        pos += 1;
        for i in (j + 1)..n {
            chol[i + j * n] = uc[pos];
            pos += 1;
        }
    }
}
