use itertools::izip;
use log::debug;

use crate::mass_matrix::{DiagMassMatrix, MassMatrix};

/// Settings for the windowed mass matrix adaptation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarConfig {
    /// Number of warmup draws before the first adaptation window.
    pub init_buffer: usize,
    /// Number of warmup draws after the last adaptation window.
    pub term_buffer: usize,
    /// Length of the first adaptation window. Each following window doubles.
    pub window_base: usize,
}

impl Default for VarConfig {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            window_base: 25,
        }
    }
}

/// Online mean and variance (Welford's algorithm).
#[derive(Debug, Clone)]
pub struct WelfordVar {
    mean: Box<[f64]>,
    m2n: Box<[f64]>,
    n: u64,
}

impl WelfordVar {
    pub fn new(dim: usize) -> Self {
        Self {
            mean: vec![0f64; dim].into(),
            m2n: vec![0f64; dim].into(),
            n: 0,
        }
    }

    pub fn update(&mut self, x: &[f64]) {
        self.n += 1;
        let n = self.n as f64;
        izip!(x, self.mean.iter_mut(), self.m2n.iter_mut()).for_each(|(&x, mean, m2n)| {
            let delta = x - *mean;
            *mean += delta / n;
            *m2n += delta * (x - *mean);
        });
    }

    pub fn reset(&mut self) {
        self.mean.fill(0.);
        self.m2n.fill(0.);
        self.n = 0;
    }

    #[cfg(test)]
    pub(crate) fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Sum of squared deviations from the mean.
    pub fn m2n(&self) -> &[f64] {
        &self.m2n
    }

    pub fn n_samples(&self) -> u64 {
        self.n
    }

    /// Unbiased sample variance.
    #[cfg(test)]
    pub(crate) fn variance(&self) -> impl Iterator<Item = f64> + '_ {
        let denom = self.n.saturating_sub(1).max(1) as f64;
        self.m2n.iter().map(move |m2n| m2n / denom)
    }
}

/// Adaptation of the mass matrix during warmup.
pub trait VarianceAdapt<M: MassMatrix> {
    /// Record the draw of one warmup iteration.
    ///
    /// Returns true if the mass matrix changed, in which case the caller
    /// re-initializes the step size.
    fn adapt(&mut self, theta: &[f64], mass_matrix: &mut M) -> bool;
}

/// Leaves the mass matrix alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVarAdapt;

impl<M: MassMatrix> VarianceAdapt<M> for NoVarAdapt {
    fn adapt(&mut self, _theta: &[f64], _mass_matrix: &mut M) -> bool {
        false
    }
}

/// Expanding-window estimation of a diagonal mass matrix.
///
/// Warmup is split into an initial buffer, a series of windows that double
/// in length, and a terminal buffer. At the end of every window the inverse
/// mass matrix is set to the regularized sample variance of the draws inside
/// the window.
#[derive(Debug, Clone)]
pub struct VarAdapter {
    estimator: WelfordVar,
    warmup: usize,
    counter: usize,
    window_begin: usize,
    window_end: usize,
    init_buffer: usize,
    term_buffer: usize,
    window_base: usize,
}

impl VarAdapter {
    pub fn new(dim: usize, warmup: usize, config: VarConfig) -> Self {
        let VarConfig {
            mut init_buffer,
            mut term_buffer,
            mut window_base,
        } = config;

        if warmup <= 20 {
            init_buffer = 0;
            term_buffer = 0;
            window_base = warmup;
        } else if warmup < init_buffer + term_buffer + window_base {
            init_buffer = (0.15 * warmup as f64) as usize;
            term_buffer = (0.10 * warmup as f64) as usize;
            window_base = warmup - init_buffer - term_buffer;
        }

        let window_begin = init_buffer;
        let mut window_end = window_begin + window_base;
        let adapt_end = warmup.saturating_sub(term_buffer);
        if window_end + 2 * window_base > adapt_end {
            window_end = adapt_end;
        }

        Self {
            estimator: WelfordVar::new(dim),
            warmup,
            counter: 0,
            window_begin,
            window_end,
            init_buffer,
            term_buffer,
            window_base,
        }
    }

    fn adapt_end(&self) -> usize {
        self.warmup.saturating_sub(self.term_buffer)
    }

    /// Window boundaries, `[begin, end)`.
    pub fn window(&self) -> (usize, usize) {
        (self.window_begin, self.window_end)
    }

    /// Buffer sizes after shrinking them for short warmup phases.
    pub fn buffers(&self) -> VarConfig {
        VarConfig {
            init_buffer: self.init_buffer,
            term_buffer: self.term_buffer,
            window_base: self.window_base,
        }
    }

    fn shift_window(&mut self) {
        let adapt_end = self.adapt_end();
        if self.window_end == adapt_end {
            return;
        }
        let window_size = self.window_end - self.window_begin;
        self.window_begin = self.window_end;
        self.window_end = self.window_begin + 2 * window_size;
        if self.window_end == adapt_end {
            return;
        }
        // The next window would not fit, so stretch this one to the end.
        if self.window_end + 4 * window_size > adapt_end {
            self.window_end = adapt_end;
        }
    }

    /// Count one warmup iteration; on a window end, write the new variance
    /// into `m_inverse` and return true.
    pub fn update(&mut self, theta: &[f64], mass_matrix: &mut DiagMassMatrix) -> bool {
        if self.counter >= self.init_buffer && self.counter < self.adapt_end() {
            self.estimator.update(theta);
        }

        if self.counter + 1 == self.window_end {
            let n = self.estimator.n_samples() as f64;
            if n > 1. {
                let scale = n / ((n + 5.) * (n - 1.));
                let shrink = 1e-3 * (5. / (n + 5.));
                mass_matrix.update_diag(self.estimator.m2n().iter().map(|m2n| scale * m2n + shrink));
            }
            debug!(
                "Updated mass matrix from {} warmup draws in window [{}, {})",
                self.estimator.n_samples(),
                self.window_begin,
                self.window_end
            );
            self.estimator.reset();
            self.shift_window();
            self.counter += 1;
            return true;
        }

        self.counter += 1;
        false
    }
}

impl VarianceAdapt<DiagMassMatrix> for VarAdapter {
    fn adapt(&mut self, theta: &[f64], mass_matrix: &mut DiagMassMatrix) -> bool {
        self.update(theta, mass_matrix)
    }
}
