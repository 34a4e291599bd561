use std::convert::Infallible;
use std::fmt::Debug;

/// Errors that happen when we evaluate the logp and gradient function
pub trait LogpError: std::error::Error + Send + Sync + 'static {
    /// Unrecoverable errors during logp computation stop sampling,
    /// recoverable errors are seen as divergences.
    fn is_recoverable(&self) -> bool;
}

impl LogpError for Infallible {
    fn is_recoverable(&self) -> bool {
        match *self {}
    }
}

/// An unnormalized log density over the unconstrained space, with its gradient.
pub trait LogpFunc {
    type LogpError: Debug + LogpError;

    /// Evaluate the log density at `position` and add its gradient to `grad`.
    ///
    /// The caller zeroes `grad` before a fresh gradient pass.
    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError>;

    /// Evaluate the log density without a gradient.
    fn logp_value(&mut self, position: &[f64]) -> Result<f64, Self::LogpError> {
        let mut grad = vec![0f64; self.dim()];
        self.logp(position, &mut grad)
    }

    fn dim(&self) -> usize;
}

impl<F: LogpFunc + ?Sized> LogpFunc for &mut F {
    type LogpError = F::LogpError;

    fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
        (**self).logp(position, grad)
    }

    fn logp_value(&mut self, position: &[f64]) -> Result<f64, Self::LogpError> {
        (**self).logp_value(position)
    }

    fn dim(&self) -> usize {
        (**self).dim()
    }
}
