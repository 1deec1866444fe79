use std::{error::Error, fmt::Debug};

pub use nuts_rs::LogpError;
use thiserror::Error;

use crate::backend::Layout;

/// A log density on the unconstrained space.
pub trait LogpFunc {
    type LogpError: Debug + Send + Sync + Error + LogpError + 'static;

    fn dim(&self) -> usize;
    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError>;
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DensityError {
    #[error("Log density is not finite")]
    NonFinite,
    #[error("Could not evaluate the log density: {0}")]
    Model(String),
    #[error("Transformed sampling is not supported by this density")]
    Unsupported,
}

impl LogpError for DensityError {
    fn is_recoverable(&self) -> bool {
        matches!(self, DensityError::NonFinite)
    }
}

/// The joint log density of a [`Layout`], with central difference
/// gradients.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutDensity<'a> {
    layout: &'a Layout,
}

impl<'a> LayoutDensity<'a> {
    pub(crate) fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    pub(crate) fn layout(&self) -> &'a Layout {
        self.layout
    }
}

fn evaluate(layout: &Layout, position: &[f64]) -> Result<f64, DensityError> {
    match layout.log_density(position) {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(_) => Err(DensityError::NonFinite),
        Err(err) => Err(DensityError::Model(err.to_string())),
    }
}

impl LogpFunc for LayoutDensity<'_> {
    type LogpError = DensityError;

    fn dim(&self) -> usize {
        self.layout.dim()
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        let layout = self.layout;
        let mut f = |x: &[f64]| evaluate(layout, x);
        let value = f(position)?;
        central_gradient(&mut f, position, gradient)?;
        Ok(value)
    }
}

const STEP: f64 = 1e-5;

/// Central difference gradient of `f` at `position`.
pub(crate) fn central_gradient<E>(
    f: &mut impl FnMut(&[f64]) -> Result<f64, E>,
    position: &[f64],
    gradient: &mut [f64],
) -> Result<(), E> {
    let mut x = position.to_vec();
    for i in 0..x.len() {
        let h = STEP * (1.0 + position[i].abs());
        x[i] = position[i] + h;
        let up = f(&x)?;
        x[i] = position[i] - h;
        let down = f(&x)?;
        x[i] = position[i];
        gradient[i] = (up - down) / (2.0 * h);
    }
    Ok(())
}

/// Hessian from central differences of the gradient, symmetrised.
pub(crate) fn hessian<F: LogpFunc>(
    func: &mut F,
    position: &[f64],
) -> Result<Vec<Vec<f64>>, F::LogpError> {
    let n = func.dim();
    let mut out = vec![vec![0.0; n]; n];
    let mut x = position.to_vec();
    let mut up = vec![0.0; n];
    let mut down = vec![0.0; n];
    for i in 0..n {
        let h = 1e-4 * (1.0 + position[i].abs());
        x[i] = position[i] + h;
        func.logp(&x, &mut up)?;
        x[i] = position[i] - h;
        func.logp(&x, &mut down)?;
        x[i] = position[i];
        for j in 0..n {
            out[i][j] = (up[j] - down[j]) / (2.0 * h);
        }
    }
    for i in 0..n {
        for j in 0..i {
            let mean = 0.5 * (out[i][j] + out[j][i]);
            out[i][j] = mean;
            out[j][i] = mean;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct NormalLogp {
        mu: Vec<f64>,
    }

    impl LogpFunc for NormalLogp {
        type LogpError = DensityError;

        fn dim(&self) -> usize {
            self.mu.len()
        }

        fn logp(&mut self, position: &[f64], grad: &mut [f64]) -> Result<f64, Self::LogpError> {
            let mut logp = 0f64;
            position
                .iter()
                .zip(self.mu.iter())
                .zip(grad.iter_mut())
                .for_each(|((&p, &mu), grad)| {
                    let diff = p - mu;
                    logp -= diff * diff / 2.;
                    *grad = -diff;
                });
            Ok(logp)
        }
    }

    #[test]
    fn central_differences_match_the_analytic_gradient() {
        let mut f = |x: &[f64]| -> Result<f64, DensityError> {
            Ok(-(x[0] - 1.0).powi(2) - 3.0 * x[1] * x[0])
        };
        let mut grad = vec![0.0; 2];
        central_gradient(&mut f, &[0.5, 2.0], &mut grad).unwrap();
        assert_relative_eq!(grad[0], -2.0 * (0.5 - 1.0) - 6.0, epsilon = 1e-6);
        assert_relative_eq!(grad[1], -1.5, epsilon = 1e-6);
    }

    #[test]
    fn hessian_of_standard_normal_is_minus_identity() {
        let mut func = NormalLogp { mu: vec![1.0, -2.0, 0.5] };
        let h = hessian(&mut func, &[0.0, 0.0, 0.0]).unwrap();
        for (i, row) in h.iter().enumerate() {
            for (j, &value) in row.iter().enumerate() {
                let expected = if i == j { -1.0 } else { 0.0 };
                assert_relative_eq!(value, expected, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn only_non_finite_values_are_recoverable() {
        assert!(DensityError::NonFinite.is_recoverable());
        assert!(!DensityError::Model("bad".into()).is_recoverable());
        assert!(!DensityError::Unsupported.is_recoverable());
    }
}
