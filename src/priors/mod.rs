//! Prior distributions, their default values and the automatic scaling of
//! default priors.

mod density;
mod prior;
mod scaler;

pub use density::{support_of, Density, Support, KNOWN_DISTRIBUTIONS};
pub(crate) use density::{normal_lpdf, student_t_lpdf};
pub use prior::{Prior, PriorArg};
pub use scaler::PriorScaler;

use std::fmt;

/// What a parameter of the likelihood or a term can be given: a prior
/// distribution or a fixed value.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorSpec {
    Prior(Prior),
    Constant(f64),
}

impl PriorSpec {
    pub fn as_prior(&self) -> Option<&Prior> {
        match self {
            PriorSpec::Prior(p) => Some(p),
            PriorSpec::Constant(_) => None,
        }
    }
}

impl From<Prior> for PriorSpec {
    fn from(value: Prior) -> Self {
        PriorSpec::Prior(value)
    }
}

impl From<f64> for PriorSpec {
    fn from(value: f64) -> Self {
        PriorSpec::Constant(value)
    }
}

impl fmt::Display for PriorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriorSpec::Prior(p) => write!(f, "{}", p),
            PriorSpec::Constant(x) => write!(f, "{}", x),
        }
    }
}

/// Default prior for the intercept and the common terms. Without automatic
/// scaling the default is improper.
pub fn default_common(auto_scale: bool) -> Prior {
    if auto_scale {
        Prior::new("Normal").with("mu", 0.0).with("sigma", 1.0)
    } else {
        Prior::new("Flat")
    }
}

pub fn default_group_specific() -> Prior {
    Prior::new("Normal")
        .with("mu", 0.0)
        .with("sigma", Prior::new("HalfNormal").with("sigma", 1.0))
}

/// Defaults for the covariance parameters of an HSGP term.
pub fn default_hsgp() -> Vec<(String, PriorSpec)> {
    vec![
        (
            "sigma".to_string(),
            Prior::new("HalfNormal").with("sigma", 1.0).into(),
        ),
        (
            "ell".to_string(),
            Prior::new("InverseGamma")
                .with("alpha", 3.0)
                .with("beta", 1.0)
                .into(),
        ),
    ]
}
