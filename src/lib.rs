//! Bayesian generalized linear mixed models from R-style formulas.
//!
//! A [`Model`] is built from a [`Formula`] and a [`DataFrame`]. The family
//! and link determine the likelihood, priors default to weakly informative
//! values scaled from the data and can be replaced term by term. Fitting
//! goes through a [`Backend`], [`NutsBackend`] by default, and yields an
//! [`InferenceData`] with draws indexed by chain and draw. The
//! [`LaplaceBackend`] is a faster approximation for models whose
//! coefficients are all common.
//!
//! ```ignore
//! use bayes_formula::{interpret, FitSettings, Model};
//!
//! let model = Model::new("y ~ x + (1 | g)", data)?;
//! let settings = FitSettings { num_draws: 500, seed: 42, ..Default::default() };
//! let idata = model.fit(&settings)?;
//! let summary =
//!     interpret::predictions(&model, &idata, &"x".into(), &Default::default(), &mut rng)?;
//! ```

pub mod backend;
pub(crate) mod components;
pub mod data;
pub mod dims;
pub mod draws;
mod error;
pub mod families;
pub mod formula;
pub mod interpret;
mod model;
pub mod priors;
pub(crate) mod terms;

pub use backend::{Backend, FitSettings, LaplaceBackend, Method, ModelSpec, NutsBackend};
pub use components::{ComponentKind, ConstantComponent, DistributionalComponent};
pub use data::{Column, DataFrame, Value};
pub use draws::{Dataset, InferenceData};
pub use error::{DataError, FormulaError, ModelError, Result};
pub use families::{Family, Link, LinkSpec};
pub use formula::Formula;
pub use model::{Aliases, FamilySpec, Model, ModelOptions, PredictionKind};
pub use priors::{Prior, PriorArg, PriorSpec};
pub use terms::Term;
