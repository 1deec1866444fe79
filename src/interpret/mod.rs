//! Interpretation of fitted models on grids of covariate values.
//!
//! [`predictions`] summarizes the response on a grid, [`comparisons`]
//! contrasts it between values of one covariate and [`slopes`] takes its
//! derivative with respect to one covariate. Each returns a [`DataFrame`]
//! with the covariate values, the `estimate` and the bounds of a credible
//! interval.
//!
//! [`DataFrame`]: crate::data::DataFrame

mod create_data;
mod effects;
mod stats;
mod utils;

pub use effects::{
    comparisons, predictions, slopes, ComparisonType, ComparisonsOptions, PredictionsOptions,
    SlopeType, SlopesOptions, Transform,
};
pub use stats::{hdi, quantile_interval};
pub use utils::{AverageBy, Conditional, VariableSpec};
