use thiserror::Error;

/// Errors raised while parsing a formula or evaluating its design matrices.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Could not parse formula '{formula}': {reason}")]
    Parse { formula: String, reason: String },
    #[error("Unsupported function call '{0}' in formula")]
    UnknownFunction(String),
    #[error("Variable '{0}' was not found in the data")]
    UnknownVariable(String),
    #[error("Level '{level}' of '{variable}' was not observed when the model was built")]
    UnknownLevel { variable: String, level: String },
    #[error("The formula for '{0}' needs a left-hand side")]
    MissingResponse(String),
    #[error("Response '{0}' must be numeric")]
    NonNumericResponse(String),
    #[error("Invalid argument '{argument}' in '{call}': {reason}")]
    InvalidArgument {
        call: String,
        argument: String,
        reason: String,
    },
}

/// Errors raised while accessing or converting tabular data.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Column '{0}' not found")]
    MissingColumn(String),
    #[error("Column '{name}' has {found} rows but {expected} were expected")]
    LengthMismatch {
        name: String,
        expected: usize,
        found: usize,
    },
    #[error("Column '{0}' must be numeric")]
    NotNumeric(String),
    #[error("Column '{0}' contains missing values")]
    MissingValues(String),
    #[error("Column '{name}' has unsupported type {dtype}")]
    UnsupportedType { name: String, dtype: String },
    #[error("Column '{0}' is empty")]
    Empty(String),
    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

/// Errors raised while specifying, fitting or interpreting a model.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("'{value}' does not match the parameters of '{name}'")]
    LikelihoodParams { value: String, name: String },
    #[error("'{value}' is not a valid parameter for the likelihood '{name}'")]
    LikelihoodParent { value: String, name: String },
    #[error("'{value}' must be one of {params}")]
    UnknownParent { value: String, params: String },
    #[error("The likelihood '{0}' is not built in, its parameters must be given")]
    MissingLikelihoodParams(String),
    #[error("Link '{link}' cannot be used for '{param}' with family '{family}'")]
    UnsupportedLink {
        link: String,
        param: String,
        family: String,
    },
    #[error("Link name '{0}' is not supported.")]
    UnknownLink(String),
    #[error("'{0}' is not a supported family name")]
    UnknownFamily(String),
    #[error("'{param}' is not a parameter of the family '{family}'")]
    UnknownParameter { param: String, family: String },
    #[error("The component '{0}' needs a prior.")]
    MissingPrior(String),
    #[error("'{0}' is not a valid prior.")]
    InvalidPrior(String),
    #[error("Trying to set hyperprior on '{0}'. Can't set a hyperprior on common effects.")]
    HyperpriorOnCommon(String),
    #[error("No term named '{0}' in the model")]
    TermNotFound(String),
    #[error("Index notation for response is only available for 'bernoulli' family")]
    IndexNotation,
    #[error("Categoric response must be binary for 'bernoulli' family.")]
    CategoricBernoulli,
    #[error("Numeric response must be all 0 and 1 for 'bernoulli' family.")]
    NumericBernoulli,
    #[error("The response of the '{family}' family must be {expected}")]
    ResponseKind { family: String, expected: String },
    #[error("The design matrix is not full rank, '{0}' is a linear combination of previous terms")]
    RankDeficient(String),
    #[error("Variable '{0}' was not found in the posterior draws")]
    MissingDraws(String),
    #[error("Dimension mismatch for '{name}': {reason}")]
    Dimension { name: String, reason: String },
    #[error("'prob' must be greater than 0 and smaller than 1. It is {0}.")]
    Probability(f64),
    #[error("Only one contrast predictor can be passed. {0} were passed.")]
    TooManyContrasts(usize),
    #[error("'comparison_type' must be 'diff' or 'ratio'")]
    ComparisonType(String),
    #[error("'slope' must be one of ('dydx', 'dyex', 'eyex', 'eydx')")]
    SlopeType(String),
    #[error("If a value is passed with 'wrt', then 'conditional' cannot be 'None'.")]
    WrtWithoutConditional,
    #[error("Only one predictor can be passed to 'wrt'. {0} were passed.")]
    TooManyWrt(usize),
    #[error("When passing 'pps=True', target must be 'mean'")]
    PpsTarget,
    #[error("Between one and three covariates can be passed. {0} were passed.")]
    CovariateCount(usize),
    #[error("'{0}' is not a covariate of the model")]
    NotACovariate(String),
    #[error("Could not sample from '{name}': {reason}")]
    Sampling { name: String, reason: String },
    #[error("Removing missing values left no observations")]
    NoObservations,
    #[error(transparent)]
    Formula(#[from] FormulaError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("Backend failure: {0:#}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
