//! Flattens a [`ModelSpec`] into one unconstrained vector and evaluates the
//! joint log density on it.
//!
//! Free variables own a slice of the vector and a transform onto the
//! support of their prior. Derived variables (non-centered group effects,
//! HSGP weights) are deterministic functions of free ones and are computed
//! after them, in declaration order.

use ndarray::ArrayD;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::backend::{BlockKind, ModelSpec, PredictorSpec};
use crate::dims::{DataArray, Dim};
use crate::draws::Dataset;
use crate::error::{ModelError, Result};
use crate::families::{expit, observation, Link};
use crate::priors::{normal_lpdf, Density, Prior, PriorArg, PriorSpec, Support};
use crate::terms::Covariance;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Transform {
    Identity,
    Log,
    Interval(f64, f64),
}

impl Transform {
    fn from_support(support: Support) -> Self {
        match support {
            Support::Real => Transform::Identity,
            Support::Positive => Transform::Log,
            Support::Interval(lo, hi) => Transform::Interval(lo, hi),
        }
    }

    /// Constrained value and log absolute jacobian.
    fn forward(&self, z: f64) -> (f64, f64) {
        match *self {
            Transform::Identity => (z, 0.0),
            Transform::Log => (z.exp(), z),
            Transform::Interval(lo, hi) => {
                let p = expit(z);
                let log_jac = (hi - lo).ln() - z.abs() - 2.0 * (-z.abs()).exp().ln_1p();
                (lo + (hi - lo) * p, log_jac)
            }
        }
    }

    fn backward(&self, x: f64) -> f64 {
        match *self {
            Transform::Identity => x,
            Transform::Log => x.ln(),
            Transform::Interval(lo, hi) => {
                let p = (x - lo) / (hi - lo);
                (p / (1.0 - p)).ln()
            }
        }
    }
}

/// A scalar argument that is either fixed or another variable.
#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Fixed(f64),
    Var(usize),
}

impl Arg {
    fn value(&self, values: &[Vec<f64>], idx: usize) -> f64 {
        match self {
            Arg::Fixed(x) => *x,
            Arg::Var(var) => {
                let v = &values[*var];
                v.get(idx).or_else(|| v.first()).copied().unwrap_or(f64::NAN)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum FreePrior {
    /// Element `i` uses column `i / per` of vector arguments.
    Density { prior: Prior, per: usize },
    /// Group effects in (expr, group, level) order. Hyperprior arguments
    /// are read from the (expr, level) element of their variable.
    Hierarchical {
        prior: Prior,
        hypers: Vec<(String, usize)>,
        n_groups: usize,
        n_levels: usize,
    },
    StdNormal,
    HsgpWeights(HsgpScales),
}

#[derive(Debug, Clone, PartialEq)]
struct HsgpScales {
    sigma: Arg,
    ell: Arg,
    frequencies: Vec<f64>,
    cov: Covariance,
    n_levels: usize,
}

impl HsgpScales {
    fn scale(&self, values: &[Vec<f64>], idx: usize) -> f64 {
        let j = idx / self.n_levels;
        let sigma = self.sigma.value(values, 0);
        let ell = self.ell.value(values, 0);
        sigma * self.cov.power_spectral_density(self.frequencies[j], ell).sqrt()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum VarKind {
    Free {
        start: usize,
        transform: Transform,
        prior: FreePrior,
    },
    /// `mu + sigma * offset` over (expr, group, level).
    NonCentered {
        mu: Vec<Arg>,
        sigma: usize,
        offset: usize,
        n_groups: usize,
        n_levels: usize,
    },
    /// `raw * scale`, the non-centered HSGP weights.
    ScaledWeights { raw: usize, scales: HsgpScales },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Variable {
    name: String,
    dims: Vec<(Dim, Vec<String>)>,
    size: usize,
    kind: VarKind,
}

impl Variable {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

/// Where the coefficients of a design block come from.
#[derive(Debug, Clone, PartialEq)]
struct Block {
    var: usize,
    design: ndarray::Array2<f64>,
}

#[derive(Debug, Clone, PartialEq)]
struct Predictor {
    param: String,
    link: Link,
    offset: Vec<f64>,
    blocks: Vec<Block>,
}

/// Where each parameter of the likelihood comes from.
#[derive(Debug, Clone, PartialEq)]
enum ParamSource {
    Predictor(usize),
    Constant(Arg),
}

/// The flattened model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Layout {
    spec: ModelSpec,
    vars: Vec<Variable>,
    predictors: Vec<Predictor>,
    params: Vec<ParamSource>,
    dim: usize,
}

impl Layout {
    pub(crate) fn new(spec: &ModelSpec) -> Result<Self> {
        let mut builder = Builder {
            vars: Vec::new(),
            dim: 0,
            n_levels: spec.n_levels(),
            levels: spec.levels.clone(),
        };
        let mut predictors = Vec::new();
        for p in &spec.predictors {
            predictors.push(builder.predictor(p, spec.noncentered)?);
        }

        let mut constants = Vec::new();
        for c in &spec.constants {
            let arg = match &c.prior {
                PriorSpec::Constant(x) => Arg::Fixed(*x),
                PriorSpec::Prior(prior) => {
                    Arg::Var(builder.free(&c.name, vec![], 1, prior.clone(), 1)?)
                }
            };
            constants.push((c.param.clone(), arg));
        }

        let params = spec
            .family
            .likelihood()
            .params()
            .iter()
            .map(|param| {
                if let Some(idx) = predictors.iter().position(|p| p.param == *param) {
                    return Ok(ParamSource::Predictor(idx));
                }
                constants
                    .iter()
                    .find(|(p, _)| p == param)
                    .map(|(_, arg)| ParamSource::Constant(arg.clone()))
                    .ok_or_else(|| {
                        ModelError::MissingPrior(format!("{}_{}", spec.response_name, param))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        log::debug!(
            "Model with {} free dimensions and {} variables",
            builder.dim,
            builder.vars.len()
        );
        Ok(Self {
            spec: spec.clone(),
            vars: builder.vars,
            predictors,
            params,
            dim: builder.dim,
        })
    }

    pub(crate) fn dim(&self) -> usize {
        self.dim
    }

    pub(crate) fn variables(&self) -> &[Variable] {
        &self.vars
    }

    /// Values of every variable on the constrained scale and the log
    /// jacobian of the transforms.
    pub(crate) fn constrain(&self, position: &[f64]) -> (Vec<Vec<f64>>, f64) {
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(self.vars.len());
        let mut log_jac = 0.0;
        for var in &self.vars {
            let v = match &var.kind {
                VarKind::Free { start, transform, .. } => position[*start..*start + var.size]
                    .iter()
                    .map(|&z| {
                        let (x, j) = transform.forward(z);
                        log_jac += j;
                        x
                    })
                    .collect(),
                VarKind::NonCentered {
                    mu,
                    sigma,
                    offset,
                    n_groups,
                    n_levels,
                } => (0..var.size)
                    .map(|i| {
                        let e = i / (n_groups * n_levels);
                        let h = e * n_levels + i % n_levels;
                        let mu = mu[e.min(mu.len().saturating_sub(1))].value(&values, h);
                        mu + values[*sigma][h] * values[*offset][i]
                    })
                    .collect(),
                VarKind::ScaledWeights { raw, scales } => (0..var.size)
                    .map(|i| values[*raw][i] * scales.scale(&values, i))
                    .collect(),
            };
            values.push(v);
        }
        (values, log_jac)
    }

    /// Unconstrained position of constrained free values.
    pub(crate) fn unconstrain(&self, values: &[Vec<f64>]) -> Vec<f64> {
        let mut position = vec![0.0; self.dim];
        for (var, v) in self.vars.iter().zip(values) {
            if let VarKind::Free { start, transform, .. } = &var.kind {
                for (slot, &x) in position[*start..*start + var.size].iter_mut().zip(v) {
                    *slot = transform.backward(x);
                }
            }
        }
        position
    }

    pub(crate) fn log_prior(&self, values: &[Vec<f64>]) -> Result<f64> {
        let mut total = 0.0;
        for (var, v) in self.vars.iter().zip(values) {
            let VarKind::Free { prior, .. } = &var.kind else {
                continue;
            };
            for (i, &x) in v.iter().enumerate() {
                total += match prior {
                    FreePrior::HsgpWeights(scales) => normal_lpdf(x, 0.0, scales.scale(values, i)),
                    _ => match element_density(prior, values, i)? {
                        Some(density) => density.log_density(x)?,
                        None => normal_lpdf(x, 0.0, 1.0),
                    },
                };
            }
        }
        Ok(total)
    }

    /// Linear predictor of every predictor, (observations, levels)
    /// flattened row major.
    fn linear_predictors(&self, values: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let n_levels = self.spec.n_levels();
        self.predictors
            .iter()
            .map(|p| {
                let n = p.offset.len();
                let mut eta = vec![0.0; n * n_levels];
                for (i, offset) in p.offset.iter().enumerate() {
                    for l in 0..n_levels {
                        eta[i * n_levels + l] = *offset;
                    }
                }
                for block in &p.blocks {
                    let coefs = &values[block.var];
                    for (i, row) in block.design.rows().into_iter().enumerate() {
                        for (k, &x) in row.iter().enumerate() {
                            if x == 0.0 {
                                continue;
                            }
                            for l in 0..n_levels {
                                eta[i * n_levels + l] += x * coefs[k * n_levels + l];
                            }
                        }
                    }
                }
                eta
            })
            .collect()
    }

    pub(crate) fn log_likelihood(&self, values: &[Vec<f64>]) -> Result<f64> {
        let etas = self.linear_predictors(values);
        let family = &self.spec.family;
        let name = family.likelihood().name();
        let observed = &self.spec.observed;
        let n = observed.nrows();

        if family.is_multivariate() {
            let eta = &etas[0];
            let link = self.predictors[0].link;
            let n_levels = self.spec.n_levels();
            let mut total = 0.0;
            let mut probs = vec![0.0; n_levels + 1];
            for i in 0..n {
                probs[0] = 0.0;
                probs[1..].copy_from_slice(&eta[i * n_levels..(i + 1) * n_levels]);
                link.linkinv_slice(&mut probs);
                total += match name {
                    "Multinomial" => {
                        let counts: Vec<f64> = observed.row(i).to_vec();
                        observation::multinomial_log_likelihood(&counts, &probs)
                    }
                    _ => observation::categorical_log_likelihood(observed[(i, 0)] as usize, &probs),
                };
            }
            return Ok(total);
        }

        let mut params = vec![0.0; self.params.len()];
        let mut total = 0.0;
        for i in 0..n {
            for (slot, source) in params.iter_mut().zip(&self.params) {
                *slot = match source {
                    ParamSource::Predictor(p) => self.predictors[*p].link.linkinv(etas[*p][i]),
                    ParamSource::Constant(arg) => arg.value(values, 0),
                };
            }
            let trials = self.spec.trials.as_ref().map_or(0.0, |t| t[i]);
            total += observation::log_likelihood(name, observed[(i, 0)], trials, &params)?;
        }
        Ok(total)
    }

    /// Joint log density on the unconstrained space.
    pub(crate) fn log_density(&self, position: &[f64]) -> Result<f64> {
        let (values, log_jac) = self.constrain(position);
        Ok(self.log_prior(&values)? + self.log_likelihood(&values)? + log_jac)
    }

    /// A draw of every variable from the priors.
    pub(crate) fn sample_prior<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Vec<Vec<f64>>> {
        let mut values: Vec<Vec<f64>> = Vec::with_capacity(self.vars.len());
        for var in &self.vars {
            let v = match &var.kind {
                VarKind::Free { prior, .. } => (0..var.size)
                    .map(|i| match prior {
                        FreePrior::HsgpWeights(scales) => {
                            let z: f64 = StandardNormal.sample(rng);
                            Ok(z * scales.scale(&values, i))
                        }
                        _ => match element_density(prior, &values, i)? {
                            Some(density) => density.sample(rng),
                            None => Ok(StandardNormal.sample(rng)),
                        },
                    })
                    .collect::<Result<Vec<f64>>>()?,
                VarKind::NonCentered { .. } | VarKind::ScaledWeights { .. } => Vec::new(),
            };
            values.push(v);
        }
        // derived variables from the sampled free ones
        let position = self.unconstrain(&values);
        Ok(self.constrain(&position).0)
    }

    /// Collects draws of every variable into arrays with (chain, draw)
    /// leading dims.
    pub(crate) fn to_dataset(&self, draws: &[Vec<Vec<Vec<f64>>>]) -> Result<Dataset> {
        let chains = draws.len();
        let n_draws = draws.first().map_or(0, Vec::len);
        let mut dataset = Dataset::new();
        for (k, var) in self.vars.iter().enumerate() {
            let mut shape = vec![chains, n_draws];
            let mut dims = vec![Dim::chain(), Dim::draw()];
            for (dim, labels) in &var.dims {
                shape.push(labels.len());
                dims.push(dim.clone());
            }
            let flat: Vec<f64> = draws
                .iter()
                .flat_map(|chain| chain.iter().flat_map(move |draw| draw[k].iter().copied()))
                .collect();
            let values = ArrayD::from_shape_vec(shape, flat).map_err(|e| ModelError::Dimension {
                name: var.name.clone(),
                reason: e.to_string(),
            })?;
            let mut array = DataArray::new(dims, values)?;
            for (dim, labels) in &var.dims {
                array = array.with_coords(dim, labels.clone())?;
            }
            dataset.insert(var.name.clone(), array);
        }
        Ok(dataset)
    }
}

/// The density of element `i` of a free variable. `None` for standard
/// normal variables.
fn element_density(prior: &FreePrior, values: &[Vec<f64>], i: usize) -> Result<Option<Density>> {
    let density = match prior {
        FreePrior::Density { prior, per } => Density::resolve(prior, i / per, &|_, _| None)?,
        FreePrior::Hierarchical {
            prior,
            hypers,
            n_groups,
            n_levels,
        } => {
            let e = i / (n_groups * n_levels);
            let h = e * n_levels + i % n_levels;
            let lookup = |key: &str, _: usize| {
                hypers
                    .iter()
                    .find(|(k, _)| k == key)
                    .and_then(|(_, var)| values.get(*var))
                    .and_then(|v| v.get(h).or_else(|| v.first()).copied())
            };
            Density::resolve(prior, e, &lookup)?
        }
        FreePrior::StdNormal | FreePrior::HsgpWeights(_) => return Ok(None),
    };
    Ok(Some(density))
}

struct Builder {
    vars: Vec<Variable>,
    dim: usize,
    n_levels: usize,
    levels: Option<(Dim, Vec<String>)>,
}

impl Builder {
    fn with_levels(&self, mut dims: Vec<(Dim, Vec<String>)>) -> Vec<(Dim, Vec<String>)> {
        if let Some(levels) = &self.levels {
            dims.push(levels.clone());
        }
        dims
    }

    fn push(
        &mut self,
        name: &str,
        dims: Vec<(Dim, Vec<String>)>,
        size: usize,
        kind: VarKind,
    ) -> usize {
        self.vars.push(Variable {
            name: name.to_string(),
            dims,
            size,
            kind,
        });
        self.vars.len() - 1
    }

    fn push_free(
        &mut self,
        name: &str,
        dims: Vec<(Dim, Vec<String>)>,
        size: usize,
        transform: Transform,
        prior: FreePrior,
    ) -> usize {
        let start = self.dim;
        self.dim += size;
        self.push(
            name,
            dims,
            size,
            VarKind::Free {
                start,
                transform,
                prior,
            },
        )
    }

    /// A variable with a prior without hyperpriors.
    fn free(
        &mut self,
        name: &str,
        dims: Vec<(Dim, Vec<String>)>,
        size: usize,
        prior: Prior,
        per: usize,
    ) -> Result<usize> {
        let transform = Transform::from_support(support(&prior)?);
        Ok(self.push_free(name, dims, size, transform, FreePrior::Density { prior, per }))
    }

    fn predictor(&mut self, spec: &PredictorSpec, noncentered: bool) -> Result<Predictor> {
        let mut blocks = Vec::with_capacity(spec.blocks.len());
        for block in &spec.blocks {
            let var = match &block.kind {
                BlockKind::Common(prior) => {
                    let dims = self.with_levels(block.dims.clone());
                    let size = block.ncols() * self.n_levels;
                    self.free(&block.name, dims, size, prior.clone(), self.n_levels)?
                }
                BlockKind::GroupSpecific {
                    prior,
                    n_expr,
                    n_groups,
                    factor,
                } => self.group_specific(
                    &block.name,
                    &block.dims,
                    prior,
                    *n_expr,
                    *n_groups,
                    factor,
                    noncentered,
                )?,
                BlockKind::Hsgp {
                    sigma,
                    ell,
                    frequencies,
                    cov,
                    centered,
                } => {
                    let sigma = self.constant_or_free(&format!("{}_sigma", block.name), sigma)?;
                    let ell = self.constant_or_free(&format!("{}_ell", block.name), ell)?;
                    let scales = HsgpScales {
                        sigma,
                        ell,
                        frequencies: frequencies.clone(),
                        cov: *cov,
                        n_levels: self.n_levels,
                    };
                    let dims = self.with_levels(block.dims.clone());
                    let size = frequencies.len() * self.n_levels;
                    let weights = format!("{}_weights", block.name);
                    if *centered {
                        let prior = FreePrior::HsgpWeights(scales);
                        self.push_free(&weights, dims, size, Transform::Identity, prior)
                    } else {
                        let raw = self.push_free(
                            &format!("{}_weights_raw", block.name),
                            dims.clone(),
                            size,
                            Transform::Identity,
                            FreePrior::StdNormal,
                        );
                        self.push(&weights, dims, size, VarKind::ScaledWeights { raw, scales })
                    }
                }
            };
            blocks.push(Block {
                var,
                design: block.design.clone(),
            });
        }
        Ok(Predictor {
            param: spec.param.clone(),
            link: spec.link,
            offset: spec.offset.clone(),
            blocks,
        })
    }

    fn constant_or_free(&mut self, name: &str, prior: &PriorSpec) -> Result<Arg> {
        Ok(match prior {
            PriorSpec::Constant(x) => Arg::Fixed(*x),
            PriorSpec::Prior(prior) => Arg::Var(self.free(name, vec![], 1, prior.clone(), 1)?),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn group_specific(
        &mut self,
        name: &str,
        dims: &[(Dim, Vec<String>)],
        prior: &Prior,
        n_expr: usize,
        n_groups: usize,
        factor: &Dim,
        noncentered: bool,
    ) -> Result<usize> {
        let n_levels = self.n_levels;
        // hyperparameters have the dims of the term without the groups
        let hyper_dims =
            self.with_levels(dims.iter().filter(|(d, _)| d != factor).cloned().collect());
        let hyper_size = n_expr * n_levels;
        let mut hypers = Vec::new();
        for (key, arg) in prior.args() {
            if let PriorArg::Prior(hyper) = arg {
                if hyper.has_hyperprior() {
                    return Err(ModelError::InvalidPrior(format!("{name}_{key}")));
                }
                let var = self.free(
                    &format!("{name}_{key}"),
                    hyper_dims.clone(),
                    hyper_size,
                    (**hyper).clone(),
                    n_levels,
                )?;
                hypers.push((key.clone(), var));
            }
        }
        let dims = self.with_levels(dims.to_vec());
        let size = n_expr * n_groups * n_levels;
        let sigma = hypers.iter().find(|(k, _)| k == "sigma").map(|(_, v)| *v);

        match sigma {
            Some(sigma) if noncentered && prior.name() == "Normal" => {
                let mu = match prior.arg("mu") {
                    None => vec![Arg::Fixed(0.0)],
                    Some(PriorArg::Scalar(x)) => vec![Arg::Fixed(*x)],
                    Some(PriorArg::Vector(v)) => v.iter().map(|x| Arg::Fixed(*x)).collect(),
                    Some(PriorArg::Prior(_)) => {
                        let var = hypers
                            .iter()
                            .find(|(k, _)| k == "mu")
                            .map(|(_, v)| *v)
                            .ok_or_else(|| ModelError::InvalidPrior(format!("{name}_mu")))?;
                        vec![Arg::Var(var)]
                    }
                };
                let offset = self.push_free(
                    &format!("{name}_offset"),
                    dims.clone(),
                    size,
                    Transform::Identity,
                    FreePrior::StdNormal,
                );
                Ok(self.push(
                    name,
                    dims,
                    size,
                    VarKind::NonCentered {
                        mu,
                        sigma,
                        offset,
                        n_groups,
                        n_levels,
                    },
                ))
            }
            _ => {
                let transform = Transform::from_support(support(prior)?);
                Ok(self.push_free(
                    name,
                    dims,
                    size,
                    transform,
                    FreePrior::Hierarchical {
                        prior: prior.clone(),
                        hypers,
                        n_groups,
                        n_levels,
                    },
                ))
            }
        }
    }
}

fn support(prior: &Prior) -> Result<Support> {
    crate::priors::support_of(prior.name(), &|key| prior.scalar(key))
}
