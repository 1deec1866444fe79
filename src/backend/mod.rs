//! The seam between model specification and inference.
//!
//! A [`ModelSpec`] is the compiled, backend neutral description of a built
//! model: every block of coefficients with its prior, dims and design
//! matrix, the likelihood and the observed data. A [`Backend`] turns it
//! into posterior draws.

mod laplace;
mod layout;
mod logp;
mod nuts;

pub use laplace::LaplaceBackend;
pub use logp::{DensityError, LogpError, LogpFunc};
pub use nuts::NutsBackend;
pub(crate) use layout::Layout;

use ndarray::Array2;

use crate::components::{ConstantComponent, DistributionalComponent};
use crate::dims::Dim;
use crate::draws::InferenceData;
use crate::error::{ModelError, Result};
use crate::families::{Family, Link};
use crate::priors::{Prior, PriorSpec};
use crate::terms::{Covariance, Term};

/// The backend [`Model::fit`](crate::Model::fit) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Markov chain Monte Carlo with [`NutsBackend`].
    #[default]
    Nuts,
    /// [`LaplaceBackend`], for models without group specific or HSGP terms.
    Laplace,
}

/// Options of [`Backend::run`].
#[derive(Debug, Clone, Copy)]
pub struct FitSettings {
    pub method: Method,
    /// Draws per chain used to adapt the sampler, then discarded.
    pub num_tune: u64,
    /// Draws per chain
    pub num_draws: u64,
    pub num_chains: u64,
    /// Chains share the seed and use one random stream each.
    pub seed: u64,
    /// Newton iterations when searching for the mode.
    pub max_iterations: u64,
    pub tolerance: f64,
    /// Add the mean of the response to the posterior after fitting.
    pub include_mean: bool,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            method: Method::Nuts,
            num_tune: 1000,
            num_draws: 1000,
            num_chains: 2,
            seed: 0,
            max_iterations: 200,
            tolerance: 1e-6,
            include_mean: false,
        }
    }
}

/// Something that can compile a [`ModelSpec`] and draw from its posterior.
pub trait Backend {
    fn build(&mut self, spec: &ModelSpec) -> anyhow::Result<()>;
    fn run(&mut self, settings: &FitSettings) -> anyhow::Result<InferenceData>;
}

/// How the coefficients of a block are distributed.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Common(Prior),
    /// `n_expr * n_groups` coefficients, hyperpriors are shared by groups.
    GroupSpecific {
        prior: Prior,
        n_expr: usize,
        n_groups: usize,
        factor: Dim,
    },
    Hsgp {
        sigma: PriorSpec,
        ell: PriorSpec,
        frequencies: Vec<f64>,
        cov: Covariance,
        centered: bool,
    },
}

/// A block of coefficients and the columns of the design matrix they
/// multiply.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub name: String,
    /// Dims besides chain, draw and response levels, with labels.
    pub dims: Vec<(Dim, Vec<String>)>,
    pub design: Array2<f64>,
    pub kind: BlockKind,
}

impl BlockSpec {
    pub fn ncols(&self) -> usize {
        self.design.ncols()
    }
}

/// The linear predictor of one parameter of the likelihood.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorSpec {
    pub param: String,
    pub link: Link,
    pub offset: Vec<f64>,
    pub blocks: Vec<BlockSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantSpec {
    pub param: String,
    pub name: String,
    pub prior: PriorSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub response_name: String,
    pub family: Family,
    /// (observations, 1), or counts by level for multinomial responses.
    pub observed: Array2<f64>,
    pub trials: Option<Vec<f64>>,
    /// Modelled levels of a multivariate response, and their dim.
    pub levels: Option<(Dim, Vec<String>)>,
    pub predictors: Vec<PredictorSpec>,
    pub constants: Vec<ConstantSpec>,
    pub noncentered: bool,
}

impl ModelSpec {
    /// Compiles the components of a built model.
    pub fn new(
        family: &Family,
        response: &DistributionalComponent,
        distributional: &[DistributionalComponent],
        constants: &[ConstantComponent],
        response_name: &str,
        noncentered: bool,
    ) -> Result<Self> {
        let term = response
            .response_term()
            .ok_or_else(|| ModelError::TermNotFound(response.name().to_string()))?;
        let levels = if family.is_multivariate() {
            let all = term.levels().unwrap_or_default();
            Some((Dim::response_levels(response_name), all.iter().skip(1).cloned().collect()))
        } else {
            None
        };

        let mut predictors = vec![predictor(response, family.likelihood().parent(), family)?];
        for component in distributional {
            predictors.push(predictor(component, component.name(), family)?);
        }
        let constants = constants
            .iter()
            .map(|c| ConstantSpec {
                param: c.param().to_string(),
                name: c.var_name().to_string(),
                prior: c.prior().clone(),
            })
            .collect();

        Ok(Self {
            response_name: response_name.to_string(),
            family: family.clone(),
            observed: term.data().to_owned(),
            trials: term.trials(),
            levels,
            predictors,
            constants,
            noncentered,
        })
    }

    pub fn n_obs(&self) -> usize {
        self.observed.nrows()
    }

    pub fn n_levels(&self) -> usize {
        self.levels.as_ref().map_or(1, |(_, labels)| labels.len())
    }
}

fn predictor(
    component: &DistributionalComponent,
    param: &str,
    family: &Family,
) -> Result<PredictorSpec> {
    let n = component.n_obs();
    let mut offset = vec![0.0; n];
    let mut blocks = Vec::new();
    for (_, term) in component.terms() {
        let name = term.var_name();
        let dims = term.coef_dims();
        match term {
            Term::Common(_) => blocks.push(BlockSpec {
                name,
                dims,
                design: term.data().to_owned(),
                kind: BlockKind::Common(resolved_prior(term)?),
            }),
            Term::GroupSpecific(t) => blocks.push(BlockSpec {
                name,
                dims,
                design: t.design().design_matrix(),
                kind: BlockKind::GroupSpecific {
                    prior: resolved_prior(term)?,
                    n_expr: t.n_expr(),
                    n_groups: t.groups().len(),
                    factor: Dim::factor(t.factor()),
                },
            }),
            Term::Offset(_) => {
                for (slot, value) in offset.iter_mut().zip(term.data().column(0)) {
                    *slot += value;
                }
            }
            Term::Hsgp(t) => {
                let prior = |param: &str| {
                    t.prior(param)
                        .cloned()
                        .ok_or_else(|| ModelError::MissingPrior(format!("{name}_{param}")))
                };
                blocks.push(BlockSpec {
                    design: t.training_basis(),
                    kind: BlockKind::Hsgp {
                        sigma: prior("sigma")?,
                        ell: prior("ell")?,
                        frequencies: t.frequencies(),
                        cov: t.covariance(),
                        centered: t.centered(),
                    },
                    name,
                    dims,
                })
            }
            Term::Response(_) => {}
        }
    }
    Ok(PredictorSpec {
        param: param.to_string(),
        link: family.link(param),
        offset,
        blocks,
    })
}

fn resolved_prior(term: &Term) -> Result<Prior> {
    term.prior()
        .cloned()
        .ok_or_else(|| ModelError::MissingPrior(term.name()))
}

#[cfg(test)]
pub(crate) mod test_specs {
    use ndarray::Array2;

    use super::{BlockKind, BlockSpec, ConstantSpec, ModelSpec, PredictorSpec};
    use crate::dims::Dim;
    use crate::families::{Family, Link};
    use crate::priors::{Prior, PriorSpec};

    pub(crate) fn normal_data() -> Vec<f64> {
        (0..25).map(|i| 3.0 + ((i * 7) % 11) as f64 / 5.0 - 1.0).collect()
    }

    fn gaussian(y: &[f64], blocks: Vec<BlockSpec>, sigma: PriorSpec) -> ModelSpec {
        let n = y.len();
        ModelSpec {
            response_name: "y".to_string(),
            family: Family::builtin("gaussian").unwrap(),
            observed: Array2::from_shape_vec((n, 1), y.to_vec()).unwrap(),
            trials: None,
            levels: None,
            predictors: vec![PredictorSpec {
                param: "mu".to_string(),
                link: Link::Identity,
                offset: vec![0.0; n],
                blocks,
            }],
            constants: vec![ConstantSpec {
                param: "sigma".to_string(),
                name: "y_sigma".to_string(),
                prior: sigma,
            }],
            noncentered: true,
        }
    }

    fn intercept(n: usize, prior: Prior) -> BlockSpec {
        BlockSpec {
            name: "Intercept".to_string(),
            dims: vec![],
            design: Array2::ones((n, 1)),
            kind: BlockKind::Common(prior),
        }
    }

    /// `y ~ 1` with a flat prior on the intercept.
    pub(crate) fn normal_mean(y: &[f64], sigma: PriorSpec) -> ModelSpec {
        gaussian(y, vec![intercept(y.len(), Prior::new("Flat"))], sigma)
    }

    /// `y ~ 1 + (1 | g)` with `per_group` observations around each of
    /// `means`, spread evenly in `[-0.5, 0.5]`.
    pub(crate) fn group_means(means: &[f64], per_group: usize) -> ModelSpec {
        let n_groups = means.len();
        let n = n_groups * per_group;
        let y: Vec<f64> = (0..n)
            .map(|i| {
                let spread = (i / n_groups) as f64 / (per_group - 1).max(1) as f64 - 0.5;
                means[i % n_groups] + spread
            })
            .collect();
        let design = Array2::from_shape_fn((n, n_groups), |(i, j)| f64::from(i % n_groups == j));
        let groups = (0..n_groups).map(|j| ((b'a' + j as u8) as char).to_string()).collect();
        let group_block = BlockSpec {
            name: "1|g".to_string(),
            dims: vec![(Dim::factor("g"), groups)],
            design,
            kind: BlockKind::GroupSpecific {
                prior: Prior::new("Normal")
                    .with("mu", 0.0)
                    .with("sigma", Prior::new("HalfNormal").with("sigma", 5.0)),
                n_expr: 1,
                n_groups,
                factor: Dim::factor("g"),
            },
        };
        let intercept = intercept(n, Prior::new("Normal").with("mu", 0.0).with("sigma", 10.0));
        let sigma = Prior::new("HalfNormal").with("sigma", 2.0);
        gaussian(&y, vec![intercept, group_block], sigma.into())
    }
}
