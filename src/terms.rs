//! The terms of a model component.
//!
//! Every term exposes the same surface: [`Term::name`], [`Term::data`],
//! [`Term::kind`], [`Term::levels`] and [`Term::prior`]. Data only some
//! variants have is reached through accessors returning `Option`, like
//! [`Term::group_index`] and [`Term::hsgp`].

use std::f64::consts::PI;

use ndarray::{Array2, ArrayView2};
use statrs::function::gamma::gamma;

use crate::data::{self, DataFrame};
use crate::dims::Dim;
use crate::error::{ModelError, Result};
use crate::formula::{DesignTerm, GroupTermDesign, HsgpSpec, ResponseDesign, ResponseKind, TermKind};
use crate::priors::{default_hsgp, Prior, PriorSpec};

pub(crate) fn with_prefix(name: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}_{name}")
    }
}

/// The prior a term was given and the one actually used.
///
/// `resolved` starts as a copy of `declared` and is replaced by the
/// automatic scaling pass. Priors set by the user are never rescaled.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorSlot {
    declared: Prior,
    resolved: Prior,
    user: bool,
}

impl PriorSlot {
    pub fn default_prior(prior: Prior) -> Self {
        Self {
            resolved: prior.clone(),
            declared: prior,
            user: false,
        }
    }

    pub fn user_prior(prior: Prior) -> Self {
        Self {
            resolved: prior.clone(),
            declared: prior,
            user: true,
        }
    }

    pub fn declared(&self) -> &Prior {
        &self.declared
    }

    pub fn resolved(&self) -> &Prior {
        &self.resolved
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    /// Whether the scaling pass may replace the resolved prior.
    pub fn scalable(&self) -> bool {
        !self.user && self.declared.auto_scale()
    }

    pub(crate) fn resolve(&mut self, prior: Prior) {
        self.resolved = prior;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommonTerm {
    design: DesignTerm,
    data: Array2<f64>,
    prefix: String,
    alias: Option<String>,
    prior: PriorSlot,
}

impl CommonTerm {
    pub fn new(
        design: DesignTerm,
        data: Array2<f64>,
        prefix: &str,
        prior: PriorSlot,
    ) -> Result<Self> {
        let name = with_prefix(design.name(), prefix);
        check_no_hyperprior(&name, prior.declared())?;
        Ok(Self {
            design,
            data,
            prefix: prefix.to_string(),
            alias: None,
            prior,
        })
    }

    pub fn design(&self) -> &DesignTerm {
        &self.design
    }

    pub fn set_prior(&mut self, prior: PriorSlot) -> Result<()> {
        check_no_hyperprior(&self.name(), prior.declared())?;
        self.prior = prior;
        Ok(())
    }

    fn name(&self) -> String {
        with_prefix(self.design.name(), &self.prefix)
    }
}

fn check_no_hyperprior(name: &str, prior: &Prior) -> Result<()> {
    if prior.has_hyperprior() {
        return Err(ModelError::HyperpriorOnCommon(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpecificTerm {
    design: GroupTermDesign,
    prefix: String,
    alias: Option<String>,
    prior: PriorSlot,
}

impl GroupSpecificTerm {
    pub fn new(design: GroupTermDesign, prefix: &str, prior: PriorSlot) -> Self {
        Self {
            design,
            prefix: prefix.to_string(),
            alias: None,
            prior,
        }
    }

    pub fn design(&self) -> &GroupTermDesign {
        &self.design
    }

    pub fn set_prior(&mut self, prior: PriorSlot) {
        self.prior = prior;
    }

    pub fn factor(&self) -> &str {
        self.design.factor()
    }

    pub fn groups(&self) -> &[String] {
        self.design.groups()
    }

    /// Number of coefficients per group.
    pub fn n_expr(&self) -> usize {
        self.design.predictor().ncols()
    }

    /// True for `1|g` terms.
    pub fn is_intercept(&self) -> bool {
        self.design.expr().kind() == TermKind::Intercept
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetTerm {
    design: DesignTerm,
    data: Array2<f64>,
    prefix: String,
}

impl OffsetTerm {
    pub fn new(design: DesignTerm, data: Array2<f64>, prefix: &str) -> Self {
        Self {
            design,
            data,
            prefix: prefix.to_string(),
        }
    }

    pub fn design(&self) -> &DesignTerm {
        &self.design
    }
}

/// The response after the family specific checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTerm {
    design: ResponseDesign,
    data: Array2<f64>,
    kind: ResponseKind,
    alias: Option<String>,
}

impl ResponseTerm {
    pub(crate) fn new(design: ResponseDesign, data: Array2<f64>, kind: ResponseKind) -> Self {
        Self {
            design,
            data,
            kind,
            alias: None,
        }
    }

    /// Observed values after the family specific conversion.
    pub fn data(&self) -> ArrayView2<f64> {
        self.data.view()
    }

    pub fn response_kind(&self) -> &ResponseKind {
        &self.kind
    }

    /// Every level of a categorical or multinomial response, reference
    /// first.
    pub fn levels(&self) -> Option<&[String]> {
        match &self.kind {
            ResponseKind::Categoric { levels } | ResponseKind::Multinomial { levels } => {
                Some(levels)
            }
            _ => None,
        }
    }

    /// Number of trials per observation for binomial and multinomial
    /// responses.
    pub fn trials(&self) -> Option<Vec<f64>> {
        match &self.kind {
            ResponseKind::Binomial { trials } => Some(trials.clone()),
            ResponseKind::Multinomial { .. } => {
                Some(self.data.rows().into_iter().map(|r| r.sum()).collect())
            }
            _ => None,
        }
    }

    /// Success level of a response modelled as an indicator.
    pub fn success(&self) -> Option<&str> {
        match &self.kind {
            ResponseKind::Indicator { level } => Some(level),
            _ => None,
        }
    }

    pub fn design(&self) -> &ResponseDesign {
        &self.design
    }
}

/// Covariance function of an HSGP term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Covariance {
    ExpQuad,
    Matern32,
    Matern52,
}

impl Covariance {
    fn from_name(name: &str) -> Result<Self> {
        match name {
            "ExpQuad" => Ok(Covariance::ExpQuad),
            "Matern32" => Ok(Covariance::Matern32),
            "Matern52" => Ok(Covariance::Matern52),
            other => Err(ModelError::InvalidPrior(other.to_string())),
        }
    }

    /// Spectral density at frequency `omega` for unit amplitude.
    pub fn power_spectral_density(&self, omega: f64, ell: f64) -> f64 {
        match self {
            Covariance::ExpQuad => {
                (2.0 * PI).sqrt() * ell * (-0.5 * ell * ell * omega * omega).exp()
            }
            Covariance::Matern32 => matern_psd(1.5, omega, ell),
            Covariance::Matern52 => matern_psd(2.5, omega, ell),
        }
    }
}

fn matern_psd(nu: f64, omega: f64, ell: f64) -> f64 {
    let num = 2.0 * PI.sqrt() * gamma(nu + 0.5) * (2.0 * nu).powf(nu);
    let den = gamma(nu) * ell.powf(2.0 * nu);
    num / den * (2.0 * nu / (ell * ell) + omega * omega).powf(-(nu + 0.5))
}

/// A Hilbert space approximation to a Gaussian process on one variable.
#[derive(Debug, Clone, PartialEq)]
pub struct HsgpTerm {
    design: DesignTerm,
    spec: HsgpSpec,
    cov: Covariance,
    data: Array2<f64>,
    mean: f64,
    boundary: f64,
    prefix: String,
    alias: Option<String>,
    priors: Vec<(String, PriorSpec)>,
}

impl HsgpTerm {
    pub fn new(design: DesignTerm, data: Array2<f64>, prefix: &str) -> Result<Self> {
        let spec = design
            .hsgp()
            .cloned()
            .ok_or_else(|| ModelError::TermNotFound(design.name().to_string()))?;
        let cov = Covariance::from_name(&spec.cov)?;
        let x = data.column(0).to_vec();
        let mean = if x.is_empty() { 0.0 } else { data::mean(&x) };
        let boundary = match (spec.c, spec.l) {
            (Some(c), _) => c * x.iter().map(|v| (v - mean).abs()).fold(0.0, f64::max),
            (None, Some(l)) => l,
            (None, None) => 1.0,
        };
        Ok(Self {
            design,
            spec,
            cov,
            data,
            mean,
            boundary,
            prefix: prefix.to_string(),
            alias: None,
            priors: default_hsgp(),
        })
    }

    pub fn design(&self) -> &DesignTerm {
        &self.design
    }

    pub fn spec(&self) -> &HsgpSpec {
        &self.spec
    }

    pub fn covariance(&self) -> Covariance {
        self.cov
    }

    pub fn m(&self) -> usize {
        self.spec.m
    }

    pub fn c(&self) -> Option<f64> {
        self.spec.c
    }

    /// Boundary of the approximation around the centered data.
    pub fn boundary(&self) -> f64 {
        self.boundary
    }

    /// Mean of the training data, used to center new data too.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn centered(&self) -> bool {
        self.spec.centered
    }

    pub fn drop_first(&self) -> bool {
        self.spec.drop_first
    }

    /// Indices `j` of the basis functions in use.
    fn indices(&self) -> std::ops::RangeInclusive<usize> {
        let first = if self.spec.drop_first { 2 } else { 1 };
        first..=self.spec.m
    }

    pub fn n_basis(&self) -> usize {
        self.indices().count()
    }

    /// Square roots of the Laplacian eigenvalues.
    pub fn frequencies(&self) -> Vec<f64> {
        let l = self.boundary;
        self.indices().map(|j| PI * j as f64 / (2.0 * l)).collect()
    }

    /// Basis functions evaluated at `x`, one row per value.
    pub fn basis(&self, x: &[f64]) -> Array2<f64> {
        let l = self.boundary;
        let scale = (1.0 / l).sqrt();
        let freqs = self.frequencies();
        Array2::from_shape_fn((x.len(), freqs.len()), |(i, j)| {
            let centered = x[i] - self.mean;
            scale * (freqs[j] * (centered + l)).sin()
        })
    }

    pub fn training_basis(&self) -> Array2<f64> {
        self.basis(&self.data.column(0).to_vec())
    }

    /// Prior standard deviation of every basis weight.
    pub fn weight_scales(&self, sigma: f64, ell: f64) -> Vec<f64> {
        self.frequencies()
            .into_iter()
            .map(|w| sigma * self.cov.power_spectral_density(w, ell).sqrt())
            .collect()
    }

    /// Basis evaluated on the rows of `data`.
    pub fn evaluate(&self, data: &DataFrame) -> Result<Array2<f64>> {
        Ok(self.basis(data.numeric(&self.spec.variable)?))
    }

    pub fn priors(&self) -> &[(String, PriorSpec)] {
        &self.priors
    }

    pub fn prior(&self, param: &str) -> Option<&PriorSpec> {
        self.priors.iter().find(|(k, _)| k == param).map(|(_, v)| v)
    }

    /// Replaces the priors of the named covariance parameters.
    pub fn set_priors(&mut self, priors: Vec<(String, PriorSpec)>) -> Result<()> {
        for (param, prior) in priors {
            match self.priors.iter_mut().find(|(k, _)| *k == param) {
                Some((_, slot)) => *slot = prior,
                None => {
                    return Err(ModelError::UnknownParameter {
                        param,
                        family: self.design.name().to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    pub fn weights_dim(&self, var: &str) -> Dim {
        Dim::new(format!("{var}_weights_dim"))
    }
}

/// A term of a model component.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Common(CommonTerm),
    GroupSpecific(GroupSpecificTerm),
    Offset(OffsetTerm),
    Response(ResponseTerm),
    Hsgp(HsgpTerm),
}

impl Term {
    /// Name inside the model, prefixed with the parameter for terms of
    /// non-parent components.
    pub fn name(&self) -> String {
        match self {
            Term::Common(t) => t.name(),
            Term::GroupSpecific(t) => with_prefix(t.design.name(), &t.prefix),
            Term::Offset(t) => with_prefix(t.design.name(), &t.prefix),
            Term::Response(t) => t.design.name().to_string(),
            Term::Hsgp(t) => with_prefix(t.design.name(), &t.prefix),
        }
    }

    pub fn alias(&self) -> Option<&str> {
        match self {
            Term::Common(t) => t.alias.as_deref(),
            Term::GroupSpecific(t) => t.alias.as_deref(),
            Term::Response(t) => t.alias.as_deref(),
            Term::Hsgp(t) => t.alias.as_deref(),
            Term::Offset(_) => None,
        }
    }

    pub(crate) fn set_alias(&mut self, alias: String) {
        match self {
            Term::Common(t) => t.alias = Some(alias),
            Term::GroupSpecific(t) => t.alias = Some(alias),
            Term::Response(t) => t.alias = Some(alias),
            Term::Hsgp(t) => t.alias = Some(alias),
            Term::Offset(_) => {}
        }
    }

    /// Name of the posterior variable: the alias when there is one.
    pub fn var_name(&self) -> String {
        self.alias().map(str::to_string).unwrap_or_else(|| self.name())
    }

    /// Observations by columns.
    pub fn data(&self) -> ArrayView2<f64> {
        match self {
            Term::Common(t) => t.data.view(),
            Term::GroupSpecific(t) => t.design.predictor(),
            Term::Offset(t) => t.data.view(),
            Term::Response(t) => t.data.view(),
            Term::Hsgp(t) => t.data.view(),
        }
    }

    pub fn kind(&self) -> TermKind {
        match self {
            Term::Common(t) => t.design.kind(),
            Term::GroupSpecific(t) => t.design.expr().kind(),
            Term::Offset(_) => TermKind::Offset,
            Term::Hsgp(_) => TermKind::Hsgp,
            Term::Response(t) => match t.kind {
                ResponseKind::Categoric { .. } | ResponseKind::Multinomial { .. } => {
                    TermKind::Categoric
                }
                _ => TermKind::Numeric,
            },
        }
    }

    pub fn is_categorical(&self) -> bool {
        self.levels().is_some()
    }

    /// Level labels of the columns of categorical terms. Responses list
    /// every level, reference included.
    pub fn levels(&self) -> Option<&[String]> {
        match self {
            Term::Common(t) => t.design.levels(),
            Term::GroupSpecific(t) => t.design.expr().levels(),
            Term::Response(t) => t.levels(),
            Term::Offset(_) | Term::Hsgp(_) => None,
        }
    }

    /// The prior in use. Offsets, responses and HSGP terms have none.
    pub fn prior(&self) -> Option<&Prior> {
        self.prior_slot().map(PriorSlot::resolved)
    }

    pub fn prior_slot(&self) -> Option<&PriorSlot> {
        match self {
            Term::Common(t) => Some(&t.prior),
            Term::GroupSpecific(t) => Some(&t.prior),
            _ => None,
        }
    }

    pub(crate) fn prior_slot_mut(&mut self) -> Option<&mut PriorSlot> {
        match self {
            Term::Common(t) => Some(&mut t.prior),
            Term::GroupSpecific(t) => Some(&mut t.prior),
            _ => None,
        }
    }

    pub fn group_index(&self) -> Option<&[usize]> {
        match self {
            Term::GroupSpecific(t) => Some(t.design.group_index()),
            _ => None,
        }
    }

    pub fn hsgp(&self) -> Option<&HsgpTerm> {
        match self {
            Term::Hsgp(t) => Some(t),
            _ => None,
        }
    }

    pub fn group_specific(&self) -> Option<&GroupSpecificTerm> {
        match self {
            Term::GroupSpecific(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_intercept(&self) -> bool {
        matches!(self, Term::Common(t) if t.design.kind() == TermKind::Intercept)
    }

    /// Dimensions of the coefficient, besides chain, draw and response
    /// levels, with their labels.
    pub fn coef_dims(&self) -> Vec<(Dim, Vec<String>)> {
        let var = self.var_name();
        match self {
            Term::Common(t) => {
                let scalar = t.design.ncols() == 1 && t.design.levels().is_none();
                if t.design.kind() == TermKind::Intercept || scalar {
                    vec![]
                } else {
                    let labels = t
                        .design
                        .levels()
                        .map(<[String]>::to_vec)
                        .unwrap_or_else(|| t.design.labels().to_vec());
                    vec![(Dim::term(&var), labels)]
                }
            }
            Term::GroupSpecific(t) => {
                let mut dims = Vec::with_capacity(2);
                let expr = t.design.expr();
                if expr.ncols() > 1 || expr.levels().is_some() {
                    let labels = expr
                        .levels()
                        .map(<[String]>::to_vec)
                        .unwrap_or_else(|| expr.labels().to_vec());
                    dims.push((Dim::expr(&var), labels));
                }
                dims.push((Dim::factor(t.factor()), t.groups().to_vec()));
                dims
            }
            Term::Hsgp(t) => {
                let labels = (0..t.n_basis()).map(|i| i.to_string()).collect();
                vec![(t.weights_dim(&var), labels)]
            }
            Term::Offset(_) | Term::Response(_) => vec![],
        }
    }
}
