//! Components group the terms that model one parameter of the likelihood.
//!
//! A [`DistributionalComponent`] is backed by design matrices. It is the
//! component of the response (the parent parameter) or of an auxiliary
//! parameter with its own formula. A [`ConstantComponent`] is an auxiliary
//! parameter without a formula: a scalar with a prior, or a fixed value.

use ndarray::{s, Array2, Array3, Array4, Axis};

use crate::data::DataFrame;
use crate::dims::{dot_design, stack_variables, DataArray, Dim};
use crate::draws::Dataset;
use crate::error::{ModelError, Result};
use crate::families::Family;
use crate::formula::{DesignMatrices, ResponseKind, TermKind};
use crate::priors::{default_common, default_group_specific, Prior, PriorSpec};
use crate::terms::{
    with_prefix, CommonTerm, GroupSpecificTerm, HsgpTerm, OffsetTerm, PriorSlot, ResponseTerm, Term,
};

/// Whether a component models the response or another parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Data,
    Parameter,
}

/// Priors for the terms of a component.
///
/// `named` is looked up by term name first, then `common` or
/// `group_specific` apply to every term of that class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermPriors {
    pub named: Vec<(String, Prior)>,
    pub common: Option<Prior>,
    pub group_specific: Option<Prior>,
}

impl TermPriors {
    fn take(&mut self, name: &str) -> Option<Prior> {
        let idx = self.named.iter().position(|(k, _)| k == name)?;
        Some(self.named.remove(idx).1)
    }
}

/// A scalar auxiliary parameter, named `{response}_{param}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstantComponent {
    param: String,
    name: String,
    declared: PriorSpec,
    resolved: PriorSpec,
    user: bool,
    alias: Option<String>,
}

impl ConstantComponent {
    pub fn new(param: &str, prior: PriorSpec, response_name: &str, user: bool) -> Self {
        Self {
            param: param.to_string(),
            name: format!("{response_name}_{param}"),
            resolved: prior.clone(),
            declared: prior,
            user,
            alias: None,
        }
    }

    /// Parameter of the likelihood, like `sigma`.
    pub fn param(&self) -> &str {
        &self.param
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub(crate) fn set_alias(&mut self, alias: String) {
        self.alias = Some(alias);
    }

    pub fn prior(&self) -> &PriorSpec {
        &self.resolved
    }

    pub fn declared_prior(&self) -> &PriorSpec {
        &self.declared
    }

    pub fn is_user(&self) -> bool {
        self.user
    }

    pub fn update_prior(&mut self, prior: PriorSpec) {
        self.resolved = prior.clone();
        self.declared = prior;
        self.user = true;
    }

    pub(crate) fn resolve(&mut self, prior: PriorSpec) {
        self.resolved = prior;
    }

    /// Draws of the parameter, broadcast over observations.
    pub fn predict(
        &self,
        posterior: &Dataset,
        response_name: &str,
        n_obs: usize,
    ) -> Result<DataArray> {
        let (chains, draws) = (posterior.n_chains(), posterior.n_draws());
        let values = match &self.resolved {
            PriorSpec::Constant(value) => Array3::from_elem((chains, draws, n_obs), *value),
            PriorSpec::Prior(_) => {
                let samples = posterior.require(self.var_name())?.samples()?;
                let column = samples.column(0);
                Array3::from_shape_fn((chains, draws, n_obs), |(c, d, _)| column[c * draws + d])
            }
        };
        DataArray::new(
            vec![Dim::chain(), Dim::draw(), Dim::obs(response_name)],
            values.into_dyn(),
        )
    }
}

/// The terms modelling one parameter through a linear predictor.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionalComponent {
    name: String,
    response_name: String,
    kind: ComponentKind,
    prefix: String,
    design: DesignMatrices,
    terms: Vec<(String, Term)>,
    response_term: Option<ResponseTerm>,
    alias: Option<String>,
    response_alias: Option<String>,
    n_obs: usize,
}

impl DistributionalComponent {
    /// Builds the terms of `design`. `name` is the response name for the
    /// data component or the parameter name otherwise, `response_name` is
    /// the name of the model response.
    pub fn new(
        design: DesignMatrices,
        priors: &mut TermPriors,
        name: &str,
        response_name: &str,
        kind: ComponentKind,
        family: &Family,
        auto_scale: bool,
    ) -> Result<Self> {
        let prefix = match kind {
            ComponentKind::Data => String::new(),
            ComponentKind::Parameter => name.to_string(),
        };
        let mut terms = Vec::new();
        let mut n_obs = 0;

        if let Some(common) = &design.common {
            n_obs = common.nrows();
            for term in common.terms() {
                let data = common
                    .term_data(term.name())
                    .ok_or_else(|| ModelError::TermNotFound(term.name().to_string()))?
                    .to_owned();
                let built = match term.kind() {
                    TermKind::Offset => Term::Offset(OffsetTerm::new(term.clone(), data, &prefix)),
                    TermKind::Hsgp => Term::Hsgp(HsgpTerm::new(term.clone(), data, &prefix)?),
                    _ => {
                        let prior = priors.take(term.name()).or_else(|| priors.common.clone());
                        let slot = match prior {
                            Some(prior) => PriorSlot::user_prior(prior),
                            None => PriorSlot::default_prior(default_common(auto_scale)),
                        };
                        Term::Common(CommonTerm::new(term.clone(), data, &prefix, slot)?)
                    }
                };
                terms.push((term.name().to_string(), built));
            }
        }

        if let Some(group) = &design.group {
            for term in group.terms() {
                n_obs = term.group_index().len();
                let slot = match priors
                    .take(term.name())
                    .or_else(|| priors.group_specific.clone())
                {
                    Some(prior) => PriorSlot::user_prior(prior),
                    None => PriorSlot::default_prior(default_group_specific()),
                };
                terms.push((
                    term.name().to_string(),
                    Term::GroupSpecific(GroupSpecificTerm::new(term.clone(), &prefix, slot)),
                ));
            }
        }

        let response_term = match &design.response {
            Some(response) => {
                let term = response_term(response, family)?;
                n_obs = response.data().nrows();
                Some(term)
            }
            None => None,
        };

        Ok(Self {
            name: name.to_string(),
            response_name: response_name.to_string(),
            kind,
            prefix,
            design,
            terms,
            response_term,
            alias: None,
            response_alias: None,
            n_obs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub(crate) fn set_alias(&mut self, alias: String) {
        self.alias = Some(alias);
    }

    /// Name of the response in posterior dims, the alias if it has one.
    pub fn response_var(&self) -> &str {
        self.response_alias.as_deref().unwrap_or(&self.response_name)
    }

    pub(crate) fn set_response_alias(&mut self, alias: String) {
        self.response_alias = Some(alias);
    }

    pub fn design(&self) -> &DesignMatrices {
        &self.design
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn response_term(&self) -> Option<&ResponseTerm> {
        self.response_term.as_ref()
    }

    pub(crate) fn response_term_mut(&mut self) -> Option<&mut ResponseTerm> {
        self.response_term.as_mut()
    }

    /// Terms in design order, keyed by their unprefixed names.
    pub fn terms(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.terms.iter().map(|(k, t)| (k.as_str(), t))
    }

    pub fn term(&self, name: &str) -> Option<&Term> {
        self.terms.iter().find(|(k, _)| k == name).map(|(_, t)| t)
    }

    pub(crate) fn term_mut(&mut self, name: &str) -> Option<&mut Term> {
        self.terms.iter_mut().find(|(k, _)| k == name).map(|(_, t)| t)
    }

    pub(crate) fn terms_mut(&mut self) -> impl Iterator<Item = &mut Term> {
        self.terms.iter_mut().map(|(_, t)| t)
    }

    /// Replaces the priors of the named terms.
    pub fn update_priors(&mut self, priors: Vec<(String, Prior)>) -> Result<()> {
        for (name, prior) in priors {
            let term = self
                .term_mut(&name)
                .ok_or_else(|| ModelError::TermNotFound(name.clone()))?;
            match term {
                Term::Common(t) => t.set_prior(PriorSlot::user_prior(prior))?,
                Term::GroupSpecific(t) => t.set_prior(PriorSlot::user_prior(prior)),
                _ => return Err(ModelError::InvalidPrior(name)),
            }
        }
        Ok(())
    }

    pub fn intercept_term(&self) -> Option<&Term> {
        self.terms.iter().map(|(_, t)| t).find(|t| t.is_intercept())
    }

    /// Common terms other than the intercept.
    pub fn common_terms(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.terms()
            .filter(|(_, t)| matches!(t, Term::Common(_)) && !t.is_intercept())
    }

    pub fn group_specific_terms(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.terms().filter(|(_, t)| matches!(t, Term::GroupSpecific(_)))
    }

    pub fn offset_terms(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.terms().filter(|(_, t)| matches!(t, Term::Offset(_)))
    }

    pub fn hsgp_terms(&self) -> impl Iterator<Item = (&str, &Term)> {
        self.terms().filter(|(_, t)| matches!(t, Term::Hsgp(_)))
    }

    /// Group specific term names by grouping factor, in order of first
    /// appearance.
    pub fn group_specific_groups(&self) -> Vec<(String, Vec<String>)> {
        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for (name, term) in self.group_specific_terms() {
            let Some(factor) = term.group_specific().map(GroupSpecificTerm::factor) else {
                continue;
            };
            match groups.iter_mut().find(|(f, _)| f == factor) {
                Some((_, names)) => names.push(name.to_string()),
                None => groups.push((factor.to_string(), vec![name.to_string()])),
            }
        }
        groups
    }

    /// Names of the terms generated from `name`: the term itself, or
    /// every group specific term `x|g` sharing the expression `x` or
    /// the factor `g` given as `x|g`. No match is an empty result.
    pub fn match_derived_terms(&self, name: &str) -> Vec<String> {
        if self.term(name).is_some() {
            return vec![name.to_string()];
        }
        let Some((expr, factor)) = name.split_once('|') else {
            return Vec::new();
        };
        let (expr, factor) = (expr.trim(), factor.trim());
        self.group_specific_terms()
            .filter(|(term_name, _)| {
                term_name
                    .split_once('|')
                    .is_some_and(|(e, f)| {
                        f == factor && (e == expr || e.starts_with(&format!("{expr}[")))
                    })
            })
            .map(|(term_name, _)| term_name.to_string())
            .collect()
    }

    /// Names of the posterior variables of the terms with coefficients.
    pub fn var_names(&self) -> Vec<String> {
        self.terms
            .iter()
            .filter(|(_, t)| t.prior_slot().is_some() || t.hsgp().is_some())
            .map(|(_, t)| t.var_name())
            .collect()
    }

    /// Response scale parameter draws, dims (chain, draw, obs) or (chain,
    /// draw, obs, levels) for multivariate families.
    ///
    /// Without `data` the training design is used. Group specific effects
    /// are skipped when `include_group_specific` is false.
    pub fn predict(
        &self,
        posterior: &Dataset,
        data: Option<&DataFrame>,
        include_group_specific: bool,
        family: &Family,
        response_levels: Option<&[String]>,
    ) -> Result<DataArray> {
        let eta = self.linear_predictor(posterior, data, include_group_specific, family)?;
        let link = match self.kind {
            ComponentKind::Data => family.parent_link(),
            ComponentKind::Parameter => family.link(&self.name),
        };
        let resp = self.response_var();
        let (chains, draws, n, levels) = eta.dim();

        if family.is_multivariate() {
            let levels_dim = Dim::response_levels(resp);
            let lp = DataArray::new(
                vec![Dim::chain(), Dim::draw(), Dim::obs(resp), levels_dim.clone()],
                eta.into_dyn(),
            )?;
            let mut padded = lp.pad_reference(&levels_dim)?.into_values();
            for mut lane in padded.lanes_mut(Axis(3)) {
                let mut values = lane.to_vec();
                link.linkinv_slice(&mut values);
                lane.iter_mut().zip(values).for_each(|(slot, v)| *slot = v);
            }
            let mean_dim = Dim::mean_levels(resp);
            let out = DataArray::new(
                vec![Dim::chain(), Dim::draw(), Dim::obs(resp), mean_dim.clone()],
                padded,
            )?
            .with_coords(&Dim::obs(resp), obs_labels(n))?;
            return match response_levels {
                Some(labels) => out.with_coords(&mean_dim, labels.to_vec()),
                None => Ok(out),
            };
        }

        if levels != 1 {
            return Err(ModelError::Dimension {
                name: self.name.clone(),
                reason: format!("univariate family with {levels} levels"),
            });
        }
        let values = eta
            .into_shape_with_order((chains, draws, n))
            .map_err(|e| ModelError::Dimension {
                name: self.name.clone(),
                reason: e.to_string(),
            })?
            .mapv(|x| link.linkinv(x));
        DataArray::new(vec![Dim::chain(), Dim::draw(), Dim::obs(resp)], values.into_dyn())?
            .with_coords(&Dim::obs(resp), obs_labels(n))
    }

    /// The linear predictor as (chain, draw, obs, levels).
    pub fn linear_predictor(
        &self,
        posterior: &Dataset,
        data: Option<&DataFrame>,
        include_group_specific: bool,
        family: &Family,
    ) -> Result<Array4<f64>> {
        let levels_dim = family
            .is_multivariate()
            .then(|| Dim::response_levels(self.response_var()));
        let levels_dim = levels_dim.as_ref();
        let n_levels = match (levels_dim, self.response_levels()) {
            (Some(_), Some(levels)) => levels.len().saturating_sub(1),
            _ => 1,
        };
        let n = match data {
            Some(data) => data.nrows(),
            None => self.n_obs,
        };
        let (chains, draws) = (posterior.n_chains(), posterior.n_draws());
        let mut eta = Array4::<f64>::zeros((chains, draws, n, n_levels));

        if let Some(common) = &self.design.common {
            let evaluated;
            let common = match data {
                None => common,
                Some(data) => {
                    evaluated = common.evaluate_new_data(data)?;
                    &evaluated
                }
            };
            let x = common.design_matrix();
            let mut columns = Vec::new();
            let mut coefs = Vec::new();
            for design_term in common.terms() {
                let Some(term) = self.term(design_term.name()) else {
                    continue;
                };
                let range = common
                    .slice(design_term.name())
                    .ok_or_else(|| ModelError::TermNotFound(design_term.name().to_string()))?;
                match term {
                    Term::Common(_) => {
                        columns.extend(range);
                        coefs.push(posterior.require(&term.var_name())?);
                    }
                    Term::Offset(_) => {
                        let offset = x.slice(s![.., range]).sum_axis(Axis(1));
                        for (i, value) in offset.iter().enumerate() {
                            eta.slice_mut(s![.., .., i, ..]).mapv_inplace(|v| v + value);
                        }
                    }
                    Term::Hsgp(hsgp) => {
                        let values = x.slice(s![.., range]).column(0).to_vec();
                        let phi = hsgp.basis(&values);
                        let weights = posterior.require(&format!("{}_weights", term.var_name()))?;
                        eta += &dot_design(phi.view(), &weights.to_blocks(levels_dim)?)?;
                    }
                    Term::GroupSpecific(_) | Term::Response(_) => {}
                }
            }
            if !coefs.is_empty() {
                let b = stack_variables(&coefs, levels_dim)?;
                let x_common = x.select(Axis(1), &columns);
                eta += &dot_design(x_common.view(), &b)?;
            }
        }

        if include_group_specific {
            if let Some(group) = &self.design.group {
                let evaluated;
                let group = match data {
                    None => group,
                    Some(data) => {
                        evaluated = group.evaluate_new_data(data)?;
                        &evaluated
                    }
                };
                let coefs = group
                    .terms()
                    .iter()
                    .filter_map(|t| self.term(t.name()))
                    .map(|t| posterior.require(&t.var_name()))
                    .collect::<Result<Vec<_>>>()?;
                if !coefs.is_empty() {
                    let u = stack_variables(&coefs, levels_dim)?;
                    eta += &dot_design(group.design_matrix(), &u)?;
                }
            }
        }
        Ok(eta)
    }

    /// Every level of the response, reference first.
    pub fn response_levels(&self) -> Option<&[String]> {
        self.response_term.as_ref().and_then(ResponseTerm::levels)
    }

    /// Name of the parameter in the posterior. The response mean is
    /// `{response}_mean`, other parameters use their alias or
    /// `{response}_{param}`.
    pub fn var_name(&self) -> String {
        match (&self.alias, self.kind) {
            (_, ComponentKind::Data) => format!("{}_mean", self.response_var()),
            (Some(alias), ComponentKind::Parameter) => alias.clone(),
            (None, ComponentKind::Parameter) => format!("{}_{}", self.response_name, self.name),
        }
    }

    pub(crate) fn prefixed(&self, name: &str) -> String {
        with_prefix(name, &self.prefix)
    }
}

fn obs_labels(n: usize) -> Vec<String> {
    (0..n).map(|i| i.to_string()).collect()
}

/// Family specific checks of the response.
fn response_term(design: &crate::formula::ResponseDesign, family: &Family) -> Result<ResponseTerm> {
    let bernoulli = family.name() == "bernoulli";
    let data = design.data().to_owned();
    match design.kind() {
        ResponseKind::Indicator { .. } if !bernoulli => Err(ModelError::IndexNotation),
        ResponseKind::Categoric { levels } if bernoulli => {
            if levels.len() != 2 {
                return Err(ModelError::CategoricBernoulli);
            }
            let level = levels[0].clone();
            log::info!("Modeling the probability that {}=={}", design.name(), level);
            let indicator = data.mapv(|idx| if idx == 0.0 { 1.0 } else { 0.0 });
            Ok(ResponseTerm::new(design.clone(), indicator, ResponseKind::Indicator { level }))
        }
        ResponseKind::Numeric if bernoulli => {
            if data.iter().any(|&y| y != 0.0 && y != 1.0) {
                return Err(ModelError::NumericBernoulli);
            }
            Ok(ResponseTerm::new(design.clone(), data, ResponseKind::Numeric))
        }
        kind => {
            check_response_kind(family, kind)?;
            Ok(ResponseTerm::new(design.clone(), data, kind.clone()))
        }
    }
}

fn check_response_kind(family: &Family, kind: &ResponseKind) -> Result<()> {
    let expected = match family.name() {
        "categorical" => (!matches!(kind, ResponseKind::Categoric { .. })).then_some("categorical"),
        "multinomial" => (!matches!(kind, ResponseKind::Multinomial { .. }))
            .then_some("multinomial counts 'c(y1, y2, ...)'"),
        "binomial" => (!matches!(kind, ResponseKind::Binomial { .. }))
            .then_some("successes out of trials 'p(y, n)'"),
        _ => matches!(kind, ResponseKind::Categoric { .. }).then_some("numeric"),
    };
    match expected {
        Some(expected) => Err(ModelError::ResponseKind {
            family: family.name().to_string(),
            expected: expected.to_string(),
        }),
        None => Ok(()),
    }
}

/// Design matrix of the training data for every common term with a
/// coefficient, in stacking order.
pub(crate) fn common_design(component: &DistributionalComponent) -> Option<Array2<f64>> {
    let common = component.design.common.as_ref()?;
    let columns: Vec<usize> = common
        .terms()
        .iter()
        .filter(|t| matches!(component.term(t.name()), Some(Term::Common(_))))
        .filter_map(|t| common.slice(t.name()))
        .flatten()
        .collect();
    Some(common.design_matrix().select(Axis(1), &columns))
}
