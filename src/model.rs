//! The model: a family, the components built from the formulas and the data
//! they were built on.
//!
//! ```ignore
//! let mut model = Model::new("y ~ x + (1 | g)", data)?;
//! let slope = Prior::new("Normal").with("mu", 0.0).with("sigma", 1.0);
//! model.set_priors(vec![("x".into(), slope.into())], None, None)?;
//! let mut idata = model.fit(&FitSettings::default())?;
//! model.predict(&mut idata, PredictionKind::Mean, None, &mut rng)?;
//! ```

use std::fmt;

use itertools::Itertools;
use ndarray::{Array3, ArrayD, ArrayView3, Ix3, IxDyn};
use rand::Rng;

use crate::backend::{
    Backend, FitSettings, LaplaceBackend, Layout, Method, ModelSpec, NutsBackend,
};
use crate::components::{ComponentKind, ConstantComponent, DistributionalComponent, TermPriors};
use crate::data::DataFrame;
use crate::dims::{DataArray, Dim};
use crate::draws::{Dataset, InferenceData};
use crate::error::{DataError, ModelError, Result};
use crate::families::{observation, Family, LinkSpec};
use crate::formula::{DesignMatrices, Formula, ParsedFormula, ResponseSpec, Trials};
use crate::priors::{Prior, PriorScaler, PriorSpec};
use crate::terms::Term;

/// A family given by name, or a custom one.
#[derive(Debug, Clone, PartialEq)]
pub enum FamilySpec {
    Name(String),
    Custom(Family),
}

impl From<&str> for FamilySpec {
    fn from(value: &str) -> Self {
        FamilySpec::Name(value.to_string())
    }
}

impl From<Family> for FamilySpec {
    fn from(value: Family) -> Self {
        FamilySpec::Custom(value)
    }
}

/// Options of [`Model::with_options`].
///
/// `priors` are keyed by term name, by auxiliary parameter name, or by
/// `{param}_{term}` for the terms of a distributional parameter.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub family: FamilySpec,
    pub link: Option<LinkSpec>,
    pub priors: Vec<(String, PriorSpec)>,
    pub auto_scale: bool,
    pub noncentered: bool,
    /// Drop rows with missing values instead of failing.
    pub dropna: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            family: FamilySpec::Name("gaussian".to_string()),
            link: None,
            priors: Vec::new(),
            auto_scale: true,
            noncentered: true,
            dropna: false,
        }
    }
}

/// What [`Model::predict`] adds to the draws.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionKind {
    /// Parameters of the likelihood, added to the posterior.
    Mean,
    /// Draws of the response, added to the posterior predictive.
    Pps,
}

/// Aliases for [`Model::set_alias`].
///
/// A flat map applies to the response component and the auxiliary
/// parameters. A nested map is keyed by component: the response name or a
/// parameter name.
#[derive(Debug, Clone, PartialEq)]
pub enum Aliases {
    Flat(Vec<(String, String)>),
    Nested(Vec<(String, Vec<(String, String)>)>),
}

impl<K: Into<String>, V: Into<String>, const N: usize> From<[(K, V); N]> for Aliases {
    fn from(value: [(K, V); N]) -> Self {
        value.into_iter().collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Aliases {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Aliases::Flat(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

enum PriorTarget {
    Constant(usize),
    /// Component index, `None` for the response component.
    Term(Option<usize>, String),
}

#[derive(Debug, Clone)]
pub struct Model {
    formula: Formula,
    main: ParsedFormula,
    additionals: Vec<(String, ParsedFormula)>,
    data: DataFrame,
    family: Family,
    response_name: String,
    response_alias: Option<String>,
    response_component: DistributionalComponent,
    distributional: Vec<DistributionalComponent>,
    constants: Vec<ConstantComponent>,
    auto_scale: bool,
    noncentered: bool,
}

impl Model {
    pub fn new(formula: impl Into<Formula>, data: DataFrame) -> Result<Self> {
        Self::with_options(formula, data, ModelOptions::default())
    }

    pub fn with_options(
        formula: impl Into<Formula>,
        data: DataFrame,
        options: ModelOptions,
    ) -> Result<Self> {
        let formula = formula.into();
        let mut family = match options.family {
            FamilySpec::Name(name) => Family::builtin(&name)?,
            FamilySpec::Custom(family) => family,
        };
        if let Some(link) = options.link {
            family.set_link(link)?;
        }

        let (main, mut additionals) = formula.parse()?;
        let parent = family.likelihood().parent().to_string();
        for (param, parsed) in additionals.iter_mut() {
            if *param == parent || !family.likelihood().params().contains(param) {
                return Err(ModelError::UnknownParameter {
                    param: param.clone(),
                    family: family.name().to_string(),
                });
            }
            // the left-hand side names a parameter, not a column
            parsed.response = None;
        }

        let variables: Vec<String> = main
            .variables()
            .into_iter()
            .chain(additionals.iter().flat_map(|(_, p)| p.variables()))
            .unique()
            .collect();
        let data = drop_missing(data, &variables, options.dropna)?;

        let design = DesignMatrices::new(&main, &data)?;
        let response_name = design
            .response
            .as_ref()
            .map(|r| r.name().to_string())
            .ok_or_else(|| ModelError::TermNotFound("response".to_string()))?;
        let response_component = DistributionalComponent::new(
            design,
            &mut TermPriors::default(),
            &response_name,
            &response_name,
            ComponentKind::Data,
            &family,
            options.auto_scale,
        )?;

        let mut distributional = Vec::with_capacity(additionals.len());
        for (param, parsed) in &additionals {
            let design = DesignMatrices::new(parsed, &data)?;
            distributional.push(DistributionalComponent::new(
                design,
                &mut TermPriors::default(),
                param,
                &response_name,
                ComponentKind::Parameter,
                &family,
                options.auto_scale,
            )?);
        }

        let mut constants = Vec::new();
        for param in family.likelihood().auxiliary_params() {
            if additionals.iter().any(|(p, _)| p == param) {
                continue;
            }
            let prior = family
                .default_prior(param)
                .cloned()
                .ok_or_else(|| ModelError::MissingPrior(param.to_string()))?;
            constants.push(ConstantComponent::new(param, prior, &response_name, false));
        }

        log::debug!(
            "Built '{}' with {} observations and {} components",
            formula.main(),
            data.nrows(),
            1 + distributional.len() + constants.len()
        );

        let mut model = Self {
            formula,
            main,
            additionals,
            data,
            family,
            response_name,
            response_alias: None,
            response_component,
            distributional,
            constants,
            auto_scale: options.auto_scale,
            noncentered: options.noncentered,
        };
        model.apply_priors(options.priors)?;
        model.resolve_priors();
        Ok(model)
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    pub fn family(&self) -> &Family {
        &self.family
    }

    /// The data the model was built on, without dropped rows.
    pub fn data(&self) -> &DataFrame {
        &self.data
    }

    pub fn response_name(&self) -> &str {
        &self.response_name
    }

    /// Name of the response in the draws, its alias if it has one.
    pub fn response_var(&self) -> &str {
        self.response_alias.as_deref().unwrap_or(&self.response_name)
    }

    pub fn response_component(&self) -> &DistributionalComponent {
        &self.response_component
    }

    /// Components of the parameters with their own formula.
    pub fn components(&self) -> &[DistributionalComponent] {
        &self.distributional
    }

    pub fn component(&self, name: &str) -> Option<&DistributionalComponent> {
        if name == self.response_name {
            return Some(&self.response_component);
        }
        self.distributional.iter().find(|c| c.name() == name)
    }

    pub fn constant_components(&self) -> &[ConstantComponent] {
        &self.constants
    }

    pub fn n_obs(&self) -> usize {
        self.response_component.n_obs()
    }

    /// Names of the terms of every component, prefixed by the parameter
    /// for non-parent components.
    pub fn term_names(&self) -> Vec<String> {
        std::iter::once(&self.response_component)
            .chain(&self.distributional)
            .flat_map(|c| c.terms().map(|(_, t)| t.name()).collect::<Vec<_>>())
            .collect()
    }

    /// Variables the predictors read from the data, response excluded, in
    /// order of appearance.
    pub fn covariates(&self) -> Vec<String> {
        std::iter::once(&self.main)
            .chain(self.additionals.iter().map(|(_, p)| p))
            .flat_map(|parsed| {
                let common = parsed.terms.iter().flat_map(|t| t.variables());
                let groups = parsed.groups.iter().flat_map(|g| {
                    let variables = g.terms.iter().flat_map(|t| t.variables());
                    variables.chain(g.factors.iter().cloned())
                });
                common.chain(groups).collect::<Vec<_>>()
            })
            .unique()
            .collect()
    }

    /// Replaces priors. Named priors are located like in
    /// [`ModelOptions::priors`]. `common` applies to every common term but
    /// the intercepts and `group_specific` to every group specific term.
    pub fn set_priors(
        &mut self,
        priors: Vec<(String, PriorSpec)>,
        common: Option<Prior>,
        group_specific: Option<Prior>,
    ) -> Result<()> {
        let components =
            std::iter::once(&mut self.response_component).chain(self.distributional.iter_mut());
        for component in components {
            let mut updates = Vec::new();
            for (name, term) in component.terms() {
                match (term, &common, &group_specific) {
                    (Term::Common(_), Some(prior), _) if !term.is_intercept() => {
                        updates.push((name.to_string(), prior.clone()))
                    }
                    (Term::GroupSpecific(_), _, Some(prior)) => {
                        updates.push((name.to_string(), prior.clone()))
                    }
                    _ => {}
                }
            }
            component.update_priors(updates)?;
        }
        self.apply_priors(priors)?;
        self.resolve_priors();
        Ok(())
    }

    /// Priors of the `sigma` and `ell` parameters of an HSGP term.
    pub fn set_hsgp_priors(&mut self, term: &str, priors: Vec<(String, PriorSpec)>) -> Result<()> {
        let (component, name) = match self.locate(term) {
            Some(PriorTarget::Term(component, name)) => (component, name),
            _ => return Err(ModelError::TermNotFound(term.to_string())),
        };
        let component = match component {
            Some(idx) => &mut self.distributional[idx],
            None => &mut self.response_component,
        };
        match component.term_mut(&name) {
            Some(Term::Hsgp(t)) => t.set_priors(priors),
            _ => Err(ModelError::TermNotFound(term.to_string())),
        }
    }

    fn locate(&self, name: &str) -> Option<PriorTarget> {
        if let Some(idx) = self.constants.iter().position(|c| c.param() == name) {
            return Some(PriorTarget::Constant(idx));
        }
        if self.response_component.term(name).is_some() {
            return Some(PriorTarget::Term(None, name.to_string()));
        }
        self.distributional.iter().enumerate().find_map(|(idx, c)| {
            let rest = name.strip_prefix(c.name())?.strip_prefix('_')?;
            c.term(rest).map(|_| PriorTarget::Term(Some(idx), rest.to_string()))
        })
    }

    fn apply_priors(&mut self, priors: Vec<(String, PriorSpec)>) -> Result<()> {
        for (name, prior) in priors {
            match (self.locate(&name), prior) {
                (Some(PriorTarget::Constant(idx)), prior) => {
                    self.constants[idx].update_prior(prior)
                }
                (Some(PriorTarget::Term(component, term)), PriorSpec::Prior(prior)) => {
                    let component = match component {
                        Some(idx) => &mut self.distributional[idx],
                        None => &mut self.response_component,
                    };
                    component.update_priors(vec![(term, prior)])?;
                }
                (Some(PriorTarget::Term(..)), PriorSpec::Constant(_)) => {
                    return Err(ModelError::InvalidPrior(name));
                }
                (None, _) => return Err(ModelError::TermNotFound(name)),
            }
        }
        Ok(())
    }

    /// Resolves the priors of the response component and the response
    /// scale from the data. Declared priors are left untouched, so this
    /// runs again after every prior update.
    fn resolve_priors(&mut self) {
        if !self.auto_scale {
            return;
        }
        let response: Vec<f64> = self
            .response_component
            .response_term()
            .map(|t| t.data().column(0).to_vec())
            .unwrap_or_default();
        let scaler = PriorScaler::new(self.family.name(), &response);

        let mut resolved = Vec::new();
        for (name, term) in self.response_component.terms() {
            let Some(slot) = term.prior_slot().filter(|s| s.scalable()) else {
                continue;
            };
            let prior = match term {
                Term::Common(_) if term.is_intercept() => scaler.scale_intercept(slot.declared()),
                Term::Common(_) => scaler.scale_common(slot.declared(), term.data()),
                Term::GroupSpecific(t) => {
                    scaler.scale_group_specific(slot.declared(), term.data(), t.is_intercept())
                }
                _ => continue,
            };
            resolved.push((name.to_string(), prior));
        }
        for (name, prior) in resolved {
            let slot = self.response_component.term_mut(&name).and_then(Term::prior_slot_mut);
            if let Some(slot) = slot {
                slot.resolve(prior);
            }
        }
        log::debug!(
            "Scaled priors with response mean {:.4} and std {:.4}",
            scaler.response_mean(),
            scaler.response_std()
        );

        if self.family.name() == "gaussian" {
            let sigmas = self
                .constants
                .iter_mut()
                .filter(|c| c.param() == "sigma" && !c.is_user());
            for constant in sigmas {
                if let PriorSpec::Prior(declared) = constant.declared_prior() {
                    if declared.auto_scale() {
                        let scaled = scaler.scale_response(declared);
                        constant.resolve(scaled.into());
                    }
                }
            }
        }
    }

    /// Renames terms, components and the response in the draws. Names
    /// that match nothing are skipped with a warning.
    pub fn set_alias(&mut self, aliases: impl Into<Aliases>) {
        let mut unmatched = Vec::new();
        match aliases.into() {
            Aliases::Flat(pairs) => {
                for (name, alias) in pairs {
                    if !self.alias_response_component(&name, &alias)
                        && !self.alias_constant(&name, &alias)
                    {
                        unmatched.push(name);
                    }
                }
            }
            Aliases::Nested(groups) => {
                for (component, pairs) in groups {
                    for (name, alias) in pairs {
                        let matched = if component == self.response_name {
                            self.alias_response_component(&name, &alias)
                        } else if let Some(c) =
                            self.distributional.iter_mut().find(|c| c.name() == component)
                        {
                            alias_distributional(c, &name, &alias)
                        } else {
                            name == component && self.alias_constant(&name, &alias)
                        };
                        if !matched {
                            unmatched.push(name);
                        }
                    }
                }
            }
        }
        match unmatched.as_slice() {
            [] => {}
            [name] => log::warn!(
                "The following names do not match any terms, \
                 their aliases were not assigned: {name}"
            ),
            names => log::warn!(
                "There are {} names that do not match any terms, \
                 so their aliases were not assigned.",
                names.len()
            ),
        }
    }

    fn alias_response_component(&mut self, name: &str, alias: &str) -> bool {
        if name == self.response_name {
            self.response_alias = Some(alias.to_string());
            let components =
                std::iter::once(&mut self.response_component).chain(self.distributional.iter_mut());
            for c in components {
                c.set_response_alias(alias.to_string());
            }
            return true;
        }
        match self.response_component.term_mut(name) {
            Some(term) => {
                term.set_alias(alias.to_string());
                true
            }
            None => false,
        }
    }

    fn alias_constant(&mut self, name: &str, alias: &str) -> bool {
        if let Some(c) = self.distributional.iter_mut().find(|c| c.name() == name) {
            c.set_alias(alias.to_string());
            return true;
        }
        match self.constants.iter_mut().find(|c| c.param() == name) {
            Some(c) => {
                c.set_alias(alias.to_string());
                true
            }
            None => false,
        }
    }

    /// Compiles the model for a backend. Calling it twice gives the same
    /// result.
    pub fn build(&self) -> Result<ModelSpec> {
        ModelSpec::new(
            &self.family,
            &self.response_component,
            &self.distributional,
            &self.constants,
            self.response_var(),
            self.noncentered,
        )
    }

    /// Fits the model with the backend of `settings.method`, NUTS unless
    /// the Laplace approximation is asked for.
    pub fn fit(&self, settings: &FitSettings) -> Result<InferenceData> {
        match settings.method {
            Method::Nuts => self.fit_with(&mut NutsBackend::new(), settings),
            Method::Laplace => self.fit_with(&mut LaplaceBackend::new(), settings),
        }
    }

    pub fn fit_with(
        &self,
        backend: &mut impl Backend,
        settings: &FitSettings,
    ) -> Result<InferenceData> {
        let spec = self.build()?;
        backend.build(&spec)?;
        let mut idata = backend.run(settings)?;
        idata.observed_data = Some(self.observed_data()?);
        if settings.include_mean {
            self.insert_means(&mut idata.posterior, None, true)?;
        }
        Ok(idata)
    }

    /// The observed response, with the `{response}_obs` dim.
    pub fn observed_data(&self) -> Result<Dataset> {
        let resp = self.response_var();
        let term = self
            .response_component
            .response_term()
            .ok_or_else(|| ModelError::TermNotFound(resp.to_string()))?;
        let values = term.data();
        let array = if self.family.name() == "multinomial" {
            let levels = term.levels().map(<[String]>::to_vec).unwrap_or_default();
            DataArray::new(
                vec![Dim::obs(resp), Dim::mean_levels(resp)],
                values.to_owned().into_dyn(),
            )?
            .with_coords(&Dim::mean_levels(resp), levels)?
        } else {
            DataArray::new(vec![Dim::obs(resp)], values.column(0).to_owned().into_dyn())?
        };
        let mut dataset = Dataset::new();
        dataset.insert(resp, array);
        Ok(dataset)
    }

    /// Adds the parameters of the likelihood (`Mean`) to the posterior or
    /// draws of the response (`Pps`) to the posterior predictive, for the
    /// training data or `data`.
    pub fn predict<R: Rng + ?Sized>(
        &self,
        idata: &mut InferenceData,
        kind: PredictionKind,
        data: Option<&DataFrame>,
        rng: &mut R,
    ) -> Result<()> {
        self.predict_with(idata, kind, data, true, rng)
    }

    pub fn predict_with<R: Rng + ?Sized>(
        &self,
        idata: &mut InferenceData,
        kind: PredictionKind,
        data: Option<&DataFrame>,
        include_group_specific: bool,
        rng: &mut R,
    ) -> Result<()> {
        match kind {
            PredictionKind::Mean => {
                self.insert_means(&mut idata.posterior, data, include_group_specific)
            }
            PredictionKind::Pps => {
                let pps =
                    self.posterior_predictive(&idata.posterior, data, include_group_specific, rng)?;
                idata.posterior_predictive = Some(pps);
                Ok(())
            }
        }
    }

    pub(crate) fn insert_means(
        &self,
        posterior: &mut Dataset,
        data: Option<&DataFrame>,
        include_group_specific: bool,
    ) -> Result<()> {
        let levels = self.response_component.response_levels().map(<[String]>::to_vec);
        let mean = self.response_component.predict(
            posterior,
            data,
            include_group_specific,
            &self.family,
            levels.as_deref(),
        )?;
        let mut outputs = vec![(self.response_component.var_name(), mean)];
        for component in &self.distributional {
            let values =
                component.predict(posterior, data, include_group_specific, &self.family, None)?;
            outputs.push((component.var_name(), values));
        }
        for (name, values) in outputs {
            posterior.insert(name, values);
        }
        Ok(())
    }

    /// Parameter draws of every observation, in the order of the
    /// likelihood parameters.
    fn parameter_draws(
        &self,
        posterior: &Dataset,
        data: Option<&DataFrame>,
        include_group_specific: bool,
    ) -> Result<Vec<DataArray>> {
        let levels = self.response_component.response_levels().map(<[String]>::to_vec);
        let mean = self.response_component.predict(
            posterior,
            data,
            include_group_specific,
            &self.family,
            levels.as_deref(),
        )?;
        if self.family.is_multivariate() {
            return Ok(vec![mean]);
        }
        let n = data.map_or(self.n_obs(), DataFrame::nrows);
        let parent = self.family.likelihood().parent();
        let mut out = Vec::with_capacity(self.family.likelihood().params().len());
        for param in self.family.likelihood().params() {
            if param == parent {
                out.push(mean.clone());
            } else if let Some(c) = self.distributional.iter().find(|c| c.name() == param) {
                out.push(c.predict(posterior, data, include_group_specific, &self.family, None)?);
            } else if let Some(c) = self.constants.iter().find(|c| c.param() == param) {
                out.push(c.predict(posterior, self.response_var(), n)?);
            } else {
                return Err(ModelError::MissingPrior(param.clone()));
            }
        }
        Ok(out)
    }

    fn trials(&self, data: Option<&DataFrame>) -> Result<Option<Vec<f64>>> {
        let Some(data) = data else {
            return Ok(self.response_component.response_term().and_then(|t| t.trials()));
        };
        match &self.main.response {
            Some(ResponseSpec::Binomial { trials, .. }) => Ok(Some(match trials {
                Trials::Variable(name) => data.numeric(name)?.to_vec(),
                Trials::Fixed(n) => vec![*n; data.nrows()],
            })),
            Some(ResponseSpec::Multinomial(vars)) => {
                let columns = vars
                    .iter()
                    .map(|v| data.numeric(v))
                    .collect::<std::result::Result<Vec<_>, DataError>>()?;
                Ok(Some((0..data.nrows()).map(|i| columns.iter().map(|c| c[i]).sum()).collect()))
            }
            _ => Ok(None),
        }
    }

    fn posterior_predictive<R: Rng + ?Sized>(
        &self,
        posterior: &Dataset,
        data: Option<&DataFrame>,
        include_group_specific: bool,
        rng: &mut R,
    ) -> Result<Dataset> {
        let params = self.parameter_draws(posterior, data, include_group_specific)?;
        let trials = self.trials(data)?;
        let resp = self.response_var().to_string();
        let obs = Dim::obs(&resp);
        let name = self.family.likelihood().name();
        let trial = |i: usize| trials.as_ref().map_or(0.0, |t| t[i]);

        let array = if self.family.is_multivariate() {
            let probs = &params[0];
            let shape = probs.shape().to_vec();
            let (chains, draws, n, k) = (shape[0], shape[1], shape[2], shape[3]);
            let values = probs.values();
            let mut p = vec![0.0; k];
            if name == "Multinomial" {
                let mut out = ArrayD::<f64>::zeros(IxDyn(&[chains, draws, n, k]));
                for c in 0..chains {
                    for d in 0..draws {
                        for i in 0..n {
                            p.iter_mut().enumerate().for_each(|(l, v)| *v = values[[c, d, i, l]]);
                            let trials = trial(i).round() as u64;
                            let counts = observation::sample_multinomial(trials, &p, rng)?;
                            for (l, count) in counts.into_iter().enumerate() {
                                out[[c, d, i, l]] = count;
                            }
                        }
                    }
                }
                let mean_dim = Dim::mean_levels(&resp);
                let labels = probs.coords(&mean_dim).map(<[String]>::to_vec);
                let dims = vec![Dim::chain(), Dim::draw(), obs.clone(), mean_dim.clone()];
                let array = DataArray::new(dims, out)?;
                match labels {
                    Some(labels) => array.with_coords(&mean_dim, labels)?,
                    None => array,
                }
            } else {
                let out = Array3::from_shape_fn((chains, draws, n), |(c, d, i)| {
                    p.iter_mut().enumerate().for_each(|(l, v)| *v = values[[c, d, i, l]]);
                    observation::sample_categorical(&p, rng) as f64
                });
                DataArray::new(vec![Dim::chain(), Dim::draw(), obs.clone()], out.into_dyn())?
            }
        } else {
            let views = params.iter().map(as_obs_draws).collect::<Result<Vec<_>>>()?;
            let (chains, draws, n) = views[0].dim();
            let mut out = Array3::<f64>::zeros((chains, draws, n));
            let mut values = vec![0.0; views.len()];
            for ((c, d, i), slot) in out.indexed_iter_mut() {
                for (v, view) in values.iter_mut().zip(&views) {
                    *v = view[[c, d, i]];
                }
                *slot = observation::sample(name, trial(i), &values, rng)?;
            }
            DataArray::new(vec![Dim::chain(), Dim::draw(), obs.clone()], out.into_dyn())?
        };
        let n = array.len_of(&obs).unwrap_or(0);
        let mut dataset = Dataset::new();
        dataset.insert(resp, array.with_coords(&obs, (0..n).map(|i| i.to_string()).collect())?);
        Ok(dataset)
    }

    /// Draws from the priors and the prior predictive distribution of the
    /// response on the training data.
    pub fn prior_predictive<R: Rng + ?Sized>(
        &self,
        draws: usize,
        rng: &mut R,
    ) -> Result<InferenceData> {
        let layout = Layout::new(&self.build()?)?;
        let samples = (0..draws)
            .map(|_| layout.sample_prior(rng))
            .collect::<Result<Vec<_>>>()?;
        let prior = layout.to_dataset(&[samples])?;
        let predictive = self.posterior_predictive(&prior, None, true, rng)?;
        Ok(InferenceData {
            prior: Some(prior),
            prior_predictive: Some(predictive),
            observed_data: Some(self.observed_data()?),
            ..Default::default()
        })
    }
}

fn as_obs_draws(array: &DataArray) -> Result<ArrayView3<'_, f64>> {
    array
        .values()
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| ModelError::Dimension {
            name: "parameters".to_string(),
            reason: e.to_string(),
        })
}

fn alias_distributional(component: &mut DistributionalComponent, name: &str, alias: &str) -> bool {
    if name == component.name() {
        component.set_alias(alias.to_string());
        return true;
    }
    match component.term_mut(name) {
        Some(term) => {
            term.set_alias(alias.to_string());
            true
        }
        None => false,
    }
}

fn drop_missing(data: DataFrame, variables: &[String], dropna: bool) -> Result<DataFrame> {
    let rows = data.complete_rows(variables)?;
    let total = data.nrows();
    if rows.len() == total {
        return Ok(data);
    }
    if !dropna {
        let column = variables
            .iter()
            .find(|v| data.get(v).is_some_and(|c| c.has_missing()))
            .cloned()
            .unwrap_or_default();
        return Err(DataError::MissingValues(column).into());
    }
    if rows.is_empty() {
        return Err(ModelError::NoObservations);
    }
    log::info!(
        "Automatically removing {}/{} rows from the dataset.",
        total - rows.len(),
        total
    );
    Ok(data.take_rows(&rows))
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "       Formula: {}", self.formula)?;
        writeln!(f, "        Family: {}", self.family.name())?;
        let links = self
            .family
            .links()
            .iter()
            .map(|(p, l)| format!("{p} = {l}"))
            .join("\n                ");
        writeln!(f, "          Link: {links}")?;
        writeln!(f, "  Observations: {}", self.n_obs())?;
        writeln!(f, "        Priors: ")?;
        for component in std::iter::once(&self.response_component).chain(&self.distributional) {
            let target = match component.kind() {
                ComponentKind::Data => self.family.likelihood().parent(),
                ComponentKind::Parameter => component.name(),
            };
            writeln!(f, "    target = {target}")?;
            let lines: Vec<String> = component
                .terms()
                .flat_map(|(_, term)| match (term, term.prior()) {
                    (Term::Hsgp(t), _) => t
                        .priors()
                        .iter()
                        .map(|(k, p)| format!("{}_{k} ~ {p}", term.var_name()))
                        .collect(),
                    (_, Some(prior)) => vec![format!("{} ~ {prior}", term.var_name())],
                    _ => vec![],
                })
                .collect();
            for line in lines {
                writeln!(f, "        {line}")?;
            }
        }
        if !self.constants.is_empty() {
            writeln!(f, "    Auxiliary parameters")?;
            for constant in &self.constants {
                writeln!(f, "        {} ~ {}", constant.var_name(), constant.prior())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{self, Column};
    use approx::assert_relative_eq;
    use ndarray::Array2;
    use pretty_assertions::assert_eq;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn data() -> DataFrame {
        let x: Vec<f64> = (0..12).map(|i| i as f64 / 2.0).collect();
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, x)| 1.0 + 2.0 * x + (i % 3) as f64 * 0.1)
            .collect();
        let g: Vec<String> = (0..12).map(|i| ["a", "b", "c"][i % 3].to_string()).collect();
        DataFrame::from_columns([
            ("y", Column::Numeric(y)),
            ("x", Column::Numeric(x)),
            ("g", Column::Categorical(g)),
        ])
        .unwrap()
    }

    fn scalar_draws(value: f64) -> DataArray {
        DataArray::from_draws(Array2::from_elem((1, 3), value))
    }

    #[test]
    fn builds_components_and_constants() {
        let model = Model::new("y ~ x + (1 | g)", data()).unwrap();
        assert_eq!(model.response_name(), "y");
        assert_eq!(model.term_names(), vec!["Intercept", "x", "1|g"]);
        assert_eq!(model.constant_components().len(), 1);
        assert_eq!(model.constant_components()[0].name(), "y_sigma");
        assert_eq!(model.covariates(), vec!["x", "g"]);
        assert_eq!(model.n_obs(), 12);
    }

    #[test]
    fn default_priors_are_scaled_from_the_data() {
        let d = data();
        let y = d.numeric("y").unwrap().to_vec();
        let model = Model::new("y ~ x", d).unwrap();
        let intercept = model.response_component().term("Intercept").unwrap().prior().unwrap();
        assert_relative_eq!(intercept.scalar("mu").unwrap(), data::mean(&y), epsilon = 1e-12);
        assert_relative_eq!(
            intercept.scalar("sigma").unwrap(),
            2.5 * data::std(&y),
            epsilon = 1e-12
        );
        match model.constant_components()[0].prior() {
            PriorSpec::Prior(p) => {
                assert_eq!(p.name(), "Exponential");
                assert_relative_eq!(p.scalar("lam").unwrap(), 1.0 / data::std(&y), epsilon = 1e-12);
            }
            other => panic!("unexpected prior {other}"),
        }
    }

    #[test]
    fn user_priors_are_not_scaled() {
        let mut model = Model::new("y ~ x + (1 | g)", data()).unwrap();
        let common = Prior::new("Normal").with("mu", 0.0).with("sigma", 10.0);
        model
            .set_priors(
                vec![("sigma".to_string(), PriorSpec::Constant(0.5))],
                Some(common.clone()),
                None,
            )
            .unwrap();
        assert_eq!(model.response_component().term("x").unwrap().prior(), Some(&common));
        assert_eq!(model.constant_components()[0].prior(), &PriorSpec::Constant(0.5));
        // the intercept keeps its scaled default
        let intercept = model.response_component().term("Intercept").unwrap().prior().unwrap();
        assert!(intercept.scalar("mu").unwrap() > 0.0);
    }

    #[test]
    fn bad_prior_targets_fail() {
        let mut model = Model::new("y ~ x", data()).unwrap();
        assert!(matches!(
            model.set_priors(vec![("w".to_string(), PriorSpec::Constant(1.0))], None, None),
            Err(ModelError::TermNotFound(_))
        ));
        assert!(matches!(
            model.set_priors(vec![("x".to_string(), PriorSpec::Constant(1.0))], None, None),
            Err(ModelError::InvalidPrior(_))
        ));
        let hyper = Prior::new("Normal").with("mu", 0.0).with("sigma", Prior::new("HalfNormal"));
        assert!(matches!(
            model.set_priors(vec![("x".to_string(), hyper.into())], None, None),
            Err(ModelError::HyperpriorOnCommon(_))
        ));
    }

    #[test]
    fn distributional_formulas_must_name_auxiliary_parameters() {
        let formula = Formula::new("y ~ x").with_additional(["mu ~ x"]);
        assert!(matches!(
            Model::new(formula, data()),
            Err(ModelError::UnknownParameter { .. })
        ));
        let formula = Formula::new("y ~ x").with_additional(["sigma ~ x"]);
        let model = Model::new(formula, data()).unwrap();
        assert!(model.constant_components().is_empty());
        assert_eq!(model.term_names(), vec!["Intercept", "x", "sigma_Intercept", "sigma_x"]);
    }

    #[test]
    fn missing_values_are_dropped_on_request() {
        let mut d = data();
        let mut x = d.numeric("x").unwrap().to_vec();
        x[3] = f64::NAN;
        d.insert("x", Column::Numeric(x)).unwrap();
        assert!(matches!(
            Model::new("y ~ x", d.clone()),
            Err(ModelError::Data(DataError::MissingValues(_)))
        ));
        let options = ModelOptions {
            dropna: true,
            ..Default::default()
        };
        let model = Model::with_options("y ~ x", d, options).unwrap();
        assert_eq!(model.n_obs(), 11);
    }

    #[test]
    fn aliases_rename_posterior_variables() {
        let mut model = Model::new("y ~ x", data()).unwrap();
        model.set_alias([("Intercept", "a"), ("x", "b"), ("sigma", "s"), ("y", "response")]);
        let spec = model.build().unwrap();
        let names: Vec<String> = spec.predictors[0].blocks.iter().map(|b| b.name.clone()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(spec.constants[0].name, "s");
        assert_eq!(model.response_component().var_name(), "response_mean");

        // unmatched names are skipped
        model.set_alias([("unused", "u")]);
        assert_eq!(model.response_var(), "response");
    }

    #[test]
    fn nested_aliases_reach_distributional_components() {
        let formula = Formula::new("y ~ x").with_additional(["sigma ~ x"]);
        let mut model = Model::new(formula, data()).unwrap();
        model.set_alias(Aliases::Nested(vec![
            (
                "y".to_string(),
                vec![
                    ("Intercept".to_string(), "y_a".to_string()),
                    ("y".to_string(), "response".to_string()),
                ],
            ),
            (
                "sigma".to_string(),
                vec![
                    ("x".to_string(), "sigma_b".to_string()),
                    ("sigma".to_string(), "s".to_string()),
                ],
            ),
        ]));
        let sigma = &model.components()[0];
        assert_eq!(sigma.var_name(), "s");
        assert_eq!(sigma.term("x").unwrap().var_name(), "sigma_b");
        assert_eq!(sigma.response_var(), "response");
        assert_eq!(model.response_component().term("Intercept").unwrap().var_name(), "y_a");
    }

    #[test]
    fn predictions_from_given_draws() {
        let model = Model::new("y ~ x", data()).unwrap();
        let mut posterior = Dataset::new();
        posterior.insert("Intercept", scalar_draws(1.0));
        posterior.insert("x", scalar_draws(2.0));
        posterior.insert("y_sigma", scalar_draws(1e-6));
        let mut idata = InferenceData::new(posterior);
        let mut rng = SmallRng::seed_from_u64(3);

        model.predict(&mut idata, PredictionKind::Mean, None, &mut rng).unwrap();
        let mean = idata.posterior.require("y_mean").unwrap();
        assert_eq!(mean.shape(), &[1, 3, 12]);
        assert_relative_eq!(mean.values()[[0, 0, 4]], 1.0 + 2.0 * 2.0);

        let new = DataFrame::from_columns([("x", Column::Numeric(vec![10.0]))]).unwrap();
        model.predict(&mut idata, PredictionKind::Pps, Some(&new), &mut rng).unwrap();
        let pps = idata.posterior_predictive.as_ref().unwrap().require("y").unwrap();
        assert_eq!(pps.shape(), &[1, 3, 1]);
        assert_relative_eq!(pps.values()[[0, 1, 0]], 21.0, epsilon = 1e-3);
    }

    #[test]
    fn build_is_idempotent() {
        let model = Model::new("y ~ x + (1 | g)", data()).unwrap();
        assert_eq!(model.build().unwrap(), model.build().unwrap());
    }

    #[test]
    fn summary_lists_priors() {
        let model = Model::new("y ~ x", data()).unwrap();
        let summary = model.to_string();
        assert!(summary.contains("Family: gaussian"));
        assert!(summary.contains("Observations: 12"));
        assert!(summary.contains("x ~ Normal("));
        assert!(summary.contains("y_sigma ~ Exponential("));
    }
}
