use std::fmt;

use itertools::Itertools;

use crate::error::{ModelError, Result};
use crate::families::link::SUPPORTED_LINKS;
use crate::families::{Likelihood, Link};
use crate::priors::{Prior, PriorSpec};

/// Which link names a family accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum SupportedLinks {
    /// Any of [`SUPPORTED_LINKS`], for every parameter.
    Any,
    /// The same list for every parameter.
    Shared(&'static [&'static str]),
    /// A list per parameter.
    PerParam(Vec<(&'static str, &'static [&'static str])>),
}

impl SupportedLinks {
    fn for_param(&self, param: &str) -> &[&'static str] {
        match self {
            SupportedLinks::Any => SUPPORTED_LINKS,
            SupportedLinks::Shared(links) => links,
            SupportedLinks::PerParam(map) => map
                .iter()
                .find(|(p, _)| *p == param)
                .map(|(_, links)| *links)
                .unwrap_or(&[]),
        }
    }
}

/// A link given by name or as a function pair.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkChoice {
    Name(String),
    Link(Link),
}

impl From<&str> for LinkChoice {
    fn from(value: &str) -> Self {
        LinkChoice::Name(value.to_string())
    }
}

impl From<String> for LinkChoice {
    fn from(value: String) -> Self {
        LinkChoice::Name(value)
    }
}

impl From<Link> for LinkChoice {
    fn from(value: Link) -> Self {
        LinkChoice::Link(value)
    }
}

/// A single link, bound to the parent parameter, or one link per parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSpec {
    Parent(LinkChoice),
    PerParam(Vec<(String, LinkChoice)>),
}

impl From<&str> for LinkSpec {
    fn from(value: &str) -> Self {
        LinkSpec::Parent(value.into())
    }
}

impl From<String> for LinkSpec {
    fn from(value: String) -> Self {
        LinkSpec::Parent(value.into())
    }
}

impl From<Link> for LinkSpec {
    fn from(value: Link) -> Self {
        LinkSpec::Parent(value.into())
    }
}

impl<K: Into<String>, V: Into<LinkChoice>> FromIterator<(K, V)> for LinkSpec {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        LinkSpec::PerParam(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A likelihood, the links of its parameters and the default priors of the
/// auxiliary parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Family {
    name: String,
    likelihood: Likelihood,
    link: Vec<(String, Link)>,
    default_priors: Vec<(String, PriorSpec)>,
    supported_links: SupportedLinks,
    multivariate: bool,
}

impl Family {
    /// A custom family. Every name in [`SUPPORTED_LINKS`] is accepted.
    pub fn new(name: &str, likelihood: Likelihood, link: impl Into<LinkSpec>) -> Result<Self> {
        let mut family = Self {
            name: name.to_string(),
            likelihood,
            link: Vec::new(),
            default_priors: Vec::new(),
            supported_links: SupportedLinks::Any,
            multivariate: false,
        };
        family.set_link(link)?;
        Ok(family)
    }

    /// One of the families shipped with the crate, with its default links
    /// and priors.
    pub fn builtin(name: &str) -> Result<Self> {
        let (dist, links, priors, multivariate): (&str, SupportedLinks, Vec<(&str, Prior)>, bool) =
            match name {
                "bernoulli" => ("Bernoulli", per(&[("p", BINARY)]), vec![], false),
                "binomial" => ("Binomial", per(&[("p", BINARY)]), vec![], false),
                "beta" => (
                    "Beta",
                    per(&[("mu", &["logit", "probit", "cloglog"]), ("kappa", &["log"])]),
                    vec![("kappa", half_cauchy(1.0))],
                    false,
                ),
                "gamma" => (
                    "Gamma",
                    per(&[("mu", &["inverse", "identity", "log"]), ("alpha", &["log"])]),
                    vec![("alpha", half_cauchy(1.0))],
                    false,
                ),
                "gaussian" => (
                    "Normal",
                    per(&[("mu", &["identity", "log", "inverse"]), ("sigma", &["log"])]),
                    vec![("sigma", half_student_t(4.0, 1.0))],
                    false,
                ),
                "negativebinomial" => (
                    "NegativeBinomial",
                    per(&[("mu", &["log", "identity", "cloglog"]), ("alpha", &["log"])]),
                    vec![("alpha", half_cauchy(1.0))],
                    false,
                ),
                "laplace" => (
                    "Laplace",
                    per(&[("mu", &["identity", "log", "inverse"]), ("b", &["log"])]),
                    vec![("b", Prior::new("HalfNormal").with("sigma", 1.0))],
                    false,
                ),
                "poisson" => ("Poisson", per(&[("mu", &["log", "identity"])]), vec![], false),
                "t" => (
                    "StudentT",
                    per(&[
                        ("mu", &["identity", "log", "inverse"]),
                        ("sigma", &["log"]),
                        ("nu", &["log", "identity"]),
                    ]),
                    vec![
                        ("sigma", half_student_t(4.0, 1.0)),
                        ("nu", Prior::new("Gamma").with("alpha", 2.0).with("beta", 0.1)),
                    ],
                    false,
                ),
                "vonmises" => (
                    "VonMises",
                    per(&[("mu", &["tan_2", "identity"]), ("kappa", &["log"])]),
                    vec![("kappa", Prior::new("HalfNormal").with("sigma", 5.0))],
                    false,
                ),
                "wald" => (
                    "Wald",
                    per(&[
                        ("mu", &["inverse_squared", "inverse", "identity", "log"]),
                        ("lam", &["log"]),
                    ]),
                    vec![("lam", half_cauchy(1.0))],
                    false,
                ),
                "categorical" => {
                    ("Categorical", SupportedLinks::Shared(&["softmax"]), vec![], true)
                }
                "multinomial" => {
                    ("Multinomial", SupportedLinks::Shared(&["softmax"]), vec![], true)
                }
                other => return Err(ModelError::UnknownFamily(other.to_string())),
            };
        let likelihood = Likelihood::new(dist)?;
        // the first supported link is the default one
        let link = likelihood
            .params()
            .iter()
            .map(|param| {
                let default = links.for_param(param).first().copied().unwrap_or("identity");
                default.parse::<Link>().map(|link| (param.clone(), link))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut family = Self {
            name: name.to_string(),
            likelihood,
            link,
            default_priors: Vec::new(),
            supported_links: links,
            multivariate,
        };
        family.set_default_priors(priors.into_iter().map(|(k, v)| (k.to_string(), v.into())));
        Ok(family)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn likelihood(&self) -> &Likelihood {
        &self.likelihood
    }

    pub fn is_multivariate(&self) -> bool {
        self.multivariate
    }

    /// Updates the links. Parameters not named in `link` keep their current
    /// link.
    pub fn set_link(&mut self, link: impl Into<LinkSpec>) -> Result<()> {
        let entries = match link.into() {
            LinkSpec::Parent(choice) => vec![(self.likelihood.parent().to_string(), choice)],
            LinkSpec::PerParam(map) => map,
        };
        let mut resolved = Vec::with_capacity(entries.len());
        for (param, choice) in entries {
            if !self.likelihood.params().contains(&param) {
                return Err(ModelError::UnknownParameter {
                    param,
                    family: self.name.clone(),
                });
            }
            let link = match choice {
                LinkChoice::Link(link) => link,
                LinkChoice::Name(name) => self.check_string_link(&name, &param)?,
            };
            resolved.push((param, link));
        }
        for (param, link) in resolved {
            match self.link.iter_mut().find(|(p, _)| *p == param) {
                Some((_, slot)) => *slot = link,
                None => self.link.push((param, link)),
            }
        }
        Ok(())
    }

    fn check_string_link(&self, link: &str, param: &str) -> Result<Link> {
        if !self.supported_links.for_param(param).contains(&link) {
            return Err(ModelError::UnsupportedLink {
                link: link.to_string(),
                param: param.to_string(),
                family: self.name.clone(),
            });
        }
        link.parse()
    }

    pub fn links(&self) -> &[(String, Link)] {
        &self.link
    }

    /// Link of `param`. Parameters without an explicit link use identity.
    pub fn link(&self, param: &str) -> Link {
        self.link
            .iter()
            .find(|(p, _)| p == param)
            .map(|(_, l)| *l)
            .unwrap_or(Link::Identity)
    }

    pub fn parent_link(&self) -> Link {
        self.link(self.likelihood.parent())
    }

    pub fn supported_links(&self, param: &str) -> &[&'static str] {
        self.supported_links.for_param(param)
    }

    /// Sets default priors of non-parent parameters. Other keys are ignored.
    pub fn set_default_priors(&mut self, priors: impl IntoIterator<Item = (String, PriorSpec)>) {
        for (param, prior) in priors {
            if !self.likelihood.auxiliary_params().any(|p| p == param) {
                continue;
            }
            match self.default_priors.iter_mut().find(|(p, _)| *p == param) {
                Some((_, slot)) => *slot = prior,
                None => self.default_priors.push((param, prior)),
            }
        }
    }

    pub fn default_priors(&self) -> &[(String, PriorSpec)] {
        &self.default_priors
    }

    pub fn default_prior(&self, param: &str) -> Option<&PriorSpec> {
        self.default_priors
            .iter()
            .find(|(p, _)| p == param)
            .map(|(_, prior)| prior)
    }
}

const BINARY: &[&str] = &["logit", "identity", "probit", "cloglog"];

fn per(map: &[(&'static str, &'static [&'static str])]) -> SupportedLinks {
    SupportedLinks::PerParam(map.to_vec())
}

fn half_cauchy(beta: f64) -> Prior {
    Prior::new("HalfCauchy").with("beta", beta)
}

fn half_student_t(nu: f64, sigma: f64) -> Prior {
    Prior::new("HalfStudentT").with("nu", nu).with("sigma", sigma)
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Family: {}", self.name)?;
        writeln!(f, "Likelihood: {}", self.likelihood)?;
        write!(
            f,
            "Link: {}",
            self.link.iter().map(|(p, l)| format!("{p} -> {l}")).join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BUILTIN: &[&str] = &[
        "bernoulli",
        "beta",
        "binomial",
        "categorical",
        "gamma",
        "gaussian",
        "laplace",
        "multinomial",
        "negativebinomial",
        "poisson",
        "t",
        "vonmises",
        "wald",
    ];

    #[test]
    fn builtin_families_have_a_link_per_parameter() {
        for name in BUILTIN {
            let family = Family::builtin(name).unwrap();
            assert_eq!(family.links().len(), family.likelihood().params().len(), "{name}");
        }
        assert!(Family::builtin("lognormal").is_err());
    }

    #[test]
    fn every_listed_link_is_accepted() {
        for name in BUILTIN {
            let family = Family::builtin(name).unwrap();
            for param in family.likelihood().params() {
                for link in family.supported_links(param) {
                    let mut f = family.clone();
                    f.set_link(LinkSpec::PerParam(vec![(param.clone(), (*link).into())]))
                        .unwrap();
                    assert_eq!(f.link(param).name(), *link);
                }
            }
        }
    }

    #[test]
    fn unlisted_links_are_rejected() {
        let mut family = Family::builtin("bernoulli").unwrap();
        let err = family.set_link("log").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Link 'log' cannot be used for 'p' with family 'bernoulli'"
        );
        let mut family = Family::builtin("categorical").unwrap();
        assert!(family.set_link("logit").is_err());
        assert!(family.is_multivariate());
    }

    #[test]
    fn single_link_binds_to_the_parent() {
        let mut family = Family::builtin("gaussian").unwrap();
        family.set_link("log").unwrap();
        assert_eq!(family.link("mu"), Link::Log);
        assert_eq!(family.link("sigma"), Link::Log);
        family
            .set_link([("sigma", "log"), ("mu", "inverse")].into_iter().collect::<LinkSpec>())
            .unwrap();
        assert_eq!(family.parent_link(), Link::Inverse);
    }

    #[test]
    fn custom_links_and_families() {
        let likelihood = Likelihood::new("Normal").unwrap();
        let link = Link::custom("cube", |x| x.powi(3), |x| x.cbrt());
        let family = Family::new("cubic", likelihood, link).unwrap();
        assert_eq!(family.parent_link().name(), "cube");
        let likelihood = Likelihood::new("Normal").unwrap();
        let err = Family::new("bad", likelihood, [("tau", "log")].into_iter().collect::<LinkSpec>())
            .unwrap_err();
        assert!(matches!(err, ModelError::UnknownParameter { .. }));
    }

    #[test]
    fn default_priors_only_for_auxiliary_parameters() {
        let mut family = Family::builtin("gaussian").unwrap();
        family.set_default_priors(vec![
            ("mu".to_string(), Prior::new("Normal").into()),
            ("sigma".to_string(), PriorSpec::Constant(2.0)),
        ]);
        assert_eq!(family.default_prior("mu"), None);
        assert_eq!(family.default_prior("sigma"), Some(&PriorSpec::Constant(2.0)));
    }
}
