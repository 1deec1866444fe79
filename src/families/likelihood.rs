use std::fmt;

use itertools::Itertools;

use crate::error::{ModelError, Result};

/// Parameters and parent parameter of a known distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistSettings {
    pub name: &'static str,
    pub params: &'static [&'static str],
    pub parent: &'static str,
}

pub const DISTRIBUTIONS: &[DistSettings] = &[
    DistSettings { name: "Bernoulli", params: &["p"], parent: "p" },
    DistSettings { name: "Beta", params: &["mu", "kappa"], parent: "mu" },
    DistSettings { name: "Binomial", params: &["p"], parent: "p" },
    DistSettings { name: "Categorical", params: &["p"], parent: "p" },
    DistSettings { name: "Gamma", params: &["mu", "alpha"], parent: "mu" },
    DistSettings { name: "Multinomial", params: &["p"], parent: "p" },
    DistSettings { name: "Normal", params: &["mu", "sigma"], parent: "mu" },
    DistSettings { name: "NegativeBinomial", params: &["mu", "alpha"], parent: "mu" },
    DistSettings { name: "Laplace", params: &["mu", "b"], parent: "mu" },
    DistSettings { name: "Poisson", params: &["mu"], parent: "mu" },
    DistSettings { name: "StudentT", params: &["mu", "sigma", "nu"], parent: "mu" },
    DistSettings { name: "VonMises", params: &["mu", "kappa"], parent: "mu" },
    DistSettings { name: "Wald", params: &["mu", "lam"], parent: "mu" },
];

pub fn known_distribution(name: &str) -> Option<&'static DistSettings> {
    DISTRIBUTIONS.iter().find(|d| d.name == name)
}

/// The distribution of the response: its parameters and the parameter
/// that receives the linear predictor.
///
/// Names found in [`DISTRIBUTIONS`] are validated against the registry.
/// Other names are accepted as they are, but must list their parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Likelihood {
    name: String,
    params: Vec<String>,
    parent: String,
}

impl Likelihood {
    /// A registered likelihood with its default parameters and parent.
    pub fn new(name: &str) -> Result<Self> {
        Self::with_params(name, None, None)
    }

    pub fn with_params(name: &str, params: Option<&[&str]>, parent: Option<&str>) -> Result<Self> {
        let (params, parent) = match known_distribution(name) {
            Some(known) => {
                let params = match params {
                    None => known.params.iter().map(|p| p.to_string()).collect(),
                    Some(given) => {
                        let same = given.len() == known.params.len()
                            && given.iter().all(|p| known.params.contains(p));
                        if !same {
                            return Err(ModelError::LikelihoodParams {
                                value: format!("[{}]", given.iter().join(", ")),
                                name: name.to_string(),
                            });
                        }
                        given.iter().map(|p| p.to_string()).collect()
                    }
                };
                let parent = match parent {
                    None => known.parent.to_string(),
                    Some(p) if known.params.contains(&p) => p.to_string(),
                    Some(p) => {
                        return Err(ModelError::LikelihoodParent {
                            value: p.to_string(),
                            name: name.to_string(),
                        })
                    }
                };
                (params, parent)
            }
            None => {
                let params: Vec<String> = match params {
                    Some(given) if !given.is_empty() => {
                        given.iter().map(|p| p.to_string()).collect()
                    }
                    _ => return Err(ModelError::MissingLikelihoodParams(name.to_string())),
                };
                let parent = parent.unwrap_or(params[0].as_str()).to_string();
                if !params.contains(&parent) {
                    return Err(ModelError::UnknownParent {
                        value: parent,
                        params: format!("[{}]", params.iter().join(", ")),
                    });
                }
                (params, parent)
            }
        };
        Ok(Self {
            name: name.to_string(),
            params,
            parent,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }

    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Parameters other than the parent, in declaration order.
    pub fn auxiliary_params(&self) -> impl Iterator<Item = &str> {
        self.params
            .iter()
            .map(String::as_str)
            .filter(move |p| *p != self.parent)
    }

    pub fn is_known(&self) -> bool {
        known_distribution(&self.name).is_some()
    }
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Likelihood(name: {}, params: [{}], parent: {})",
            self.name,
            self.params.iter().join(", "),
            self.parent
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn registry_defaults_are_used() {
        for known in DISTRIBUTIONS {
            let lik = Likelihood::new(known.name).unwrap();
            assert_eq!(lik.params(), known.params);
            assert_eq!(lik.parent(), known.parent);
        }
    }

    #[test]
    fn params_must_match_the_registry() {
        let err = Likelihood::with_params("Normal", Some(&["mu", "tau"]), None).unwrap_err();
        assert_eq!(err.to_string(), "'[mu, tau]' does not match the parameters of 'Normal'");
        // order does not matter
        let lik = Likelihood::with_params("Normal", Some(&["sigma", "mu"]), None).unwrap();
        assert_eq!(lik.parent(), "mu");
    }

    #[test]
    fn unknown_names_skip_validation() {
        let lik =
            Likelihood::with_params("Weibull", Some(&["alpha", "beta"]), Some("beta")).unwrap();
        assert_eq!(lik.parent(), "beta");
        assert_eq!(lik.auxiliary_params().collect::<Vec<_>>(), vec!["alpha"]);
        assert!(!lik.is_known());
        let err = Likelihood::with_params("Weibull", Some(&["alpha"]), Some("beta")).unwrap_err();
        assert_eq!(err.to_string(), "'beta' must be one of [alpha]");
        assert!(Likelihood::new("Weibull").is_err());
    }

    proptest! {
        #[test]
        fn parents_outside_the_registry_are_rejected(
            idx in 0..DISTRIBUTIONS.len(),
            parent in "[a-z]{1,6}",
        ) {
            let known = &DISTRIBUTIONS[idx];
            let result = Likelihood::with_params(known.name, None, Some(&parent));
            if known.params.contains(&parent.as_str()) {
                let likelihood = result.unwrap();
                prop_assert_eq!(likelihood.parent(), parent.as_str());
            } else {
                let is_parent_error = matches!(result, Err(ModelError::LikelihoodParent { .. }));
                prop_assert!(is_parent_error);
            }
        }
    }
}
