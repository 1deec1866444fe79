//! Log densities, supports and random draws for the prior distributions
//! understood by the built-in backend.

use std::f64::consts::{LN_2, PI};

use rand::Rng;
use rand_distr::{Beta, Cauchy, Distribution, Exp, Gamma, LogNormal, Normal, StudentT};
use statrs::function::gamma::ln_gamma;

use crate::error::{ModelError, Result};
use crate::priors::Prior;

pub const KNOWN_DISTRIBUTIONS: &[&str] = &[
    "Normal",
    "HalfNormal",
    "StudentT",
    "HalfStudentT",
    "Cauchy",
    "HalfCauchy",
    "Exponential",
    "Gamma",
    "InverseGamma",
    "Beta",
    "Uniform",
    "Laplace",
    "LogNormal",
    "Flat",
    "HalfFlat",
];

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Domain of a distribution, used to pick the unconstraining transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Support {
    Real,
    Positive,
    Interval(f64, f64),
}

/// A prior with every argument resolved to a number for one element.
#[derive(Debug, Clone, PartialEq)]
pub struct Density {
    name: String,
    args: Vec<(String, f64)>,
}

fn sampling_error(name: &str, reason: impl std::fmt::Display) -> ModelError {
    ModelError::Sampling {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

impl Density {
    /// Resolves the arguments of `prior` for column `idx`. Hyperprior
    /// arguments are looked up through `hyper`.
    pub fn resolve(
        prior: &Prior,
        idx: usize,
        hyper: &dyn Fn(&str, usize) -> Option<f64>,
    ) -> Result<Self> {
        if !KNOWN_DISTRIBUTIONS.contains(&prior.name()) {
            return Err(ModelError::InvalidPrior(prior.name().to_string()));
        }
        let mut args = Vec::with_capacity(prior.args().len());
        for (key, value) in prior.args() {
            let resolved = match value.value_at(idx).or_else(|| value.value_at(0)) {
                Some(x) => x,
                None => hyper(key, idx).ok_or_else(|| {
                    sampling_error(prior.name(), format!("no value for argument '{key}'"))
                })?,
            };
            args.push((key.clone(), resolved));
        }
        Ok(Self {
            name: prior.name().to_string(),
            args,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn arg_or(&self, key: &str, default: f64) -> f64 {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
            .unwrap_or(default)
    }

    fn arg(&self, key: &str) -> Result<f64> {
        self.args
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
            .ok_or_else(|| sampling_error(&self.name, format!("missing argument '{key}'")))
    }

    pub fn support(&self) -> Result<Support> {
        support_of(&self.name, &|key| self.args.iter().find(|(k, _)| k == key).map(|(_, v)| *v))
    }

    pub fn log_density(&self, x: f64) -> Result<f64> {
        let value = match self.name.as_str() {
            "Normal" => normal_lpdf(x, self.arg_or("mu", 0.0), self.arg_or("sigma", 1.0)),
            "HalfNormal" => half(x, normal_lpdf(x, 0.0, self.arg_or("sigma", 1.0))),
            "StudentT" => student_t_lpdf(
                x,
                self.arg("nu")?,
                self.arg_or("mu", 0.0),
                self.arg_or("sigma", 1.0),
            ),
            "HalfStudentT" => half(
                x,
                student_t_lpdf(x, self.arg("nu")?, 0.0, self.arg_or("sigma", 1.0)),
            ),
            "Cauchy" => cauchy_lpdf(x, self.arg_or("alpha", 0.0), self.arg_or("beta", 1.0)),
            "HalfCauchy" => half(x, cauchy_lpdf(x, 0.0, self.arg_or("beta", 1.0))),
            "Exponential" => {
                let lam = self.arg("lam")?;
                if x < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    lam.ln() - lam * x
                }
            }
            "Gamma" => {
                let (alpha, beta) = (self.arg("alpha")?, self.arg("beta")?);
                if x <= 0.0 {
                    f64::NEG_INFINITY
                } else {
                    alpha * beta.ln() - ln_gamma(alpha) + (alpha - 1.0) * x.ln() - beta * x
                }
            }
            "InverseGamma" => {
                let (alpha, beta) = (self.arg("alpha")?, self.arg("beta")?);
                if x <= 0.0 {
                    f64::NEG_INFINITY
                } else {
                    alpha * beta.ln() - ln_gamma(alpha) - (alpha + 1.0) * x.ln() - beta / x
                }
            }
            "Beta" => {
                let (a, b) = (self.arg("alpha")?, self.arg("beta")?);
                if x <= 0.0 || x >= 1.0 {
                    f64::NEG_INFINITY
                } else {
                    ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b)
                        + (a - 1.0) * x.ln()
                        + (b - 1.0) * (1.0 - x).ln()
                }
            }
            "Uniform" => {
                let (lower, upper) = (self.arg_or("lower", 0.0), self.arg_or("upper", 1.0));
                if x < lower || x > upper {
                    f64::NEG_INFINITY
                } else {
                    -(upper - lower).ln()
                }
            }
            "Laplace" => {
                let b = self.arg_or("b", 1.0);
                -(2.0 * b).ln() - (x - self.arg_or("mu", 0.0)).abs() / b
            }
            "LogNormal" => {
                if x <= 0.0 {
                    f64::NEG_INFINITY
                } else {
                    normal_lpdf(x.ln(), self.arg_or("mu", 0.0), self.arg_or("sigma", 1.0)) - x.ln()
                }
            }
            "Flat" => 0.0,
            "HalfFlat" => {
                if x < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    0.0
                }
            }
            other => return Err(ModelError::InvalidPrior(other.to_string())),
        };
        Ok(value)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        let name = self.name.as_str();
        let err = |e: &dyn std::fmt::Display| sampling_error(name, e);
        let value = match name {
            "Normal" => Normal::new(self.arg_or("mu", 0.0), self.arg_or("sigma", 1.0))
                .map_err(|e| err(&e))?
                .sample(rng),
            "HalfNormal" => Normal::new(0.0, self.arg_or("sigma", 1.0))
                .map_err(|e| err(&e))?
                .sample(rng)
                .abs(),
            "StudentT" => {
                let t = StudentT::new(self.arg("nu")?).map_err(|e| err(&e))?.sample(rng);
                self.arg_or("mu", 0.0) + self.arg_or("sigma", 1.0) * t
            }
            "HalfStudentT" => {
                let t = StudentT::new(self.arg("nu")?).map_err(|e| err(&e))?.sample(rng);
                (self.arg_or("sigma", 1.0) * t).abs()
            }
            "Cauchy" => Cauchy::new(self.arg_or("alpha", 0.0), self.arg_or("beta", 1.0))
                .map_err(|e| err(&e))?
                .sample(rng),
            "HalfCauchy" => Cauchy::new(0.0, self.arg_or("beta", 1.0))
                .map_err(|e| err(&e))?
                .sample(rng)
                .abs(),
            "Exponential" => Exp::new(self.arg("lam")?).map_err(|e| err(&e))?.sample(rng),
            "Gamma" => Gamma::new(self.arg("alpha")?, 1.0 / self.arg("beta")?)
                .map_err(|e| err(&e))?
                .sample(rng),
            "InverseGamma" => {
                let g = Gamma::new(self.arg("alpha")?, 1.0 / self.arg("beta")?)
                    .map_err(|e| err(&e))?
                    .sample(rng);
                1.0 / g
            }
            "Beta" => Beta::new(self.arg("alpha")?, self.arg("beta")?)
                .map_err(|e| err(&e))?
                .sample(rng),
            "Uniform" => {
                let (lower, upper) = (self.arg_or("lower", 0.0), self.arg_or("upper", 1.0));
                lower + (upper - lower) * rng.random::<f64>()
            }
            "Laplace" => {
                let u: f64 = rng.random::<f64>() - 0.5;
                self.arg_or("mu", 0.0)
                    - self.arg_or("b", 1.0) * u.signum() * (1.0 - 2.0 * u.abs()).ln()
            }
            "LogNormal" => LogNormal::new(self.arg_or("mu", 0.0), self.arg_or("sigma", 1.0))
                .map_err(|e| err(&e))?
                .sample(rng),
            other => {
                return Err(sampling_error(
                    other,
                    "improper distributions can not be sampled",
                ))
            }
        };
        Ok(value)
    }
}

/// Support of a named distribution. `arg` provides bounds for `Uniform`.
pub fn support_of(name: &str, arg: &dyn Fn(&str) -> Option<f64>) -> Result<Support> {
    let support = match name {
        "Normal" | "StudentT" | "Cauchy" | "Laplace" | "Flat" => Support::Real,
        "HalfNormal" | "HalfStudentT" | "HalfCauchy" | "Exponential" | "Gamma"
        | "InverseGamma" | "LogNormal" | "HalfFlat" => Support::Positive,
        "Beta" => Support::Interval(0.0, 1.0),
        "Uniform" => Support::Interval(arg("lower").unwrap_or(0.0), arg("upper").unwrap_or(1.0)),
        other => return Err(ModelError::InvalidPrior(other.to_string())),
    };
    Ok(support)
}

fn half(x: f64, full: f64) -> f64 {
    if x < 0.0 {
        f64::NEG_INFINITY
    } else {
        LN_2 + full
    }
}

pub(crate) fn normal_lpdf(x: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    -0.5 * LN_2PI - sigma.ln() - 0.5 * z * z
}

pub(crate) fn student_t_lpdf(x: f64, nu: f64, mu: f64, sigma: f64) -> f64 {
    let z = (x - mu) / sigma;
    ln_gamma((nu + 1.0) / 2.0) - ln_gamma(nu / 2.0) - 0.5 * (nu * PI).ln() - sigma.ln()
        - (nu + 1.0) / 2.0 * (1.0 + z * z / nu).ln()
}

fn cauchy_lpdf(x: f64, alpha: f64, beta: f64) -> f64 {
    let z = (x - alpha) / beta;
    -(PI * beta).ln() - (1.0 + z * z).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn density(prior: &Prior) -> Density {
        Density::resolve(prior, 0, &|_, _| None).unwrap()
    }

    #[test]
    fn normal_density_matches_closed_form() {
        let d = density(&Prior::new("Normal").with("mu", 1.0).with("sigma", 2.0));
        let expected = -0.5 * (2.0 * PI).ln() - 2f64.ln() - 0.5 * 0.25;
        assert_relative_eq!(d.log_density(2.0).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn half_distributions_reject_negative_values() {
        let d = density(&Prior::new("HalfNormal").with("sigma", 1.0));
        assert_eq!(d.log_density(-0.1).unwrap(), f64::NEG_INFINITY);
        assert_eq!(d.support().unwrap(), Support::Positive);
    }

    #[test]
    fn vector_arguments_resolve_per_column() {
        let prior = Prior::new("Normal").with("mu", 0.0).with("sigma", vec![1.0, 3.0]);
        let d = Density::resolve(&prior, 1, &|_, _| None).unwrap();
        assert_relative_eq!(
            d.log_density(0.0).unwrap(),
            normal_lpdf(0.0, 0.0, 3.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn hyperpriors_are_looked_up() {
        let prior = Prior::new("Normal")
            .with("mu", 0.0)
            .with("sigma", Prior::new("HalfNormal").with("sigma", 1.0));
        let d = Density::resolve(&prior, 0, &|key, _| (key == "sigma").then_some(4.0)).unwrap();
        assert_relative_eq!(
            d.log_density(1.0).unwrap(),
            normal_lpdf(1.0, 0.0, 4.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn unknown_distribution_is_invalid() {
        let err = Density::resolve(&Prior::new("Whatever"), 0, &|_, _| None).unwrap_err();
        assert_eq!(err.to_string(), "'Whatever' is not a valid prior.");
    }

    #[test]
    fn exponential_draws_have_expected_mean() {
        let d = density(&Prior::new("Exponential").with("lam", 2.0));
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let n = 20_000;
        let mean = (0..n).map(|_| d.sample(&mut rng).unwrap()).sum::<f64>() / n as f64;
        assert_relative_eq!(mean, 0.5, epsilon = 0.02);
    }

    #[test]
    fn flat_priors_can_not_be_sampled() {
        let d = density(&Prior::new("Flat"));
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(d.sample(&mut rng).is_err());
        assert_eq!(d.log_density(1e6).unwrap(), 0.0);
    }
}
