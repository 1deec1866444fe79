use ndarray::ArrayView2;

use crate::data;
use crate::priors::{Prior, PriorArg};

/// Rescales default priors from empirical statistics of the response and
/// the predictors, in the spirit of rstanarm.
///
/// Every method is a pure function of the declared prior: scaling the
/// same declaration twice gives the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorScaler {
    response_mean: f64,
    response_std: f64,
    gaussian: bool,
}

impl PriorScaler {
    /// Standard deviation multiplier.
    pub const STD: f64 = 2.5;

    /// Response statistics are only used for the gaussian family, other
    /// families use a mean of 0 and a standard deviation of 1.
    pub fn new(family: &str, response: &[f64]) -> Self {
        if family == "gaussian" && !response.is_empty() {
            let std = data::std(response);
            Self {
                response_mean: data::mean(response),
                response_std: if std > 0.0 && std.is_finite() { std } else { 1.0 },
                gaussian: true,
            }
        } else {
            Self {
                response_mean: 0.0,
                response_std: 1.0,
                gaussian: false,
            }
        }
    }

    pub fn response_mean(&self) -> f64 {
        self.response_mean
    }

    pub fn response_std(&self) -> f64 {
        self.response_std
    }

    /// Prior of the response scale. Only the gaussian family is scaled.
    pub fn scale_response(&self, declared: &Prior) -> Prior {
        if !self.gaussian {
            return declared.clone();
        }
        Prior::new("Exponential").with("lam", 1.0 / self.response_std)
    }

    pub fn scale_intercept(&self, declared: &Prior) -> Prior {
        let mut prior = declared.clone();
        if prior.name() != "Normal" {
            return prior;
        }
        let (mu, sigma) = self.intercept_stats();
        prior.update("mu", mu);
        prior.update("sigma", sigma);
        prior
    }

    /// One `sigma` per column of the term, `mu` is zero.
    pub fn scale_common(&self, declared: &Prior, data: ArrayView2<f64>) -> Prior {
        let mut prior = declared.clone();
        if prior.name() != "Normal" {
            return prior;
        }
        let sigma: Vec<f64> = data
            .columns()
            .into_iter()
            .map(|x| self.slope_sigma(&x.to_vec()))
            .collect();
        prior.update("mu", vec![0.0; sigma.len()]);
        prior.update("sigma", sigma);
        prior
    }

    /// Scales the `sigma` hyperprior of a group specific term from the data
    /// of the same term used as a common effect. Only `HalfNormal`
    /// hyperpriors are scaled.
    pub fn scale_group_specific(
        &self,
        declared: &Prior,
        predictor: ArrayView2<f64>,
        intercept: bool,
    ) -> Prior {
        let mut prior = declared.clone();
        let scalable = prior
            .hyperprior("sigma")
            .is_some_and(|hyper| hyper.name() == "HalfNormal");
        if !scalable {
            return prior;
        }
        let sigma = if intercept {
            PriorArg::Scalar(self.intercept_stats().1)
        } else {
            PriorArg::Vector(
                predictor
                    .columns()
                    .into_iter()
                    .map(|x| self.slope_sigma(&x.to_vec()))
                    .collect(),
            )
        };
        if let Some(PriorArg::Prior(hyper)) = prior.arg_mut("sigma") {
            hyper.update("sigma", sigma);
        }
        prior
    }

    fn intercept_stats(&self) -> (f64, f64) {
        (self.response_mean, Self::STD * self.response_std)
    }

    /// A constant column falls back to the intercept scale.
    fn slope_sigma(&self, x: &[f64]) -> f64 {
        let std = data::std(x);
        if std > 0.0 && std.is_finite() {
            Self::STD * self.response_std / std
        } else {
            Self::STD * self.response_std
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use pretty_assertions::assert_eq;

    fn scaler() -> PriorScaler {
        // mean 2.5, population std sqrt(1.25)
        PriorScaler::new("gaussian", &[1.0, 2.0, 3.0, 4.0])
    }

    #[test]
    fn intercept_uses_response_statistics() {
        let declared = Prior::new("Normal").with("mu", 0.0).with("sigma", 1.0);
        let prior = scaler().scale_intercept(&declared);
        assert_relative_eq!(prior.scalar("mu").unwrap(), 2.5);
        assert_relative_eq!(prior.scalar("sigma").unwrap(), 2.5 * 1.25f64.sqrt());
    }

    #[test]
    fn slopes_scale_per_column() {
        let x = array![[0.0, 1.0], [2.0, 1.0], [0.0, 1.0], [2.0, 1.0]];
        let prior = scaler().scale_common(&Prior::new("Normal"), x.view());
        let Some(PriorArg::Vector(sigma)) = prior.arg("sigma") else {
            panic!("expected a vector of sigmas");
        };
        assert_relative_eq!(sigma[0], 2.5 * 1.25f64.sqrt() / 1.0);
        // constant column
        assert_relative_eq!(sigma[1], 2.5 * 1.25f64.sqrt());
        assert_eq!(prior.arg("mu"), Some(&PriorArg::Vector(vec![0.0, 0.0])));
    }

    #[test]
    fn non_normal_priors_are_left_alone() {
        let declared = Prior::new("StudentT").with("nu", 3.0);
        let x = array![[0.0], [1.0]];
        assert_eq!(scaler().scale_common(&declared, x.view()), declared);
        assert_eq!(scaler().scale_intercept(&declared), declared);
    }

    #[test]
    fn group_specific_scales_only_half_normal() {
        let x = array![[1.0], [1.0]];
        let declared = crate::priors::default_group_specific();
        let scaled = scaler().scale_group_specific(&declared, x.view(), true);
        assert_relative_eq!(
            scaled.hyperprior("sigma").unwrap().scalar("sigma").unwrap(),
            2.5 * 1.25f64.sqrt()
        );
        let cauchy = Prior::new("Normal").with("sigma", Prior::new("HalfCauchy").with("beta", 1.0));
        assert_eq!(scaler().scale_group_specific(&cauchy, x.view(), true), cauchy);
    }

    #[test]
    fn scaling_is_idempotent() {
        let s = scaler();
        let declared = Prior::new("Normal").with("mu", 0.0).with("sigma", 1.0);
        let x = array![[0.5], [1.5], [3.0]];
        let once = s.scale_common(&declared, x.view());
        let twice = s.scale_common(&declared, x.view());
        assert_eq!(once, twice);
        let student = Prior::new("HalfStudentT");
        assert_eq!(s.scale_response(&student), s.scale_response(&student));
    }

    #[test]
    fn non_gaussian_families_use_unit_scale() {
        let s = PriorScaler::new("bernoulli", &[0.0, 1.0, 1.0]);
        assert_eq!(s.response_mean(), 0.0);
        assert_eq!(s.response_std(), 1.0);
        let declared = Prior::new("HalfStudentT").with("nu", 4.0);
        assert_eq!(s.scale_response(&declared), declared);
    }
}
