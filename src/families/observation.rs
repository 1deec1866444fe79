//! Log likelihood of single observations and posterior predictive draws for
//! the registered likelihoods. Parameters are passed in the order of the
//! registry entry, see [`super::DISTRIBUTIONS`].

use std::f64::consts::PI;

use rand::Rng;
use rand_distr::{Beta, Binomial, Distribution, Gamma, InverseGaussian, Normal, Poisson, StudentT};
use statrs::function::gamma::ln_gamma;

use crate::error::{ModelError, Result};
use crate::priors::{normal_lpdf, student_t_lpdf};

fn sampling_error(name: &str, reason: impl std::fmt::Display) -> ModelError {
    ModelError::Sampling {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

fn param(name: &str, params: &[f64], idx: usize) -> Result<f64> {
    params
        .get(idx)
        .copied()
        .ok_or_else(|| sampling_error(name, format!("expected at least {} parameters", idx + 1)))
}

/// Log density of `y` for a univariate likelihood. `trials` is only read
/// by `Binomial`.
pub fn log_likelihood(name: &str, y: f64, trials: f64, params: &[f64]) -> Result<f64> {
    let p = |idx| param(name, params, idx);
    let value = match name {
        "Normal" => normal_lpdf(y, p(0)?, p(1)?),
        "StudentT" => student_t_lpdf(y, p(2)?, p(0)?, p(1)?),
        "Laplace" => {
            let b = p(1)?;
            -(2.0 * b).ln() - (y - p(0)?).abs() / b
        }
        "Bernoulli" => {
            let prob = p(0)?;
            if y > 0.5 {
                prob.ln()
            } else {
                (1.0 - prob).ln()
            }
        }
        "Binomial" => {
            let prob = p(0)?;
            ln_choose(trials, y) + y * prob.ln() + (trials - y) * (1.0 - prob).ln()
        }
        "Poisson" => {
            let mu = p(0)?;
            y * mu.ln() - mu - ln_gamma(y + 1.0)
        }
        "NegativeBinomial" => {
            let (mu, alpha) = (p(0)?, p(1)?);
            ln_gamma(y + alpha) - ln_gamma(alpha) - ln_gamma(y + 1.0)
                + alpha * (alpha / (alpha + mu)).ln()
                + y * (mu / (alpha + mu)).ln()
        }
        "Gamma" => {
            let (mu, alpha) = (p(0)?, p(1)?);
            if y <= 0.0 {
                f64::NEG_INFINITY
            } else {
                alpha * (alpha / mu).ln() - ln_gamma(alpha) + (alpha - 1.0) * y.ln()
                    - alpha * y / mu
            }
        }
        "Beta" => {
            let (mu, kappa) = (p(0)?, p(1)?);
            let (a, b) = (mu * kappa, (1.0 - mu) * kappa);
            if y <= 0.0 || y >= 1.0 {
                f64::NEG_INFINITY
            } else {
                ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b)
                    + (a - 1.0) * y.ln()
                    + (b - 1.0) * (1.0 - y).ln()
            }
        }
        "VonMises" => {
            let (mu, kappa) = (p(0)?, p(1)?);
            kappa * (y - mu).cos() - (2.0 * PI).ln() - ln_bessel_i0(kappa)
        }
        "Wald" => {
            let (mu, lam) = (p(0)?, p(1)?);
            if y <= 0.0 {
                f64::NEG_INFINITY
            } else {
                0.5 * (lam / (2.0 * PI * y.powi(3))).ln()
                    - lam * (y - mu).powi(2) / (2.0 * mu * mu * y)
            }
        }
        other => {
            return Err(sampling_error(
                other,
                "no log density is available for this likelihood",
            ))
        }
    };
    Ok(value)
}

/// One posterior predictive draw for a univariate likelihood.
pub fn sample<R: Rng + ?Sized>(
    name: &str,
    trials: f64,
    params: &[f64],
    rng: &mut R,
) -> Result<f64> {
    let p = |idx| param(name, params, idx);
    let err = |e: &dyn std::fmt::Display| sampling_error(name, e);
    let value = match name {
        "Normal" => Normal::new(p(0)?, p(1)?).map_err(|e| err(&e))?.sample(rng),
        "StudentT" => {
            let t: f64 = StudentT::new(p(2)?).map_err(|e| err(&e))?.sample(rng);
            p(0)? + p(1)? * t
        }
        "Laplace" => {
            let u: f64 = rng.random::<f64>() - 0.5;
            p(0)? - p(1)? * u.signum() * (1.0 - 2.0 * u.abs()).ln()
        }
        "Bernoulli" => {
            if rng.random::<f64>() < p(0)? {
                1.0
            } else {
                0.0
            }
        }
        "Binomial" => {
            let n = trials.max(0.0).round() as u64;
            let prob = p(0)?.clamp(0.0, 1.0);
            Binomial::new(n, prob).map_err(|e| err(&e))?.sample(rng) as f64
        }
        "Poisson" => poisson(p(0)?, rng)?,
        "NegativeBinomial" => {
            let (mu, alpha) = (p(0)?, p(1)?);
            let rate: f64 = Gamma::new(alpha, mu / alpha).map_err(|e| err(&e))?.sample(rng);
            poisson(rate, rng)?
        }
        "Gamma" => {
            let (mu, alpha) = (p(0)?, p(1)?);
            Gamma::new(alpha, mu / alpha).map_err(|e| err(&e))?.sample(rng)
        }
        "Beta" => {
            let (mu, kappa) = (p(0)?, p(1)?);
            Beta::new(mu * kappa, (1.0 - mu) * kappa)
                .map_err(|e| err(&e))?
                .sample(rng)
        }
        "VonMises" => von_mises(p(0)?, p(1)?, rng),
        "Wald" => InverseGaussian::new(p(0)?, p(1)?)
            .map_err(|e| err(&e))?
            .sample(rng),
        other => {
            return Err(sampling_error(
                other,
                "posterior predictive sampling is not available for this likelihood",
            ))
        }
    };
    Ok(value)
}

fn poisson<R: Rng + ?Sized>(mu: f64, rng: &mut R) -> Result<f64> {
    if mu <= 0.0 {
        return Ok(0.0);
    }
    Ok(Poisson::new(mu)
        .map_err(|e| sampling_error("Poisson", e))?
        .sample(rng))
}

/// Log probability of `level` under the probabilities of every level.
pub fn categorical_log_likelihood(level: usize, probs: &[f64]) -> f64 {
    probs.get(level).map_or(f64::NEG_INFINITY, |p| p.ln())
}

pub fn multinomial_log_likelihood(counts: &[f64], probs: &[f64]) -> f64 {
    let n: f64 = counts.iter().sum();
    let mut out = ln_gamma(n + 1.0);
    for (&k, &p) in counts.iter().zip(probs) {
        out -= ln_gamma(k + 1.0);
        if k > 0.0 {
            out += k * p.ln();
        }
    }
    out
}

/// Index of the first level whose cumulative probability reaches a
/// uniform draw.
pub fn sample_categorical<R: Rng + ?Sized>(probs: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.random();
    let mut cumsum = 0.0;
    for (idx, p) in probs.iter().enumerate() {
        cumsum += p;
        if cumsum >= u {
            return idx;
        }
    }
    probs.len().saturating_sub(1)
}

/// Counts for `trials` draws spread over the levels, drawn as a sequence
/// of conditional binomials.
pub fn sample_multinomial<R: Rng + ?Sized>(
    trials: u64,
    probs: &[f64],
    rng: &mut R,
) -> Result<Vec<f64>> {
    let mut remaining = trials;
    let mut mass = 1.0;
    let mut out = Vec::with_capacity(probs.len());
    for (idx, &p) in probs.iter().enumerate() {
        if idx + 1 == probs.len() {
            out.push(remaining as f64);
            break;
        }
        let conditional = if mass > 0.0 { (p / mass).clamp(0.0, 1.0) } else { 0.0 };
        let k = Binomial::new(remaining, conditional)
            .map_err(|e| sampling_error("Multinomial", e))?
            .sample(rng);
        out.push(k as f64);
        remaining -= k;
        mass -= p;
    }
    Ok(out)
}

fn ln_choose(n: f64, k: f64) -> f64 {
    ln_gamma(n + 1.0) - ln_gamma(k + 1.0) - ln_gamma(n - k + 1.0)
}

/// `ln I0(x)`, power series for moderate arguments and the asymptotic
/// expansion otherwise.
fn ln_bessel_i0(x: f64) -> f64 {
    let x = x.abs();
    if x > 30.0 {
        return x - 0.5 * (2.0 * PI * x).ln() + (1.0 + 1.0 / (8.0 * x) + 9.0 / (128.0 * x * x)).ln();
    }
    let half_sq = 0.25 * x * x;
    let mut term = 1.0;
    let mut total = 1.0;
    for m in 1..200 {
        term *= half_sq / (m as f64 * m as f64);
        total += term;
        if term < total * 1e-17 {
            break;
        }
    }
    total.ln()
}

/// Best and Fisher rejection sampler, wrapped to `[-pi, pi)`.
fn von_mises<R: Rng + ?Sized>(mu: f64, kappa: f64, rng: &mut R) -> f64 {
    let theta = if kappa < 1e-8 {
        PI * (2.0 * rng.random::<f64>() - 1.0)
    } else {
        let tau = 1.0 + (1.0 + 4.0 * kappa * kappa).sqrt();
        let rho = (tau - (2.0 * tau).sqrt()) / (2.0 * kappa);
        let r = (1.0 + rho * rho) / (2.0 * rho);
        loop {
            let u1: f64 = rng.random();
            let u2: f64 = rng.random();
            let u3: f64 = rng.random();
            let z = (PI * u1).cos();
            let f = (1.0 + r * z) / (r + z);
            let c = kappa * (r - f);
            if c * (2.0 - c) - u2 > 0.0 || (c / u2).ln() + 1.0 - c >= 0.0 {
                break (u3 - 0.5).signum() * f.clamp(-1.0, 1.0).acos();
            }
        }
    };
    (mu + theta + PI).rem_euclid(2.0 * PI) - PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample_mean(name: &str, trials: f64, params: &[f64]) -> f64 {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        let n = 20_000;
        (0..n)
            .map(|_| sample(name, trials, params, &mut rng).unwrap())
            .sum::<f64>()
            / n as f64
    }

    #[test]
    fn sample_means_match_the_mean_parameter() {
        assert_relative_eq!(sample_mean("Normal", 0.0, &[3.0, 1.0]), 3.0, epsilon = 0.05);
        assert_relative_eq!(sample_mean("Poisson", 0.0, &[4.0]), 4.0, epsilon = 0.1);
        assert_relative_eq!(sample_mean("Gamma", 0.0, &[2.0, 3.0]), 2.0, epsilon = 0.05);
        assert_relative_eq!(sample_mean("Beta", 0.0, &[0.3, 10.0]), 0.3, epsilon = 0.01);
        assert_relative_eq!(sample_mean("NegativeBinomial", 0.0, &[5.0, 2.0]), 5.0, epsilon = 0.2);
        assert_relative_eq!(sample_mean("Binomial", 10.0, &[0.25]), 2.5, epsilon = 0.05);
        assert_relative_eq!(sample_mean("Wald", 0.0, &[1.5, 4.0]), 1.5, epsilon = 0.05);
    }

    #[test]
    fn bernoulli_log_likelihood() {
        assert_relative_eq!(log_likelihood("Bernoulli", 1.0, 0.0, &[0.2]).unwrap(), 0.2f64.ln());
        assert_relative_eq!(log_likelihood("Bernoulli", 0.0, 0.0, &[0.2]).unwrap(), 0.8f64.ln());
    }

    #[test]
    fn poisson_log_likelihood_sums_to_one() {
        let total: f64 = (0..60)
            .map(|k| log_likelihood("Poisson", k as f64, 0.0, &[3.5]).unwrap().exp())
            .sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn von_mises_density_integrates_to_one() {
        let n = 2000;
        let h = 2.0 * PI / n as f64;
        for kappa in [0.5, 4.0, 50.0] {
            let total: f64 = (0..n)
                .map(|i| {
                    let y = -PI + (i as f64 + 0.5) * h;
                    log_likelihood("VonMises", y, 0.0, &[0.3, kappa]).unwrap().exp() * h
                })
                .sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn von_mises_draws_stay_on_the_circle() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1000 {
            let y = sample("VonMises", 0.0, &[3.0, 2.0], &mut rng).unwrap();
            assert!((-PI..PI).contains(&y));
        }
    }

    #[test]
    fn multinomial_draws_keep_the_total() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..100 {
            let counts = sample_multinomial(12, &[0.2, 0.5, 0.3], &mut rng).unwrap();
            assert_eq!(counts.iter().sum::<f64>(), 12.0);
        }
    }

    #[test]
    fn categorical_frequencies_follow_probabilities() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let probs = [0.1, 0.6, 0.3];
        let mut counts = [0usize; 3];
        for _ in 0..10_000 {
            counts[sample_categorical(&probs, &mut rng)] += 1;
        }
        assert_relative_eq!(counts[1] as f64 / 10_000.0, 0.6, epsilon = 0.02);
        assert_relative_eq!(categorical_log_likelihood(2, &probs), 0.3f64.ln());
    }

    #[test]
    fn unknown_likelihoods_fail() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(sample("Weibull", 0.0, &[1.0], &mut rng).is_err());
        assert!(log_likelihood("Weibull", 1.0, 0.0, &[1.0]).is_err());
    }
}
