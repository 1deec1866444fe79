use anyhow::{bail, Context};
use faer::{Col, Mat};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::backend::logp::{hessian, LayoutDensity, LogpError, LogpFunc};
use crate::backend::{Backend, BlockKind, FitSettings, Layout, ModelSpec};
use crate::draws::InferenceData;

/// Smallest curvature used when inverting the Hessian.
const MIN_CURVATURE: f64 = 1e-8;

/// Gaussian approximation around the posterior mode.
///
/// The mode is found by damped Newton iterations on the unconstrained
/// space. Draws come from the normal distribution with the inverse of the
/// negative Hessian at the mode as covariance, mapped back through the
/// constraining transforms.
///
/// Only models whose coefficients are all common are accepted. The joint
/// mode of a hierarchical model sits where the group scale vanishes, so
/// group specific and HSGP terms need [`NutsBackend`](super::NutsBackend).
#[derive(Debug, Default)]
pub struct LaplaceBackend {
    layout: Option<Layout>,
    mode: Option<Vec<f64>>,
}

impl LaplaceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unconstrained position of the mode found by the last run.
    pub fn mode(&self) -> Option<&[f64]> {
        self.mode.as_deref()
    }
}

/// Eigen decomposition of the negative Hessian, eigenvalues clamped from
/// below.
fn curvature(h: &[Vec<f64>]) -> anyhow::Result<(Col<f64>, Mat<f64>)> {
    let n = h.len();
    let neg = Mat::from_fn(n, n, |i, j| -h[i][j]);
    let eig = neg
        .self_adjoint_eigen(faer::Side::Lower)
        .ok()
        .context("Eigendecomposition of the negative Hessian failed")?;
    let mut vals = eig.S().column_vector().to_owned();
    vals.iter_mut().for_each(|v| *v = v.abs().max(MIN_CURVATURE));
    Ok((vals, eig.U().to_owned()))
}

/// Newton step with absolute curvatures, an ascent direction everywhere.
fn saddle_free_step(h: &[Vec<f64>], grad: &[f64]) -> anyhow::Result<Vec<f64>> {
    let n = grad.len();
    let (vals, vecs) = curvature(h)?;
    let mut step = vec![0.0; n];
    for k in 0..n {
        let proj: f64 = (0..n).map(|i| vecs[(i, k)] * grad[i]).sum();
        let scale = proj / vals[k];
        for (i, s) in step.iter_mut().enumerate() {
            *s += vecs[(i, k)] * scale;
        }
    }
    Ok(step)
}

pub(crate) fn find_mode<F: LogpFunc>(
    func: &mut F,
    init: Vec<f64>,
    settings: &FitSettings,
) -> anyhow::Result<Vec<f64>> {
    let n = func.dim();
    let mut x = init;
    let mut grad = vec![0.0; n];
    let mut f = func.logp(&x, &mut grad)?;
    if n == 0 {
        return Ok(x);
    }
    let mut candidate = vec![0.0; n];
    let mut candidate_grad = vec![0.0; n];

    for iteration in 0..settings.max_iterations {
        let h = hessian(func, &x)?;
        let step = saddle_free_step(&h, &grad)?;
        let mut t = 1.0;
        let mut accepted = None;
        for _ in 0..50 {
            for i in 0..n {
                candidate[i] = x[i] + t * step[i];
            }
            match func.logp(&candidate, &mut candidate_grad) {
                Ok(value) if value >= f => {
                    accepted = Some(value);
                    break;
                }
                Ok(_) => t *= 0.5,
                Err(err) if err.is_recoverable() => t *= 0.5,
                Err(err) => return Err(err.into()),
            }
        }
        let Some(value) = accepted else {
            log::debug!("Line search stalled at iteration {iteration}");
            break;
        };
        let largest = step.iter().fold(0f64, |acc, s| acc.max((t * s).abs()));
        let change = value - f;
        x.copy_from_slice(&candidate);
        grad.copy_from_slice(&candidate_grad);
        f = value;
        if largest < settings.tolerance || change.abs() < settings.tolerance * (1.0 + f.abs()) {
            log::debug!("Mode found after {} iterations, logp {f:.4}", iteration + 1);
            return Ok(x);
        }
    }
    log::warn!(
        "The search for the posterior mode did not converge in {} iterations",
        settings.max_iterations
    );
    Ok(x)
}

impl Backend for LaplaceBackend {
    fn build(&mut self, spec: &ModelSpec) -> anyhow::Result<()> {
        let hierarchical = spec
            .predictors
            .iter()
            .flat_map(|p| &p.blocks)
            .find(|block| !matches!(block.kind, BlockKind::Common(_)));
        if let Some(block) = hierarchical {
            bail!(
                "The Laplace approximation does not support the term {}, \
                 fit models with group specific or HSGP terms with NUTS",
                block.name
            );
        }
        self.layout = Some(Layout::new(spec)?);
        self.mode = None;
        Ok(())
    }

    fn run(&mut self, settings: &FitSettings) -> anyhow::Result<InferenceData> {
        let Some(layout) = self.layout.as_ref() else {
            bail!("The backend must be built before it is run");
        };
        let n = layout.dim();
        let mut density = LayoutDensity::new(layout);
        log::info!("Finding the posterior mode of {n} parameters");
        let mode = find_mode(&mut density, vec![0.0; n], settings)?;

        let (vals, vecs) = if n > 0 {
            curvature(&hessian(&mut density, &mode)?)?
        } else {
            (Col::zeros(0), Mat::zeros(0, 0))
        };
        let scales: Vec<f64> = (0..n).map(|k| vals[k].sqrt().recip()).collect();

        log::info!(
            "Drawing {} chains of {} draws",
            settings.num_chains,
            settings.num_draws
        );
        let mut draws = Vec::with_capacity(settings.num_chains as usize);
        let mut z = vec![0.0; n];
        let mut position = vec![0.0; n];
        for chain in 0..settings.num_chains {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed.wrapping_add(chain));
            let mut chain_draws = Vec::with_capacity(settings.num_draws as usize);
            for _ in 0..settings.num_draws {
                z.iter_mut().for_each(|v| *v = StandardNormal.sample(&mut rng));
                position.copy_from_slice(&mode);
                for k in 0..n {
                    let scaled = z[k] * scales[k];
                    for (i, p) in position.iter_mut().enumerate() {
                        *p += vecs[(i, k)] * scaled;
                    }
                }
                chain_draws.push(layout.constrain(&position).0);
            }
            draws.push(chain_draws);
        }
        let posterior = layout.to_dataset(&draws)?;
        self.mode = Some(mode);
        Ok(InferenceData::new(posterior))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_specs::{group_means, normal_data, normal_mean};
    use crate::priors::{Prior, PriorSpec};
    use approx::assert_relative_eq;

    #[test]
    fn normal_mean_with_known_scale() {
        let y = normal_data();
        let mean = y.iter().sum::<f64>() / y.len() as f64;
        let mut backend = LaplaceBackend::new();
        backend.build(&normal_mean(&y, PriorSpec::Constant(1.0))).unwrap();
        let settings = FitSettings {
            num_draws: 2000,
            seed: 42,
            ..Default::default()
        };
        let idata = backend.run(&settings).unwrap();
        assert_relative_eq!(backend.mode().unwrap()[0], mean, epsilon = 1e-4);

        let intercept = idata.posterior.require("Intercept").unwrap();
        assert_eq!(intercept.shape(), &[2, 2000]);
        let draws: Vec<f64> = intercept.values().iter().copied().collect();
        let m = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|d| (d - m).powi(2)).sum::<f64>() / draws.len() as f64;
        assert_relative_eq!(m, mean, epsilon = 0.03);
        assert_relative_eq!(var.sqrt(), 0.2, epsilon = 0.02);
    }

    #[test]
    fn positive_parameters_stay_positive() {
        let y = normal_data();
        let mut backend = LaplaceBackend::new();
        let sigma = Prior::new("HalfNormal").with("sigma", 2.0);
        backend.build(&normal_mean(&y, sigma.into())).unwrap();
        let idata = backend
            .run(&FitSettings {
                num_draws: 200,
                ..Default::default()
            })
            .unwrap();
        let sigma = idata.posterior.require("y_sigma").unwrap();
        assert!(sigma.values().iter().all(|&s| s > 0.0));
    }

    #[test]
    fn same_seed_same_draws() {
        let y = normal_data();
        let spec = normal_mean(&y, PriorSpec::Constant(1.0));
        let settings = FitSettings {
            num_draws: 10,
            seed: 7,
            ..Default::default()
        };
        let mut a = LaplaceBackend::new();
        a.build(&spec).unwrap();
        let mut b = LaplaceBackend::new();
        b.build(&spec).unwrap();
        assert_eq!(a.run(&settings).unwrap(), b.run(&settings).unwrap());
    }

    #[test]
    fn group_specific_terms_are_rejected() {
        let mut backend = LaplaceBackend::new();
        let err = backend.build(&group_means(&[-2.0, 1.0, 4.0], 10)).unwrap_err();
        assert!(err.to_string().contains("1|g"));
        assert!(backend.run(&FitSettings::default()).is_err());
    }

    #[test]
    fn running_before_building_fails() {
        let mut backend = LaplaceBackend::new();
        assert!(backend.run(&FitSettings::default()).is_err());
    }
}
