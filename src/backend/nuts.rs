use anyhow::{bail, Context};
use nuts_rs::{Chain, CpuLogpFunc, CpuMath, DiagGradNutsSettings, Settings};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::backend::logp::{DensityError, LayoutDensity, LogpFunc};
use crate::backend::{Backend, FitSettings, Layout, ModelSpec};
use crate::draws::InferenceData;

/// Initial points tried per chain before giving up.
const INIT_ATTEMPTS: usize = 500;

/// Samples the posterior with the No U-Turn Sampler of `nuts-rs`.
///
/// Each chain adapts its step size and a diagonal mass matrix during the
/// `num_tune` first draws, which are discarded. Chains start from uniform
/// jitter in `[-1, 1]` on the unconstrained space.
#[derive(Debug, Default)]
pub struct NutsBackend {
    layout: Option<Layout>,
    divergences: u64,
}

impl NutsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Divergent transitions after tuning, over all chains of the last run.
    pub fn divergences(&self) -> u64 {
        self.divergences
    }
}

impl CpuLogpFunc for LayoutDensity<'_> {
    type LogpError = DensityError;
    type TransformParams = ();

    fn dim(&self) -> usize {
        self.layout().dim()
    }

    fn logp(&mut self, position: &[f64], gradient: &mut [f64]) -> Result<f64, Self::LogpError> {
        LogpFunc::logp(self, position, gradient)
    }

    fn inv_transform_normalize(
        &mut self,
        _params: &Self::TransformParams,
        _untransformed_position: &[f64],
        _untransformed_gradient: &[f64],
        _transformed_position: &mut [f64],
        _transformed_gradient: &mut [f64],
    ) -> Result<f64, Self::LogpError> {
        Err(DensityError::Unsupported)
    }

    fn init_from_untransformed_position(
        &mut self,
        _params: &Self::TransformParams,
        _untransformed_position: &[f64],
        _untransformed_gradient: &mut [f64],
        _transformed_position: &mut [f64],
        _transformed_gradient: &mut [f64],
    ) -> Result<(f64, f64), Self::LogpError> {
        Err(DensityError::Unsupported)
    }

    fn init_from_transformed_position(
        &mut self,
        _params: &Self::TransformParams,
        _untransformed_position: &mut [f64],
        _untransformed_gradient: &mut [f64],
        _transformed_position: &[f64],
        _transformed_gradient: &mut [f64],
    ) -> Result<(f64, f64), Self::LogpError> {
        Err(DensityError::Unsupported)
    }

    fn update_transformation<'b, R: rand::Rng + ?Sized>(
        &'b mut self,
        _rng: &mut R,
        _untransformed_positions: impl Iterator<Item = &'b [f64]>,
        _untransformed_gradients: impl Iterator<Item = &'b [f64]>,
        _untransformed_logp: impl Iterator<Item = &'b f64>,
        _params: &'b mut Self::TransformParams,
    ) -> Result<(), Self::LogpError> {
        Err(DensityError::Unsupported)
    }

    fn new_transformation<R: rand::Rng + ?Sized>(
        &mut self,
        _rng: &mut R,
        _untransformed_position: &[f64],
        _untransformed_gradient: &[f64],
        _chain: u64,
    ) -> Result<Self::TransformParams, Self::LogpError> {
        Err(DensityError::Unsupported)
    }

    fn transformation_id(&self, _params: &Self::TransformParams) -> Result<i64, Self::LogpError> {
        Err(DensityError::Unsupported)
    }
}

impl Backend for NutsBackend {
    fn build(&mut self, spec: &ModelSpec) -> anyhow::Result<()> {
        self.layout = Some(Layout::new(spec)?);
        self.divergences = 0;
        Ok(())
    }

    fn run(&mut self, settings: &FitSettings) -> anyhow::Result<InferenceData> {
        let Some(layout) = self.layout.as_ref() else {
            bail!("The backend must be built before it is run");
        };
        let dim = layout.dim();
        let nuts_settings = DiagGradNutsSettings {
            num_tune: settings.num_tune,
            num_draws: settings.num_draws,
            num_chains: settings.num_chains as usize,
            seed: settings.seed,
            ..Default::default()
        };
        log::info!(
            "Sampling {} chains of {} tuning and {} draws in {dim} dimensions",
            settings.num_chains,
            settings.num_tune,
            settings.num_draws
        );

        let mut divergences = 0;
        let mut draws = Vec::with_capacity(settings.num_chains as usize);
        for chain in 0..settings.num_chains {
            let mut chain_draws = Vec::with_capacity(settings.num_draws as usize);
            if dim == 0 {
                let (values, _) = layout.constrain(&[]);
                chain_draws.resize(settings.num_draws as usize, values);
                draws.push(chain_draws);
                continue;
            }

            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            rng.set_stream(chain);
            let math = CpuMath::new(LayoutDensity::new(layout));
            let mut sampler = nuts_settings.new_chain(chain, math, &mut rng);

            let mut init = vec![0f64; dim];
            let mut error = None;
            for _ in 0..INIT_ATTEMPTS {
                init.iter_mut().for_each(|x| *x = rng.random_range(-1.0..1.0));
                match sampler.set_position(&init) {
                    Ok(()) => {
                        error = None;
                        break;
                    }
                    Err(err) => error = Some(err),
                }
            }
            if let Some(error) = error {
                return Err(error.context(format!("All initial points of chain {chain} failed")));
            }

            for draw in 0..settings.num_tune + settings.num_draws {
                let (position, progress) = sampler
                    .draw()
                    .with_context(|| format!("Sampling failed in chain {chain}"))?;
                if draw < settings.num_tune {
                    continue;
                }
                if progress.diverging {
                    divergences += 1;
                }
                chain_draws.push(layout.constrain(&position).0);
            }
            log::debug!("Chain {chain} finished");
            draws.push(chain_draws);
        }

        if divergences > 0 {
            log::warn!("There were {divergences} divergences after tuning");
        }
        self.divergences = divergences;
        let posterior = layout.to_dataset(&draws)?;
        Ok(InferenceData::new(posterior))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_specs::{group_means, normal_data, normal_mean};
    use crate::priors::{Prior, PriorSpec};
    use approx::assert_relative_eq;
    use ndarray::Axis;

    fn settings(seed: u64) -> FitSettings {
        FitSettings {
            num_tune: 500,
            num_draws: 500,
            seed,
            ..Default::default()
        }
    }

    fn mean_and_sd(values: impl Iterator<Item = f64>) -> (f64, f64) {
        let values: Vec<f64> = values.collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        (mean, var.sqrt())
    }

    #[test]
    fn normal_mean_with_known_scale() {
        let y = normal_data();
        let expected = y.iter().sum::<f64>() / y.len() as f64;
        let mut backend = NutsBackend::new();
        backend.build(&normal_mean(&y, PriorSpec::Constant(1.0))).unwrap();
        let idata = backend.run(&settings(42)).unwrap();

        let intercept = idata.posterior.require("Intercept").unwrap();
        assert_eq!(intercept.shape(), &[2, 500]);
        let (mean, sd) = mean_and_sd(intercept.values().iter().copied());
        assert_relative_eq!(mean, expected, epsilon = 0.05);
        assert_relative_eq!(sd, 0.2, epsilon = 0.04);
        assert_eq!(backend.divergences(), 0);
    }

    #[test]
    fn positive_parameters_stay_positive() {
        let y = normal_data();
        let mut backend = NutsBackend::new();
        let sigma = Prior::new("HalfNormal").with("sigma", 2.0);
        backend.build(&normal_mean(&y, sigma.into())).unwrap();
        let idata = backend.run(&settings(1)).unwrap();
        let sigma = idata.posterior.require("y_sigma").unwrap();
        assert!(sigma.values().iter().all(|&s| s > 0.0));
    }

    #[test]
    fn group_means_keep_their_spread() {
        let means = [-2.0, 1.0, 4.0];
        let mut backend = NutsBackend::new();
        backend.build(&group_means(&means, 20)).unwrap();
        let idata = backend.run(&settings(3)).unwrap();

        let intercept = idata.posterior.require("Intercept").unwrap().values();
        let offsets = idata.posterior.require("1|g").unwrap().values();
        assert_eq!(offsets.shape(), &[2, 500, 3]);
        for (k, &expected) in means.iter().enumerate() {
            let group = offsets.index_axis(Axis(2), k);
            let draws = intercept.iter().zip(group.iter()).map(|(a, u)| a + u);
            let (mean, sd) = mean_and_sd(draws);
            assert_relative_eq!(mean, expected, epsilon = 0.2);
            assert!(sd < 0.2, "group {k} has posterior sd {sd}");
        }
        let sigma = idata.posterior.require("1|g_sigma").unwrap();
        let (sigma, _) = mean_and_sd(sigma.values().iter().copied());
        assert!(sigma > 1.0, "group scale collapsed to {sigma}");
    }

    #[test]
    fn same_seed_same_draws() {
        let y = normal_data();
        let spec = normal_mean(&y, PriorSpec::Constant(1.0));
        let settings = FitSettings {
            num_tune: 50,
            num_draws: 10,
            seed: 7,
            ..Default::default()
        };
        let mut a = NutsBackend::new();
        a.build(&spec).unwrap();
        let mut b = NutsBackend::new();
        b.build(&spec).unwrap();
        assert_eq!(a.run(&settings).unwrap(), b.run(&settings).unwrap());
    }

    #[test]
    fn chains_use_different_streams() {
        let y = normal_data();
        let mut backend = NutsBackend::new();
        backend.build(&normal_mean(&y, PriorSpec::Constant(1.0))).unwrap();
        let idata = backend
            .run(&FitSettings {
                num_tune: 50,
                num_draws: 10,
                ..Default::default()
            })
            .unwrap();
        let draws = idata.posterior.require("Intercept").unwrap().values();
        assert_ne!(draws.index_axis(Axis(0), 0), draws.index_axis(Axis(0), 1));
    }

    #[test]
    fn running_before_building_fails() {
        let mut backend = NutsBackend::new();
        assert!(backend.run(&FitSettings::default()).is_err());
    }
}
