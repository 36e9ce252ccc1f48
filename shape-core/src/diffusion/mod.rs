//! Gaussian diffusion schedule and the Karras sampler that runs on top of it.

mod karras;
mod noise;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{Loader, ModelSources};

pub use karras::{karras_sigmas, KarrasSampler};
pub use noise::LatentNoise;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    Cosine,
    /// Noise levels spaced geometrically over the sampler's default
    /// `[1e-3, 160]` sigma range.
    #[default]
    Exp,
}

/// What the network predicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanType {
    #[default]
    XStart,
    Epsilon,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiffusionConfig {
    #[serde(default = "default_timesteps")]
    pub timesteps: usize,
    #[serde(default)]
    pub schedule: BetaSchedule,
    #[serde(default)]
    pub mean_type: MeanType,
}

fn default_timesteps() -> usize {
    1024
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            timesteps: default_timesteps(),
            schedule: BetaSchedule::default(),
            mean_type: MeanType::default(),
        }
    }
}

/// A discrete noise schedule, viewed through its equivalent continuous
/// noise levels so it can be driven by the Karras sampler.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    config: DiffusionConfig,
    alphas_cumprod: Vec<f64>,
    /// `ln(sigma_t)`, increasing in `t`.
    log_sigmas: Vec<f64>,
}

impl GaussianDiffusion {
    pub fn new(config: DiffusionConfig) -> Result<Self> {
        if config.timesteps < 2 {
            anyhow::bail!("diffusion needs at least 2 timesteps, got {}", config.timesteps);
        }

        Ok(Self::build(config))
    }

    fn build(config: DiffusionConfig) -> Self {
        let alphas_cumprod = alphas_cumprod(config.schedule, config.timesteps);
        let log_sigmas = alphas_cumprod
            .iter()
            .map(|ac| ((1.0 - ac) / ac).sqrt().ln())
            .collect();
        Self {
            config,
            alphas_cumprod,
            log_sigmas,
        }
    }

    pub fn config(&self) -> &DiffusionConfig {
        &self.config
    }

    pub fn mean_type(&self) -> MeanType {
        self.config.mean_type
    }

    pub fn num_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn sigma(&self, t: usize) -> f64 {
        self.log_sigmas[t].exp()
    }

    /// Maps a noise level to a fractional timestep by interpolating in
    /// log-sigma space, clamped to the schedule's range.
    pub fn sigma_to_t(&self, sigma: f64) -> f64 {
        let log_sigma = sigma.max(f64::MIN_POSITIVE).ln();
        let last = self.log_sigmas.len() - 1;
        if log_sigma <= self.log_sigmas[0] {
            return 0.0;
        }
        if log_sigma >= self.log_sigmas[last] {
            return last as f64;
        }
        let hi = self.log_sigmas.partition_point(|&ls| ls < log_sigma);
        let lo = hi - 1;
        let (a, b) = (self.log_sigmas[lo], self.log_sigmas[hi]);
        let frac = if b > a { (log_sigma - a) / (b - a) } else { 0.0 };
        lo as f64 + frac
    }
}

impl Default for GaussianDiffusion {
    fn default() -> Self {
        Self::build(DiffusionConfig::default())
    }
}

fn alphas_cumprod(schedule: BetaSchedule, timesteps: usize) -> Vec<f64> {
    let n = timesteps as f64;
    let betas: Vec<f64> = match schedule {
        BetaSchedule::Exp => {
            let (lo, hi) = (karras::SIGMA_MIN.ln(), karras::SIGMA_MAX.ln());
            return (0..timesteps)
                .map(|i| {
                    let sigma = (lo + (hi - lo) * i as f64 / (n - 1.0)).exp();
                    1.0 / (1.0 + sigma * sigma)
                })
                .collect();
        }
        BetaSchedule::Linear => {
            let scale = 1000.0 / n;
            let (beta_start, beta_end) = (scale * 0.0001, scale * 0.02);
            (0..timesteps)
                .map(|i| beta_start + (beta_end - beta_start) * i as f64 / (n - 1.0))
                .collect()
        }
        BetaSchedule::Cosine => {
            let alpha_bar =
                |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
            (0..timesteps)
                .map(|i| {
                    let (t1, t2) = (i as f64 / n, (i + 1) as f64 / n);
                    (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                })
                .collect()
        }
    };

    let mut acc = 1.0;
    betas
        .into_iter()
        .map(|beta| {
            acc *= 1.0 - beta;
            acc
        })
        .collect()
}

pub struct DiffusionLoader;

impl Loader for DiffusionLoader {
    type Model = GaussianDiffusion;

    async fn load(sources: &ModelSources, _device: &candle_core::Device) -> Result<Self::Model> {
        let config: DiffusionConfig = sources
            .shap_e
            .read_json("diffusion.json")
            .await
            .context("failed to read diffusion config")?;
        tracing::info!(
            "diffusion schedule {:?} over {} timesteps",
            config.schedule,
            config.timesteps
        );
        GaussianDiffusion::new(config)
    }
}
