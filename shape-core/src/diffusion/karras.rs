use anyhow::Result;
use candle_core::{DType, Tensor};

use super::{GaussianDiffusion, LatentNoise, MeanType};
use crate::{LatentModel, DEFAULT_GUIDANCE_SCALE, DEFAULT_INFERENCE_STEPS};

pub(crate) const SIGMA_MIN: f64 = 1e-3;
pub(crate) const SIGMA_MAX: f64 = 160.0;
const RHO: f64 = 7.0;

/// Noise levels from `sigma_max` down to `sigma_min`, spaced by `rho`,
/// followed by a final `0`.
pub fn karras_sigmas(steps: usize, sigma_min: f64, sigma_max: f64, rho: f64) -> Vec<f64> {
    let min_inv_rho = sigma_min.powf(1.0 / rho);
    let max_inv_rho = sigma_max.powf(1.0 / rho);
    let mut sigmas: Vec<f64> = (0..steps)
        .map(|i| {
            let ramp = if steps > 1 {
                i as f64 / (steps - 1) as f64
            } else {
                0.0
            };
            (max_inv_rho + ramp * (min_inv_rho - max_inv_rho)).powf(rho)
        })
        .collect();
    sigmas.push(0.0);
    sigmas
}

/// Second-order (Heun) sampler over Karras noise levels with
/// classifier-free guidance.
#[derive(Debug, Clone, PartialEq)]
pub struct KarrasSampler {
    pub steps: usize,
    pub guidance_scale: f64,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub rho: f64,
    pub s_churn: f64,
    pub s_tmin: f64,
    pub s_tmax: f64,
    pub s_noise: f64,
    pub clip_denoised: bool,
}

impl Default for KarrasSampler {
    fn default() -> Self {
        Self {
            steps: DEFAULT_INFERENCE_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            sigma_min: SIGMA_MIN,
            sigma_max: SIGMA_MAX,
            rho: RHO,
            s_churn: 0.0,
            s_tmin: 0.0,
            s_tmax: f64::INFINITY,
            s_noise: 1.0,
            clip_denoised: true,
        }
    }
}

impl KarrasSampler {
    pub fn new(guidance_scale: f64, steps: usize) -> Self {
        Self {
            steps,
            guidance_scale,
            ..Default::default()
        }
    }

    /// Samples a single latent of shape `(1, n_ctx, d_latent)` for `prompt`.
    pub fn sample(
        &self,
        diffusion: &GaussianDiffusion,
        model: &dyn LatentModel,
        prompt: &str,
        noise: &mut LatentNoise,
    ) -> Result<Tensor> {
        if self.steps == 0 {
            anyhow::bail!("num_inference_steps must be positive");
        }

        let device = model.device();
        let (n_ctx, d_latent) = model.latent_shape();
        let shape = (1, n_ctx, d_latent);

        let cond = model.embed_prompt(prompt)?.to_dtype(DType::F32)?;
        let cond = Tensor::cat(&[&cond, &cond.zeros_like()?], 0)?;

        let sigmas = karras_sigmas(self.steps, self.sigma_min, self.sigma_max, self.rho);
        let gamma_max = (self.s_churn / self.steps as f64).min(2f64.sqrt() - 1.0);

        let mut x = (noise.randn(shape, device)? * self.sigma_max)?;
        for (i, window) in sigmas.windows(2).enumerate() {
            let (sigma, sigma_next) = (window[0], window[1]);
            let gamma = if (self.s_tmin..=self.s_tmax).contains(&sigma) {
                gamma_max
            } else {
                0.0
            };
            let sigma_hat = sigma * (gamma + 1.0);
            if gamma > 0.0 {
                let eps = (noise.randn(shape, device)? * self.s_noise)?;
                x = (&x + (eps * (sigma_hat * sigma_hat - sigma * sigma).sqrt())?)?;
            }

            let denoised = self.denoise(diffusion, model, &x, sigma_hat, &cond)?;
            let d = ((&x - &denoised)? / sigma_hat)?;
            let dt = sigma_next - sigma_hat;

            x = if sigma_next == 0.0 {
                (&x + (d * dt)?)?
            } else {
                let x_2 = (&x + (&d * dt)?)?;
                let denoised_2 = self.denoise(diffusion, model, &x_2, sigma_next, &cond)?;
                let d_2 = ((&x_2 - &denoised_2)? / sigma_next)?;
                let d_prime = ((d + d_2)? * 0.5)?;
                (&x + (d_prime * dt)?)?
            };
            tracing::trace!("karras step {}/{} sigma={sigma:.4}", i + 1, self.steps);
        }
        Ok(x)
    }

    /// Guided `x0` prediction at noise level `sigma`.
    fn denoise(
        &self,
        diffusion: &GaussianDiffusion,
        model: &dyn LatentModel,
        x: &Tensor,
        sigma: f64,
        cond: &Tensor,
    ) -> Result<Tensor> {
        let c_in = 1.0 / (sigma * sigma + 1.0).sqrt();
        let t = diffusion.sigma_to_t(sigma) as f32;

        let x_pair = Tensor::cat(&[x, x], 0)?;
        let t = Tensor::new(&[t, t], x.device())?;
        let out = model
            .forward(&(&x_pair * c_in)?, &t, cond)?
            .to_dtype(DType::F32)?;

        let x0 = match diffusion.mean_type() {
            MeanType::XStart => out,
            MeanType::Epsilon => (x_pair - (out * sigma)?)?,
        };
        let cond_x0 = x0.narrow(0, 0, 1)?;
        let uncond_x0 = x0.narrow(0, 1, 1)?;
        let guided = (&uncond_x0 + ((cond_x0 - &uncond_x0)? * self.guidance_scale)?)?;

        if self.clip_denoised {
            Ok(guided.clamp(-1f32, 1f32)?)
        } else {
            Ok(guided)
        }
    }
}
