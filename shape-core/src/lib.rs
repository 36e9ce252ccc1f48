#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod device_map;
pub mod diffusion;
pub mod loader;
mod loader_factory;
pub mod marching;
pub mod mesh;
mod text300m;
mod transmitter;
mod util;

use std::sync::Arc;

use anyhow::Result;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

pub use device_map::*;
pub use diffusion::{GaussianDiffusion, KarrasSampler, LatentNoise};
pub use loader::*;
pub use loader_factory::*;
pub use mesh::TriMesh;
pub use text300m::{Text300M, Text300MConfig, Text300MLoader};
pub use transmitter::{Transmitter, TransmitterConfig, TransmitterLoader};
pub use util::{device_label, memory_usage, select_best_device};

pub const DEFAULT_GUIDANCE_SCALE: f64 = 15.0;
pub const DEFAULT_INFERENCE_STEPS: usize = 64;

/// Name reported for the text-conditional model.
pub const MODEL_VERSION: &str = "text300M";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            num_inference_steps: DEFAULT_INFERENCE_STEPS,
            seed: None,
        }
    }
}

/// Text-conditional denoiser over latent shapes.
pub trait LatentModel: Send + Sync {
    /// `(n_ctx, d_latent)` of a single latent.
    fn latent_shape(&self) -> (usize, usize);

    fn device(&self) -> &Device;

    /// Conditioning embedding for a prompt, shape `(1, d_cond)`.
    fn embed_prompt(&self, prompt: &str) -> Result<Tensor>;

    /// Raw network output for `x_t` of shape `(batch, n_ctx, d_latent)` at
    /// continuous timesteps `t` of shape `(batch,)`.
    fn forward(&self, x_t: &Tensor, t: &Tensor, cond: &Tensor) -> Result<Tensor>;
}

/// Turns a latent into a triangle mesh.
pub trait LatentDecoder: Send + Sync {
    fn latent_shape(&self) -> (usize, usize);

    fn decode_mesh(&self, latent: &Tensor) -> Result<TriMesh>;
}

/// The three handles loaded at startup. Each is absent until its load
/// succeeded; generation needs all of them.
#[derive(Clone, Default)]
pub struct ModelHandles {
    pub transmitter: Option<Arc<dyn LatentDecoder>>,
    pub text_model: Option<Arc<dyn LatentModel>>,
    pub diffusion: Option<Arc<GaussianDiffusion>>,
}

impl ModelHandles {
    pub fn is_ready(&self) -> bool {
        self.transmitter.is_some() && self.text_model.is_some() && self.diffusion.is_some()
    }

    pub fn ready(&self) -> Option<ShapE> {
        Some(ShapE {
            transmitter: self.transmitter.clone()?,
            text_model: self.text_model.clone()?,
            diffusion: self.diffusion.clone()?,
        })
    }
}

impl std::fmt::Debug for ModelHandles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandles")
            .field("transmitter", &self.transmitter.is_some())
            .field("text_model", &self.text_model.is_some())
            .field("diffusion", &self.diffusion.is_some())
            .finish()
    }
}

/// A fully loaded model set, cheap to clone into a blocking task.
#[derive(Clone)]
pub struct ShapE {
    transmitter: Arc<dyn LatentDecoder>,
    text_model: Arc<dyn LatentModel>,
    diffusion: Arc<GaussianDiffusion>,
}

impl ShapE {
    /// Samples one latent for the prompt and decodes it into a mesh.
    ///
    /// Blocks for the whole sampling run. A latent whose surface has no
    /// faces is an error, so a returned mesh always has content to write.
    pub fn generate(&self, request: &GenerationRequest) -> Result<TriMesh> {
        let sampler = KarrasSampler::new(request.guidance_scale, request.num_inference_steps);
        let mut noise = LatentNoise::new(request.seed);

        let latents = sampler.sample(
            &self.diffusion,
            self.text_model.as_ref(),
            &request.prompt,
            &mut noise,
        )?;
        tracing::debug!("sampled latent {:?}", latents.shape());

        let mesh = self.transmitter.decode_mesh(&latents.get(0)?)?;
        if mesh.is_empty() {
            anyhow::bail!("decoded mesh has no faces");
        }
        tracing::debug!(
            "decoded mesh with {} vertices and {} faces",
            mesh.verts.len(),
            mesh.faces.len()
        );
        Ok(mesh)
    }
}
