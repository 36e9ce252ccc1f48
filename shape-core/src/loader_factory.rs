use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use candle_core::Device;

use crate::diffusion::DiffusionLoader;
use crate::{
    GaussianDiffusion, LatentDecoder, LatentModel, LoadState, Loader, LoadingStatus,
    ModelHandles, ModelSources, Text300MLoader, TransmitterLoader,
};

/// The artifacts that make up a text-to-3D model set, in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Transmitter,
    Text300M,
    Diffusion,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::Transmitter,
        ModelKind::Text300M,
        ModelKind::Diffusion,
    ];

    pub fn from_name(model_name: &str) -> Option<Self> {
        match model_name.to_lowercase().as_str() {
            "transmitter" => Some(ModelKind::Transmitter),
            "text300m" => Some(ModelKind::Text300M),
            "diffusion" => Some(ModelKind::Diffusion),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Transmitter => "transmitter",
            ModelKind::Text300M => "text300M",
            ModelKind::Diffusion => "diffusion",
        }
    }
}

pub enum LoadedModel {
    Transmitter(Arc<dyn LatentDecoder>),
    Text300M(Arc<dyn LatentModel>),
    Diffusion(Arc<GaussianDiffusion>),
}

impl ModelHandles {
    fn insert(&mut self, model: LoadedModel) {
        match model {
            LoadedModel::Transmitter(m) => self.transmitter = Some(m),
            LoadedModel::Text300M(m) => self.text_model = Some(m),
            LoadedModel::Diffusion(m) => self.diffusion = Some(m),
        }
    }

    fn check_latent_shapes(&self) -> Result<()> {
        if let (Some(decoder), Some(model)) = (&self.transmitter, &self.text_model) {
            if decoder.latent_shape() != model.latent_shape() {
                anyhow::bail!(
                    "transmitter expects latents of shape {:?} but text300M produces {:?}",
                    decoder.latent_shape(),
                    model.latent_shape()
                );
            }
        }
        Ok(())
    }
}

/// Load a single artifact by name.
pub async fn load_model(
    model_name: &str,
    sources: &ModelSources,
    device: &Device,
) -> Result<LoadedModel> {
    let kind = ModelKind::from_name(model_name)
        .ok_or_else(|| anyhow!("Unsupported model: {}", model_name))?;

    tracing::info!("loading model: {} from {}", kind.name(), sources.shap_e);

    let model = match kind {
        ModelKind::Transmitter => {
            LoadedModel::Transmitter(Arc::new(TransmitterLoader::load(sources, device).await?))
        }
        ModelKind::Text300M => {
            LoadedModel::Text300M(Arc::new(Text300MLoader::load(sources, device).await?))
        }
        ModelKind::Diffusion => {
            LoadedModel::Diffusion(Arc::new(DiffusionLoader::load(sources, device).await?))
        }
    };
    Ok(model)
}

/// Loads every artifact in order, stopping at the first failure.
///
/// The status starts out `loading` and ends `loaded` or `error`. Handles
/// loaded before a failure are kept; the ones after it stay empty, so the
/// set reports not ready. Nothing is retried.
pub async fn load_all(sources: &ModelSources, device: &Device) -> (ModelHandles, LoadingStatus) {
    let mut status = LoadingStatus::loading();
    tracing::info!("model status: {}", status.state);

    let mut handles = ModelHandles::default();
    match load_in_order(&mut handles, sources, device).await {
        Ok(()) => {
            status.state = LoadState::Loaded;
            tracing::info!("all models loaded on {}", crate::device_label(device));
        }
        Err(e) => {
            tracing::error!("model loading failed: {e:?}");
            status.state = LoadState::Error;
            status.error = Some(format!("{e:#}"));
        }
    }
    (handles, status)
}

async fn load_in_order(
    handles: &mut ModelHandles,
    sources: &ModelSources,
    device: &Device,
) -> Result<()> {
    for kind in ModelKind::ALL {
        let model = load_model(kind.name(), sources, device)
            .await
            .with_context(|| format!("failed to load {}", kind.name()))?;
        handles.insert(model);
    }
    if let Err(e) = handles.check_latent_shapes() {
        *handles = ModelHandles::default();
        return Err(e);
    }
    Ok(())
}
