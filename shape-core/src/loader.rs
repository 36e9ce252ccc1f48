use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::Device;
use hf_hub::api::tokio::Api;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Where model artifacts are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    Hub(String),
}

impl ModelSource {
    pub async fn get(&self, filename: &str) -> Result<PathBuf> {
        match self {
            ModelSource::Local(dir) => {
                let path = dir.join(filename);
                if !path.is_file() {
                    anyhow::bail!("{} does not exist", path.display());
                }
                Ok(path)
            }
            ModelSource::Hub(repo) => Api::new()?
                .model(repo.clone())
                .get(filename)
                .await
                .with_context(|| format!("failed to fetch {filename} from {repo}")),
        }
    }

    pub async fn read_json<T: DeserializeOwned>(&self, filename: &str) -> Result<T> {
        let path = self.get(filename).await?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

impl std::fmt::Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSource::Local(dir) => write!(f, "{}", dir.display()),
            ModelSource::Hub(repo) => write!(f, "hf://{repo}"),
        }
    }
}

/// The Shap-E artifacts and the CLIP text encoder they condition on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSources {
    pub shap_e: ModelSource,
    pub clip: ModelSource,
}

pub trait Loader {
    type Model;

    fn load(sources: &ModelSources, device: &Device) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
    Error,
}

serde_plain::derive_display_from_serialize!(LoadState);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadingStatus {
    pub state: LoadState,
    pub error: Option<String>,
}

impl LoadingStatus {
    pub fn loading() -> Self {
        Self {
            state: LoadState::Loading,
            error: None,
        }
    }

    pub fn loaded() -> Self {
        Self {
            state: LoadState::Loaded,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: LoadState::Error,
            error: Some(error.into()),
        }
    }
}
