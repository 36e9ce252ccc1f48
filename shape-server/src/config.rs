use std::path::PathBuf;

use clap::Parser;
use shape_core::{DeviceMap, ModelSource, ModelSources};

pub const DEFAULT_LOG_FILTER: &str = "shape_server=info,shape_core=info,tower_http=info";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Shap-E text-to-3D generation server")]
pub struct Args {
    /// Host address to bind the server to
    #[arg(long, env = "SHAPE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "SHAPE_PORT", default_value_t = 80)]
    pub port: u16,

    /// Directory generated meshes are written to
    #[arg(long, env = "SHAPE_OUTPUT_DIR", default_value = "/mnt/extra/shap_e_outputs")]
    pub output_dir: PathBuf,

    /// Local directory holding the transmitter, text300M and diffusion artifacts
    #[arg(long, env = "SHAPE_MODEL_DIR", default_value = "models/shap-e")]
    pub model_dir: PathBuf,

    /// Hugging Face repo to fetch the Shap-E artifacts from instead of `--model-dir`
    #[arg(long, env = "SHAPE_MODEL_REPO")]
    pub model_repo: Option<String>,

    /// Local directory holding the CLIP text encoder and tokenizer
    #[arg(long, env = "SHAPE_CLIP_DIR")]
    pub clip_dir: Option<PathBuf>,

    /// Hugging Face repo of the CLIP text encoder, used when `--clip-dir` is unset
    #[arg(long, env = "SHAPE_CLIP_REPO", default_value = "openai/clip-vit-large-patch14")]
    pub clip_repo: String,

    /// Use CPU instead of GPU
    #[arg(long, env = "SHAPE_CPU")]
    pub cpu: bool,

    /// Accelerator ordinal
    #[arg(long, env = "SHAPE_DEVICE_ORDINAL", default_value_t = 0)]
    pub device_ordinal: usize,

    /// Mirror the request origin and allow credentials in CORS responses
    #[arg(long, env = "SHAPE_CORS_CREDENTIALS")]
    pub cors_credentials: bool,
}

impl Args {
    pub fn device_map(&self) -> DeviceMap {
        DeviceMap::new(self.cpu, self.device_ordinal)
    }

    pub fn model_sources(&self) -> ModelSources {
        let shap_e = match &self.model_repo {
            Some(repo) => ModelSource::Hub(repo.clone()),
            None => ModelSource::Local(self.model_dir.clone()),
        };
        let clip = match &self.clip_dir {
            Some(dir) => ModelSource::Local(dir.clone()),
            None => ModelSource::Hub(self.clip_repo.clone()),
        };
        ModelSources { shap_e, clip }
    }
}
