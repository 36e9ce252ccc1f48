use std::sync::Arc;

use anyhow::Context;
use axum::{extract::State, Json};
use chrono::Local;
use serde::Serialize;

use crate::error::ApiError;
use crate::params::GenerateParams;
use crate::state::{iso_timestamp, AppState};

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub message: &'static str,
    pub prompt: String,
    pub output_id: String,
    pub download_url: String,
    pub timestamp: String,
}

pub async fn generate(
    State(state): State<Arc<AppState>>,
    GenerateParams(request): GenerateParams,
) -> Result<Json<GenerateResponse>, ApiError> {
    let model = state.models.ready().ok_or(ApiError::ModelsNotLoaded)?;

    tracing::info!(
        "generating 3D object for prompt {:?} (guidance {}, {} steps, seed {:?})",
        request.prompt,
        request.guidance_scale,
        request.num_inference_steps,
        request.seed
    );
    let prompt = request.prompt.clone();
    let mesh = tokio::task::spawn_blocking(move || model.generate(&request))
        .await
        .context("generation task failed")??;

    let output_id = state.outputs.persist(mesh).await?;
    Ok(Json(GenerateResponse {
        message: "3D object generated successfully",
        prompt,
        output_id: output_id.to_string(),
        download_url: format!("/download/{output_id}.obj"),
        timestamp: iso_timestamp(&Local::now()),
    }))
}
