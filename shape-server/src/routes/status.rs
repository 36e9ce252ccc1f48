use std::sync::Arc;

use axum::{extract::State, Json};
use candle_core::utils::cuda_is_available;
use serde::Serialize;
use shape_core::{device_label, memory_usage, LoadState, MODEL_VERSION};

use crate::state::{iso_timestamp, AppState};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub models_loaded: bool,
    pub model_status: LoadState,
    pub device: String,
    pub cuda_available: bool,
    pub memory_usage: Option<String>,
    pub error: Option<String>,
    pub model_uptime: String,
    pub model_version: &'static str,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        models_loaded: state.models.is_ready(),
        model_status: state.status.state,
        device: device_label(&state.device),
        cuda_available: cuda_is_available(),
        memory_usage: memory_usage(&state.device),
        error: state.status.error.clone(),
        model_uptime: iso_timestamp(&state.started_at),
        model_version: MODEL_VERSION,
    })
}
