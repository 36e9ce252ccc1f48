use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Prompt is required")]
    MissingPrompt,
    #[error("Models not loaded")]
    ModelsNotLoaded,
    #[error("File not found")]
    FileNotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingPrompt => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::ModelsNotLoaded => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::FileNotFound => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            tracing::error!("request failed: {e:?}");
        }
        let body = Json(json!({
            "detail": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}
