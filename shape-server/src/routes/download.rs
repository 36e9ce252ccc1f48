use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, State},
    http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn download(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<Response, ApiError> {
    let path = state
        .outputs
        .resolve(&filename)
        .await
        .ok_or(ApiError::FileNotFound)?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::FileNotFound)?;
    let len = file
        .metadata()
        .await
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();

    let headers = [
        (CONTENT_TYPE, "application/octet-stream".to_string()),
        (CONTENT_LENGTH, len.to_string()),
        (
            CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}
