use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use shape_core::{device_label, load_all, select_best_device};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod output;
mod params;
mod routes;
mod state;

use config::{Args, DEFAULT_LOG_FILTER};
use output::OutputStore;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();

    let device = select_best_device(args.device_map()).context("failed to set up device")?;
    info!("using device {}", device_label(&device));

    // Load failures are reported through /status; the server starts regardless.
    let (models, status) = load_all(&args.model_sources(), &device).await;
    info!("model status: {}", status.state);

    let outputs = OutputStore::new(&args.output_dir);
    info!("writing meshes to {}", outputs.dir().display());

    let state = Arc::new(AppState::new(device, models, status, outputs));
    let app = routes::router(state, routes::cors_layer(args.cors_credentials));

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
