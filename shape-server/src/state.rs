use candle_core::Device;
use chrono::{DateTime, Local};
use shape_core::{LoadingStatus, ModelHandles};

use crate::output::OutputStore;

/// Everything the handlers share. Built once after startup loading and
/// never mutated afterwards.
#[derive(Debug)]
pub struct AppState {
    pub device: Device,
    pub models: ModelHandles,
    pub status: LoadingStatus,
    pub started_at: DateTime<Local>,
    pub outputs: OutputStore,
}

impl AppState {
    pub fn new(
        device: Device,
        models: ModelHandles,
        status: LoadingStatus,
        outputs: OutputStore,
    ) -> Self {
        Self {
            device,
            models,
            status,
            started_at: Local::now(),
            outputs,
        }
    }
}

/// Local time without offset, microsecond precision.
pub fn iso_timestamp(time: &DateTime<Local>) -> String {
    time.naive_local()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}
