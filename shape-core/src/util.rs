use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, DeviceLocation};

use crate::DeviceMap;

const GIB: f64 = (1u64 << 30) as f64;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                tracing::warn!(
                    "running on CPU, to run on GPU(metal), build with `--features metal`"
                );
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                tracing::warn!("running on CPU, to run on GPU, build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Short device name in the `kind:ordinal` form used by the status endpoint.
pub fn device_label(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{gpu_id}"),
        DeviceLocation::Metal { gpu_id } => format!("metal:{gpu_id}"),
    }
}

/// Accelerator memory usage as `"<used>GB / <total>GB"`.
///
/// `None` when no CUDA runtime is present. A failing query is reported as
/// `"Unavailable"` rather than an error.
pub fn memory_usage(device: &Device) -> Option<String> {
    if !cuda_is_available() {
        return None;
    }
    let usage = match cuda_memory(device) {
        Ok((used, total)) => format_memory(used, total),
        Err(e) => {
            tracing::debug!("memory query failed: {e:#}");
            "Unavailable".to_string()
        }
    };
    Some(usage)
}

fn format_memory(used: u64, total: u64) -> String {
    format!("{:.1}GB / {:.1}GB", used as f64 / GIB, total as f64 / GIB)
}

/// Device-wide used and total bytes. The query runs on whatever thread
/// serves the request, so the device's context is bound first.
#[cfg(feature = "cuda")]
fn cuda_memory(device: &Device) -> Result<(u64, u64)> {
    match device {
        Device::Cuda(dev) => {
            let context = dev.cuda_stream().context().clone();
            context.bind_to_thread()?;
            let (free, total) = context.mem_get_info()?;
            Ok(((total - free) as u64, total as u64))
        }
        _ => anyhow::bail!("selected device is not a CUDA device"),
    }
}

#[cfg(not(feature = "cuda"))]
fn cuda_memory(_device: &Device) -> Result<(u64, u64)> {
    anyhow::bail!("built without CUDA support")
}
