//! Device selection: CUDA > Metal > CPU fallback, or an explicit selector.

use advreg_core::{AdvRegError, Result};
use candle_core::Device;

/// Select the best available compute device.
///
/// Tries CUDA first (when compiled with `cuda` feature), then Metal
/// (when compiled with `metal` feature), then falls back to CPU.
pub fn select_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            tracing::info!("Using CUDA device 0");
            return device;
        }
        tracing::warn!("CUDA feature enabled but no GPU available, falling back");
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            tracing::info!("Using Metal device 0");
            return device;
        }
        tracing::warn!("Metal feature enabled but no device available, falling back");
    }

    Device::Cpu
}

/// Resolve a selector of the form `auto`, `cpu`, `cuda[:N]` or `metal[:N]`.
///
/// An explicit accelerator that cannot be opened is an error rather than a
/// silent CPU fallback.
pub fn resolve_device(selector: &str) -> Result<Device> {
    let selector = selector.trim().to_ascii_lowercase();
    let (kind, ordinal) = match selector.split_once(':') {
        Some((kind, ordinal)) => {
            let ordinal = ordinal.parse::<usize>().map_err(|_| {
                AdvRegError::Config(format!("invalid device ordinal in '{selector}'"))
            })?;
            (kind, ordinal)
        }
        None => (selector.as_str(), 0),
    };

    match kind {
        "auto" => Ok(select_device()),
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(ordinal)
            .map_err(|e| AdvRegError::Config(format!("CUDA device {ordinal} unavailable: {e}"))),
        "metal" => Device::new_metal(ordinal)
            .map_err(|e| AdvRegError::Config(format!("Metal device {ordinal} unavailable: {e}"))),
        other => Err(AdvRegError::Config(format!(
            "unknown device '{other}' (expected auto, cpu, cuda:N or metal:N)"
        ))),
    }
}
