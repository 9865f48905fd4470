//! # Device Selection
//!
//! Picks the compute device (CPU/GPU) the speech model runs on, falling back to
//! the CPU whenever the requested accelerator is unavailable.

use candle_core::Device;
use tracing::{debug, info};

/// Device preferences for model inference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Automatically select the best available device
    #[default]
    Auto,
    /// Force CPU usage
    Cpu,
    /// CUDA GPU (falls back to CPU if not available)
    Cuda,
    /// Metal GPU (falls back to CPU if not available)
    Metal,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" => Ok(DevicePreference::Metal),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

impl DevicePreference {
    /// Resolve the preference to a concrete device.
    pub fn resolve(self) -> Device {
        match self {
            DevicePreference::Auto => detect_best_device(),
            DevicePreference::Cpu => Device::Cpu,
            DevicePreference::Cuda => cuda_device().unwrap_or(Device::Cpu),
            DevicePreference::Metal => metal_device().unwrap_or(Device::Cpu),
        }
    }
}

fn detect_best_device() -> Device {
    if let Some(device) = cuda_device() {
        info!("Selected CUDA GPU for inference");
        return device;
    }

    if let Some(device) = metal_device() {
        info!("Selected Metal GPU for inference");
        return device;
    }

    info!("Using CPU for inference (no GPU acceleration available)");
    Device::Cpu
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}

/// Human-readable device name for logs.
pub fn describe(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA GPU",
        Device::Metal(_) => "Metal GPU",
    }
}
