//! Compute device selection.

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, ModelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

/// Where tensors live. Resolved once and passed to every constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub kind: DeviceKind,

    /// CUDA ordinal (ignored on CPU).
    #[serde(default)]
    pub ordinal: usize,
}

impl DeviceConfig {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn cuda(ordinal: usize) -> Self {
        Self {
            kind: DeviceKind::Cuda,
            ordinal,
        }
    }

    /// Parse `cpu`, `cuda` or `cuda:N`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::cpu()),
            "cuda" => Some(Self::cuda(0)),
            other => other
                .strip_prefix("cuda:")
                .and_then(|n| n.parse().ok())
                .map(Self::cuda),
        }
    }

    /// # Errors
    /// - `ModelError::ConfigError` if CUDA is requested but unavailable
    pub fn to_device(&self) -> ModelResult<Device> {
        match self.kind {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda => Device::new_cuda(self.ordinal).map_err(|e| ModelError::ConfigError {
                message: format!("CUDA device {} unavailable: {}", self.ordinal, e),
            }),
        }
    }
}
