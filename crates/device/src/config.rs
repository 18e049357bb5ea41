//! Device configuration

use crate::error::DeviceError;
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default device node
pub const DEFAULT_DEVICE_NODE: &str = "/dev/sm500";

/// Device configuration
///
/// Loaded from an optional TOML file, then `SM500_*` environment variables
/// (for example `SM500_RETRIEVE_TIMEOUT_MS=500`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Register window to open when no node is named
    pub device_node: String,

    /// Retrieval timeout in milliseconds; absent blocks until data or cancel
    pub retrieve_timeout_ms: Option<u64>,

    /// Enable the peaks stream at open
    pub enable_peaks: bool,

    /// Enable the full-spectrum stream at open
    pub enable_full_spectrum: bool,

    /// How long the interrupt dispatcher waits per poll (milliseconds)
    pub irq_poll_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_node: DEFAULT_DEVICE_NODE.to_string(),
            retrieve_timeout_ms: None,
            enable_peaks: true,
            enable_full_spectrum: true,
            irq_poll_ms: 50,
        }
    }
}

impl DeviceConfig {
    /// Peaks only, full spectrum left off
    pub fn peaks_only() -> Self {
        Self {
            enable_full_spectrum: false,
            ..Default::default()
        }
    }

    /// Load from `path` (if given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, DeviceError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(Environment::with_prefix("SM500").try_parsing(true))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    pub fn retrieve_timeout(&self) -> Option<Duration> {
        self.retrieve_timeout_ms.map(Duration::from_millis)
    }

    pub fn irq_poll(&self) -> Duration {
        Duration::from_millis(self.irq_poll_ms.max(1))
    }
}
