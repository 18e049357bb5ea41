//! Register Access Error Types

use thiserror::Error;

/// Errors that can occur while accessing device registers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// The port has no open device handle
    #[error("Device handle is not open")]
    DeviceUnavailable,

    /// The bus rejected or failed the transaction
    #[error("Register {reg:#06x} access failed: {reason}")]
    AccessFailed { reg: u32, reason: String },

    /// Register number lies outside the mapped window
    #[error("Register {reg:#06x} ({width} bytes) is outside the {window}-byte register window")]
    OutOfWindow { reg: u32, width: usize, window: usize },
}

impl RegisterError {
    /// Build an access failure for a register
    pub fn access_failed(reg: u32, reason: impl Into<String>) -> Self {
        RegisterError::AccessFailed {
            reg,
            reason: reason.into(),
        }
    }
}
