//! Command Error Types

use device::DeviceError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Unknown request code {0:#010x}")]
    UnknownRequest(u32),

    #[error("Frame encoding error: {0}")]
    Codec(String),
}

impl From<postcard::Error> for CommandError {
    fn from(e: postcard::Error) -> Self {
        CommandError::Codec(e.to_string())
    }
}
