//! Device Error Types

use acquisition::AcquisitionError;
use dma_pool::PoolError;
use register_port::{RegisterError, Stream};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to applications using the device
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Device not open, or already closed
    #[error("Device is not open")]
    DeviceUnavailable,

    /// The underlying register transaction failed
    #[error("Register access failed: {0}")]
    RegisterAccessFailed(RegisterError),

    /// A buffer could not be obtained or registered during setup
    #[error("{stream} buffer allocation failed: {reason}")]
    AllocationFailed { stream: Stream, reason: String },

    /// Mapping or selection outside `[0, count)`
    #[error("{stream} buffer index {index} out of range (count {count})")]
    InvalidBufferIndex {
        stream: Stream,
        index: usize,
        count: usize,
    },

    /// A blocking retrieval was released by cancel, not by data
    #[error("Retrieval on {stream} cancelled")]
    Cancelled { stream: Stream },

    /// Geometry registers describe buffers the engine cannot drive
    #[error("Invalid {stream} geometry: {reason}")]
    InvalidGeometry { stream: Stream, reason: String },

    /// The retrieval timeout elapsed
    #[error("No {stream} data within {waited:?}")]
    Timeout { stream: Stream, waited: Duration },

    /// The stream is not enabled on this device (or stopped after a fault)
    #[error("Stream {stream} is not running")]
    StreamDisabled { stream: Stream },

    /// A buffer could not be handed back
    #[error("Buffer release failed: {0}")]
    ReleaseFailed(String),

    /// Interrupt binding failed
    #[error("Interrupt error: {0}")]
    Interrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<RegisterError> for DeviceError {
    fn from(e: RegisterError) -> Self {
        DeviceError::RegisterAccessFailed(e)
    }
}

impl From<PoolError> for DeviceError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::AllocationFailed {
                stream,
                slot,
                reason,
            } => DeviceError::AllocationFailed {
                stream,
                reason: format!("buffer #{}: {}", slot, reason),
            },
            PoolError::InvalidGeometry { stream, reason } => {
                DeviceError::InvalidGeometry { stream, reason }
            }
            PoolError::InvalidBufferIndex {
                stream,
                index,
                count,
            } => DeviceError::InvalidBufferIndex {
                stream,
                index,
                count,
            },
            PoolError::NotMapped { .. } => DeviceError::DeviceUnavailable,
            PoolError::ReleaseFailed { bus_addr, reason } => {
                DeviceError::ReleaseFailed(format!("bus address {:#x}: {}", bus_addr, reason))
            }
            PoolError::Register(e) => e.into(),
        }
    }
}

impl From<AcquisitionError> for DeviceError {
    fn from(e: AcquisitionError) -> Self {
        match e {
            AcquisitionError::Cancelled { stream } => DeviceError::Cancelled { stream },
            AcquisitionError::Timeout { stream, waited } => DeviceError::Timeout { stream, waited },
            AcquisitionError::StreamIdle { stream } | AcquisitionError::NotAttached { stream } => {
                DeviceError::StreamDisabled { stream }
            }
            AcquisitionError::Interrupt(msg) => DeviceError::Interrupt(msg),
            AcquisitionError::Register(e) => e.into(),
            AcquisitionError::Pool(e) => e.into(),
        }
    }
}

impl From<::config::ConfigError> for DeviceError {
    fn from(e: ::config::ConfigError) -> Self {
        DeviceError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_failures_keep_their_cause() {
        assert_eq!(
            DeviceError::from(RegisterError::DeviceUnavailable),
            DeviceError::RegisterAccessFailed(RegisterError::DeviceUnavailable)
        );
        assert!(matches!(
            DeviceError::from(RegisterError::access_failed(0x101, "bus")),
            DeviceError::RegisterAccessFailed(_)
        ));
    }

    #[test]
    fn test_pool_errors_keep_their_meaning() {
        let err = DeviceError::from(PoolError::InvalidBufferIndex {
            stream: Stream::Peaks,
            index: 9,
            count: 4,
        });
        assert_eq!(
            err,
            DeviceError::InvalidBufferIndex {
                stream: Stream::Peaks,
                index: 9,
                count: 4
            }
        );
        let err = DeviceError::from(PoolError::AllocationFailed {
            stream: Stream::FullSpectrum,
            slot: 0,
            reason: "exhausted".to_string(),
        });
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_cancel_is_distinct_from_timeout() {
        assert_eq!(
            DeviceError::from(AcquisitionError::Cancelled {
                stream: Stream::Peaks
            }),
            DeviceError::Cancelled {
                stream: Stream::Peaks
            }
        );
        assert!(matches!(
            DeviceError::from(AcquisitionError::StreamIdle {
                stream: Stream::FullSpectrum
            }),
            DeviceError::StreamDisabled { .. }
        ));
    }
}
