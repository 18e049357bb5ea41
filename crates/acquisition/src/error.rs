//! Acquisition Error Types

use dma_pool::PoolError;
use register_port::{RegisterError, Stream};
use std::time::Duration;
use thiserror::Error;

/// Errors reported to consumers and to the interrupt binding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    /// A blocked retrieval was released by a cancel, not by data
    #[error("Retrieval on {stream} cancelled")]
    Cancelled { stream: Stream },

    /// No completion arrived within the requested timeout
    #[error("No {stream} data within {waited:?}")]
    Timeout { stream: Stream, waited: Duration },

    /// The stream is not producing (never armed, disarmed or faulted)
    #[error("Stream {stream} is idle")]
    StreamIdle { stream: Stream },

    /// The stream has no buffer pool attached
    #[error("Stream {stream} has no buffer pool")]
    NotAttached { stream: Stream },

    /// Interrupt source failed
    #[error("Interrupt source error: {0}")]
    Interrupt(String),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}
