//! Buffer Pool Error Types

use register_port::{RegisterError, Stream};
use thiserror::Error;

/// Errors raised while building, mapping or releasing DMA buffers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// A buffer could not be obtained or registered with the device
    #[error("{stream} buffer #{slot} allocation failed: {reason}")]
    AllocationFailed {
        stream: Stream,
        slot: usize,
        reason: String,
    },

    /// Geometry registers describe a pool this engine cannot drive
    #[error("Invalid {stream} geometry: {reason}")]
    InvalidGeometry { stream: Stream, reason: String },

    /// Mapping or selection outside `[0, count)`
    #[error("{stream} buffer index {index} out of range (count {count})")]
    InvalidBufferIndex {
        stream: Stream,
        index: usize,
        count: usize,
    },

    /// Slot exists but holds no buffer (torn down or never allocated)
    #[error("{stream} buffer #{index} is not mapped")]
    NotMapped { stream: Stream, index: usize },

    /// The allocator refused to take a region back
    #[error("Release of bus address {bus_addr:#x} failed: {reason}")]
    ReleaseFailed { bus_addr: u64, reason: String },

    /// Register access failed while reading geometry
    #[error(transparent)]
    Register(#[from] RegisterError),
}
