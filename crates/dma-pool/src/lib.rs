//! DMA Buffer Pool
//!
//! Provides per-stream arenas of preallocated, hardware-addressable buffers.
//! Slots are addressed by index; consumers get read-only views that share the
//! producer's memory without copying.

mod allocator;
mod error;
mod pool;
mod select;
mod trailer;

pub use allocator::{DmaAllocator, DmaMemory, DmaRegion, HeapAllocator};
pub use error::PoolError;
pub use pool::{BufferPool, BufferView, Geometry};
pub use select::{BufferSelector, FS_SELECT};
pub use trailer::{Timestamp, TIMESTAMP_LEN};
