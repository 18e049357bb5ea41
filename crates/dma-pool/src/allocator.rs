//! DMA memory and allocators

use crate::error::PoolError;
use parking_lot::Mutex;
use register_port::Stream;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::debug;

/// Page alignment used for every DMA buffer
const PAGE_SIZE: usize = 4096;

/// First synthetic bus address handed out by [`HeapAllocator`]
const HEAP_BUS_BASE: u64 = 0x1000_0000;

/// A physically-contiguous buffer shared between the producer and consumers
///
/// The device (or the engine's timestamping) writes while consumers read, so
/// no Rust reference into the buffer is ever handed out: every access goes
/// through the raw allocation pointer, and consumers copy data out. The
/// flow-control protocol decides when a copy is consistent.
pub struct DmaMemory {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: DmaMemory owns its allocation and only exposes it through bounded
// raw-pointer copies, never through shared or mutable references.
unsafe impl Send for DmaMemory {}
unsafe impl Sync for DmaMemory {}

impl DmaMemory {
    /// Allocate zeroed, page-aligned memory
    pub fn zeroed(len: usize) -> Option<Self> {
        if len == 0 {
            return None;
        }
        let layout = Layout::from_size_align(len, PAGE_SIZE).ok()?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        NonNull::new(raw).map(|ptr| Self { ptr, len, layout })
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the region is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn in_bounds(&self, offset: usize, len: usize) -> bool {
        offset.checked_add(len).is_some_and(|end| end <= self.len)
    }

    /// Volatile copy of `buf.len()` bytes starting at `offset`
    ///
    /// Returns `false`, leaving `buf` untouched, when the range is out of bounds.
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> bool {
        if !self.in_bounds(offset, buf.len()) {
            return false;
        }
        for (i, b) in buf.iter_mut().enumerate() {
            // SAFETY: offset + i < len checked above.
            *b = unsafe { std::ptr::read_volatile(self.ptr.as_ptr().add(offset + i)) };
        }
        true
    }

    /// Copy of the whole region
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read_into(0, &mut out);
        out
    }

    /// Producer-side copy into the region (DMA engine model)
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        if !self.in_bounds(offset, data.len()) {
            return false;
        }
        for (i, b) in data.iter().enumerate() {
            // SAFETY: offset + i < len checked above.
            unsafe { std::ptr::write_volatile(self.ptr.as_ptr().add(offset + i), *b) };
        }
        true
    }

    /// Producer-side volatile store of a little-endian u32
    pub fn write_u32(&self, offset: usize, value: u32) -> bool {
        self.write_at(offset, &value.to_le_bytes())
    }

    /// Volatile load of a little-endian u32
    pub fn read_u32(&self, offset: usize) -> Option<u32> {
        let mut bytes = [0u8; 4];
        self.read_into(offset, &mut bytes)
            .then(|| u32::from_le_bytes(bytes))
    }
}

impl Drop for DmaMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in zeroed() with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for DmaMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaMemory")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len)
            .finish()
    }
}

/// One allocated DMA buffer: its bus address and its memory
#[derive(Debug, Clone)]
pub struct DmaRegion {
    /// Address the device uses to reach the buffer
    pub bus_addr: u64,
    /// Consumer-visible memory
    pub memory: Arc<DmaMemory>,
}

/// Source of physically-contiguous, device-reachable buffers
pub trait DmaAllocator: Send + Sync {
    /// Obtain a buffer of exactly `size` bytes for `stream`
    fn allocate(&self, stream: Stream, size: usize) -> Result<DmaRegion, PoolError>;

    /// Give a buffer back; the memory lives on while consumer views hold it
    fn release(&self, region: &DmaRegion) -> Result<(), PoolError>;
}

#[derive(Default)]
struct HeapState {
    next_bus_addr: u64,
    live: HashMap<u64, Arc<DmaMemory>>,
    allocations: usize,
    fail_after: Option<usize>,
}

/// Heap-backed allocator handing out synthetic 32-bit bus addresses
///
/// Used with simulated hardware; the simulator resolves bus addresses back to
/// memory through [`HeapAllocator::resolve`].
pub struct HeapAllocator {
    state: Mutex<HeapState>,
}

impl HeapAllocator {
    /// Create an allocator
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_bus_addr: HEAP_BUS_BASE,
                ..Default::default()
            }),
        }
    }

    /// Fail every allocation after `successes` successful ones
    pub fn fail_after(&self, successes: usize) {
        self.state.lock().fail_after = Some(successes);
    }

    /// Find the memory behind a bus address, if it is still allocated
    pub fn resolve(&self, bus_addr: u64) -> Option<Arc<DmaMemory>> {
        self.state.lock().live.get(&bus_addr).cloned()
    }

    /// Number of buffers currently allocated
    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaAllocator for HeapAllocator {
    fn allocate(&self, stream: Stream, size: usize) -> Result<DmaRegion, PoolError> {
        let mut state = self.state.lock();
        let slot = state.allocations;

        if state.fail_after.is_some_and(|limit| slot >= limit) {
            return Err(PoolError::AllocationFailed {
                stream,
                slot,
                reason: "allocator exhausted".to_string(),
            });
        }

        let memory = DmaMemory::zeroed(size).ok_or_else(|| PoolError::AllocationFailed {
            stream,
            slot,
            reason: format!("cannot allocate {} bytes", size),
        })?;

        let bus_addr = state.next_bus_addr;
        let span = size.div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        state.next_bus_addr += span as u64;
        state.allocations += 1;

        let memory = Arc::new(memory);
        state.live.insert(bus_addr, memory.clone());
        debug!("Heap DMA buffer {:#x} ({} bytes) for {}", bus_addr, size, stream);

        Ok(DmaRegion { bus_addr, memory })
    }

    fn release(&self, region: &DmaRegion) -> Result<(), PoolError> {
        match self.state.lock().live.remove(&region.bus_addr) {
            Some(_) => Ok(()),
            None => Err(PoolError::ReleaseFailed {
                bus_addr: region.bus_addr,
                reason: "not allocated".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_is_zeroed_and_aligned() {
        let memory = DmaMemory::zeroed(100).unwrap();
        assert_eq!(memory.len(), 100);
        assert!(memory.to_vec().iter().all(|&b| b == 0));
        assert_eq!(memory.ptr.as_ptr() as usize % PAGE_SIZE, 0);
        assert!(DmaMemory::zeroed(0).is_none());
    }

    #[test]
    fn test_bounded_writes() {
        let memory = DmaMemory::zeroed(8).unwrap();
        assert!(memory.write_u32(4, 0x0403_0201));
        assert_eq!(&memory.to_vec()[4..], &[1, 2, 3, 4]);
        assert_eq!(memory.read_u32(4), Some(0x0403_0201));
        assert!(!memory.write_u32(5, 1));
        assert!(!memory.write_at(6, &[0, 0, 0]));
        assert_eq!(memory.read_u32(usize::MAX), None);

        let mut buf = [0xAAu8; 4];
        assert!(!memory.read_into(6, &mut buf));
        assert_eq!(buf, [0xAA; 4]);
        assert!(memory.read_into(3, &mut buf[..2]));
        assert_eq!(buf, [0, 1, 0xAA, 0xAA]);
    }

    #[test]
    fn test_concurrent_writer_and_reader() {
        let memory = Arc::new(DmaMemory::zeroed(64).unwrap());
        let writer = {
            let memory = memory.clone();
            std::thread::spawn(move || {
                for round in 0..1_000u32 {
                    memory.write_at(0, &[round as u8; 64]);
                }
            })
        };
        let mut copy = [0u8; 64];
        for _ in 0..1_000 {
            assert!(memory.read_into(0, &mut copy));
        }
        writer.join().unwrap();

        assert_eq!(memory.to_vec(), vec![999u32 as u8; 64]);
    }

    #[test]
    fn test_heap_allocator_addresses_and_release() {
        let allocator = HeapAllocator::new();
        let a = allocator.allocate(Stream::Peaks, 64).unwrap();
        let b = allocator.allocate(Stream::Peaks, 5000).unwrap();
        let c = allocator.allocate(Stream::Peaks, 64).unwrap();

        assert_eq!(a.bus_addr, HEAP_BUS_BASE);
        assert_eq!(b.bus_addr, HEAP_BUS_BASE + 4096);
        assert_eq!(c.bus_addr, HEAP_BUS_BASE + 3 * 4096);
        assert_eq!(allocator.live(), 3);
        assert!(allocator.resolve(b.bus_addr).is_some());

        allocator.release(&b).unwrap();
        assert!(allocator.resolve(b.bus_addr).is_none());
        assert!(matches!(
            allocator.release(&b),
            Err(PoolError::ReleaseFailed { .. })
        ));
        assert_eq!(allocator.live(), 2);
    }

    #[test]
    fn test_heap_allocator_failure_injection() {
        let allocator = HeapAllocator::new();
        allocator.fail_after(1);
        assert!(allocator.allocate(Stream::FullSpectrum, 32).is_ok());
        assert!(matches!(
            allocator.allocate(Stream::FullSpectrum, 32),
            Err(PoolError::AllocationFailed { slot: 1, .. })
        ));
    }
}
