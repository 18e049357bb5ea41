//! Per-stream buffer arena

use crate::allocator::{DmaAllocator, DmaMemory, DmaRegion};
use crate::error::PoolError;
use crate::trailer::{Timestamp, TIMESTAMP_LEN};
use parking_lot::RwLock;
use register_port::{map, RegisterPort, Stream};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Buffer geometry of one stream, as reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Number of buffers (power of two)
    pub count: usize,
    /// Size of one buffer in bytes
    pub size: usize,
    /// Byte offset of the timestamp inside each buffer
    pub timestamp_offset: usize,
}

impl Geometry {
    /// Read the geometry registers of a stream
    pub fn discover(port: &RegisterPort, stream: Stream) -> Result<Self, PoolError> {
        let count = port.read32(stream.count_register())? as usize;
        let size = port.read32(stream.size_register())? as usize;
        let timestamp_offset = port.read32(map::TSOFST)? as usize;
        Ok(Self {
            count,
            size,
            timestamp_offset,
        })
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self, stream: Stream) -> Result<(), PoolError> {
        let invalid = |reason: String| PoolError::InvalidGeometry { stream, reason };

        if self.count == 0 || !self.count.is_power_of_two() {
            return Err(invalid(format!(
                "buffer count {} is not a power of two",
                self.count
            )));
        }
        if self.count > stream.address_slots() {
            return Err(invalid(format!(
                "buffer count {} exceeds {} address registers",
                self.count,
                stream.address_slots()
            )));
        }
        if self.timestamp_offset % 4 != 0 {
            return Err(invalid(format!(
                "timestamp offset {} is not word aligned",
                self.timestamp_offset
            )));
        }
        if self.timestamp_offset + TIMESTAMP_LEN > self.size {
            return Err(invalid(format!(
                "timestamp at {} does not fit in {}-byte buffers",
                self.timestamp_offset, self.size
            )));
        }
        Ok(())
    }

    /// Index mask for cursor wraparound
    pub fn mask(&self) -> usize {
        self.count - 1
    }
}

/// Fixed arena of DMA buffers for one stream
///
/// Slot `i` is registered with the device as its `i`-th target address, so the
/// registration order is the slot index the hardware reports.
pub struct BufferPool {
    stream: Stream,
    geometry: Geometry,
    allocator: Arc<dyn DmaAllocator>,
    slots: RwLock<Vec<Option<DmaRegion>>>,
}

impl BufferPool {
    /// Create an empty pool; nothing is allocated until [`BufferPool::setup`]
    pub fn new(
        stream: Stream,
        geometry: Geometry,
        allocator: Arc<dyn DmaAllocator>,
    ) -> Result<Self, PoolError> {
        geometry.validate(stream)?;
        Ok(Self {
            stream,
            geometry,
            allocator,
            slots: RwLock::new(vec![None; geometry.count]),
        })
    }

    /// Allocate every buffer and program its bus address, in slot order
    ///
    /// On failure the buffers obtained so far stay in the pool; call
    /// [`BufferPool::teardown`] to release them.
    pub fn setup(&self, port: &RegisterPort) -> Result<Geometry, PoolError> {
        let mut slots = self.slots.write();

        for slot in 0..self.geometry.count {
            if slots[slot].is_some() {
                continue;
            }

            let region = self.allocator.allocate(self.stream, self.geometry.size)?;
            let bus_addr = region.bus_addr;
            slots[slot] = Some(region);

            let reg = self
                .stream
                .address_register(slot)
                .ok_or_else(|| self.allocation_failed(slot, "no address register for slot"))?;
            let addr32 = u32::try_from(bus_addr).map_err(|_| {
                self.allocation_failed(slot, format!("bus address {:#x} above 4 GiB", bus_addr))
            })?;
            port.write32(reg, addr32)
                .map_err(|e| self.allocation_failed(slot, e.to_string()))?;

            debug!(
                "Allocated {} bytes for {} buffer #{} at bus address {:#x}",
                self.geometry.size, self.stream, slot, bus_addr
            );
        }

        info!(
            "{} pool ready: {} x {} bytes",
            self.stream, self.geometry.count, self.geometry.size
        );
        Ok(self.geometry)
    }

    fn allocation_failed(&self, slot: usize, reason: impl Into<String>) -> PoolError {
        PoolError::AllocationFailed {
            stream: self.stream,
            slot,
            reason: reason.into(),
        }
    }

    /// Release every buffer; tolerates empty slots and release failures
    ///
    /// Returns the number of buffers handed back to the allocator.
    pub fn teardown(&self) -> usize {
        let mut slots = self.slots.write();
        let mut released = 0;

        for (slot, entry) in slots.iter_mut().enumerate() {
            let Some(region) = entry.take() else {
                continue;
            };
            match self.allocator.release(&region) {
                Ok(()) => {
                    released += 1;
                    debug!("Freed {} buffer #{}", self.stream, slot);
                }
                Err(e) => warn!("Failed to release {} buffer #{}: {}", self.stream, slot, e),
            }
        }

        if released > 0 {
            info!("{} pool torn down ({} buffers)", self.stream, released);
        }
        released
    }

    /// Stream served by this pool
    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Geometry the pool was built with
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Number of buffers currently held
    pub fn mapped(&self) -> usize {
        self.slots.read().iter().filter(|s| s.is_some()).count()
    }

    /// Bus address programmed for a slot
    pub fn bus_addr(&self, index: usize) -> Result<u64, PoolError> {
        self.with_region(index, |r| r.bus_addr)
    }

    fn with_region<T>(&self, index: usize, f: impl FnOnce(&DmaRegion) -> T) -> Result<T, PoolError> {
        if index >= self.geometry.count {
            return Err(PoolError::InvalidBufferIndex {
                stream: self.stream,
                index,
                count: self.geometry.count,
            });
        }
        let slots = self.slots.read();
        slots[index].as_ref().map(f).ok_or(PoolError::NotMapped {
            stream: self.stream,
            index,
        })
    }

    /// Read-only view of a slot's memory; no copy is made
    pub fn map_for_consumer(&self, index: usize) -> Result<BufferView, PoolError> {
        let memory = self.with_region(index, |r| r.memory.clone())?;
        Ok(BufferView {
            stream: self.stream,
            index,
            timestamp_offset: self.geometry.timestamp_offset,
            memory,
        })
    }

    /// Write the completion timestamp into a slot
    pub fn stamp(&self, index: usize, ts: Timestamp) -> Result<(), PoolError> {
        let offset = self.geometry.timestamp_offset;
        self.with_region(index, |r| {
            r.memory.write_u32(offset, ts.secs);
            r.memory.write_u32(offset + 4, ts.nanos);
        })
    }

    /// Read back a slot's completion timestamp
    pub fn timestamp(&self, index: usize) -> Result<Timestamp, PoolError> {
        let offset = self.geometry.timestamp_offset;
        self.with_region(index, |r| read_timestamp(&r.memory, offset))
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn read_timestamp(memory: &DmaMemory, offset: usize) -> Timestamp {
    Timestamp {
        secs: memory.read_u32(offset).unwrap_or(0),
        nanos: memory.read_u32(offset + 4).unwrap_or(0),
    }
}

/// Zero-copy, read-only view of one DMA buffer
///
/// Contents are stable until the next retrieval on the same stream; after the
/// producer wraps around it may overwrite the slot.
#[derive(Clone)]
pub struct BufferView {
    stream: Stream,
    index: usize,
    timestamp_offset: usize,
    memory: Arc<DmaMemory>,
}

impl BufferView {
    /// Stream the buffer belongs to
    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Slot index in the pool
    pub fn index(&self) -> usize {
        self.index
    }

    /// Copy of the buffer contents (exactly `buffer_size` bytes)
    pub fn to_vec(&self) -> Vec<u8> {
        self.memory.to_vec()
    }

    /// Copy `buf.len()` bytes starting at `offset`; `false` if out of range
    pub fn read_into(&self, offset: usize, buf: &mut [u8]) -> bool {
        self.memory.read_into(offset, buf)
    }

    /// Buffer size in bytes
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Completion timestamp written by the producer
    pub fn timestamp(&self) -> Timestamp {
        read_timestamp(&self.memory, self.timestamp_offset)
    }
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("stream", &self.stream)
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HeapAllocator;
    use parking_lot::Mutex;
    use register_port::{RegisterBus, RegisterError};
    use std::collections::HashMap;

    #[derive(Default)]
    struct Regs(Mutex<HashMap<u32, u32>>);

    impl RegisterBus for Regs {
        fn read8(&self, reg: u32) -> Result<u8, RegisterError> {
            Ok(self.read32(reg)? as u8)
        }
        fn read16(&self, reg: u32) -> Result<u16, RegisterError> {
            Ok(self.read32(reg)? as u16)
        }
        fn read32(&self, reg: u32) -> Result<u32, RegisterError> {
            Ok(self.0.lock().get(&reg).copied().unwrap_or(0))
        }
        fn write8(&self, reg: u32, value: u8) -> Result<(), RegisterError> {
            self.write32(reg, value as u32)
        }
        fn write16(&self, reg: u32, value: u16) -> Result<(), RegisterError> {
            self.write32(reg, value as u32)
        }
        fn write32(&self, reg: u32, value: u32) -> Result<(), RegisterError> {
            self.0.lock().insert(reg, value);
            Ok(())
        }
    }

    fn port_with_geometry(count: u32, size: u32, offset: u32) -> (Arc<Regs>, RegisterPort) {
        let regs = Arc::new(Regs::default());
        regs.write32(map::NPKBUF, count).unwrap();
        regs.write32(map::PKBUFSZ, size).unwrap();
        regs.write32(map::TSOFST, offset).unwrap();
        let port = RegisterPort::new(regs.clone());
        (regs, port)
    }

    fn geometry(count: usize) -> Geometry {
        Geometry {
            count,
            size: 64,
            timestamp_offset: 56,
        }
    }

    #[test]
    fn test_discover_reads_registers() {
        let (_regs, port) = port_with_geometry(4, 64, 56);
        let g = Geometry::discover(&port, Stream::Peaks).unwrap();
        assert_eq!(g, geometry(4));
        assert_eq!(g.mask(), 3);
    }

    #[test]
    fn test_geometry_validation() {
        assert!(geometry(4).validate(Stream::Peaks).is_ok());
        assert!(geometry(3).validate(Stream::Peaks).is_err());
        assert!(geometry(0).validate(Stream::Peaks).is_err());
        assert!(geometry(16).validate(Stream::Peaks).is_err());
        assert!(geometry(2).validate(Stream::FullSpectrum).is_err());
        let bad_trailer = Geometry {
            timestamp_offset: 60,
            ..geometry(4)
        };
        assert!(matches!(
            bad_trailer.validate(Stream::Peaks),
            Err(PoolError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_setup_registers_addresses_in_slot_order() {
        let (regs, port) = port_with_geometry(4, 64, 56);
        let allocator = Arc::new(HeapAllocator::new());
        let pool = BufferPool::new(Stream::Peaks, geometry(4), allocator.clone()).unwrap();
        pool.setup(&port).unwrap();

        assert_eq!(pool.mapped(), 4);
        for slot in 0..4 {
            let programmed = regs.read32(map::DMATAR0 + slot as u32).unwrap() as u64;
            assert_eq!(programmed, pool.bus_addr(slot).unwrap());
        }
        assert!(pool.bus_addr(0).unwrap() < pool.bus_addr(1).unwrap());
    }

    #[test]
    fn test_partial_setup_is_released_by_teardown() {
        let (_regs, port) = port_with_geometry(4, 64, 56);
        let allocator = Arc::new(HeapAllocator::new());
        allocator.fail_after(2);
        let pool = BufferPool::new(Stream::Peaks, geometry(4), allocator.clone()).unwrap();

        let err = pool.setup(&port).unwrap_err();
        assert!(matches!(err, PoolError::AllocationFailed { slot: 2, .. }));
        assert_eq!(pool.mapped(), 2);
        assert_eq!(allocator.live(), 2);

        assert_eq!(pool.teardown(), 2);
        assert_eq!(allocator.live(), 0);
        // second teardown is a no-op
        assert_eq!(pool.teardown(), 0);
    }

    #[test]
    fn test_views_share_memory_with_producer() {
        let (_regs, port) = port_with_geometry(2, 64, 56);
        let pool = BufferPool::new(Stream::Peaks, geometry(2), Arc::new(HeapAllocator::new())).unwrap();
        pool.setup(&port).unwrap();

        let view = pool.map_for_consumer(1).unwrap();
        assert_eq!(view.len(), 64);
        assert_eq!(view.timestamp(), Timestamp::default());

        pool.stamp(1, Timestamp::new(10, 20)).unwrap();
        assert_eq!(view.timestamp(), Timestamp::new(10, 20));
        assert_eq!(pool.timestamp(1).unwrap(), Timestamp::new(10, 20));
        let mut secs = [0u8; 4];
        assert!(view.read_into(56, &mut secs));
        assert_eq!(secs, 10u32.to_le_bytes());
        assert!(!view.read_into(62, &mut secs));
    }

    #[test]
    fn test_invalid_and_unmapped_indices() {
        let pool = BufferPool::new(Stream::Peaks, geometry(2), Arc::new(HeapAllocator::new())).unwrap();
        assert!(matches!(
            pool.map_for_consumer(2),
            Err(PoolError::InvalidBufferIndex { index: 2, count: 2, .. })
        ));
        assert!(matches!(
            pool.map_for_consumer(0),
            Err(PoolError::NotMapped { index: 0, .. })
        ));
    }

    #[test]
    fn test_view_outlives_teardown() {
        let (_regs, port) = port_with_geometry(1, 64, 56);
        let allocator = Arc::new(HeapAllocator::new());
        let pool = BufferPool::new(Stream::Peaks, geometry(1), allocator.clone()).unwrap();
        pool.setup(&port).unwrap();
        pool.stamp(0, Timestamp::new(3, 4)).unwrap();

        let view = pool.map_for_consumer(0).unwrap();
        pool.teardown();
        assert_eq!(allocator.live(), 0);
        assert_eq!(view.timestamp(), Timestamp::new(3, 4));
    }
}
