//! Consumer flow control: cursors, readiness, blocking retrieval, cancel

use crate::cursor::{advance, pending};
use crate::error::AcquisitionError;
use dma_pool::{BufferPool, BufferView, Timestamp};
use parking_lot::{Condvar, Mutex, MutexGuard};
use register_port::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Production state of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Interrupts off; retrievals fail
    Idle,
    /// Interrupts and DMA enabled, nothing completed yet
    Armed,
    /// At least one completion since arming
    Running,
}

/// Per-stream counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Buffers completed by the producer
    pub completed: u64,
    /// Buffers handed to consumers
    pub retrieved: u64,
    /// Completions that overwrote unread data
    pub overruns: u64,
    /// Retrievals released by cancel or disarm
    pub cancellations: u64,
    /// Unread completions discarded by flush
    pub flushed: u64,
    /// Times the stream was shut down by a producer-side failure
    pub faults: u64,
}

/// Cursor pair and bookkeeping for one stream
pub(crate) struct Ring {
    pub(crate) stream: Stream,
    pool: Option<Arc<BufferPool>>,
    mask: usize,
    write_ptr: usize,
    read_ptr: usize,
    /// Slot most recently filled by the producer
    last_completed: usize,
    ready: bool,
    pub(crate) state: StreamState,
    /// Bumped to release every waiter
    generation: u64,
    waiters: usize,
    /// Timestamp captured for the next full-spectrum completion
    pub(crate) pending_fs: Option<Timestamp>,
    pub(crate) stats: StreamStats,
}

impl Ring {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            pool: None,
            mask: 0,
            write_ptr: 0,
            read_ptr: 0,
            last_completed: 0,
            ready: false,
            state: StreamState::Idle,
            generation: 0,
            waiters: 0,
            pending_fs: None,
            stats: StreamStats::default(),
        }
    }

    fn reset_cursors(&mut self) {
        self.write_ptr = 0;
        self.read_ptr = 0;
        self.last_completed = 0;
        self.ready = false;
        self.pending_fs = None;
    }

    fn has_data(&self) -> bool {
        match self.stream {
            Stream::Peaks => self.read_ptr != self.write_ptr,
            Stream::FullSpectrum => self.ready,
        }
    }

    fn take(&mut self) -> usize {
        self.stats.retrieved += 1;
        match self.stream {
            Stream::Peaks => {
                let slot = self.read_ptr;
                self.read_ptr = advance(self.read_ptr, self.mask);
                self.ready = self.read_ptr != self.write_ptr;
                slot
            }
            Stream::FullSpectrum => {
                self.ready = false;
                self.last_completed
            }
        }
    }

    fn release_waiters(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }

    /// Stamp the slot at the write cursor and advance it
    ///
    /// Returns `true` when the completion overran unread data.
    pub(crate) fn complete(&mut self, ts: Timestamp) -> Result<bool, AcquisitionError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or(AcquisitionError::NotAttached {
                stream: self.stream,
            })?;
        pool.stamp(self.write_ptr, ts)?;

        self.last_completed = self.write_ptr;
        self.write_ptr = advance(self.write_ptr, self.mask);

        let overrun = match self.stream {
            Stream::Peaks => self.write_ptr == self.read_ptr,
            Stream::FullSpectrum => self.ready,
        };
        self.ready = match self.stream {
            Stream::Peaks => self.write_ptr != self.read_ptr,
            Stream::FullSpectrum => true,
        };

        if self.state == StreamState::Armed {
            self.state = StreamState::Running;
        }
        self.stats.completed += 1;
        if overrun {
            self.stats.overruns += 1;
        }
        Ok(overrun)
    }

    /// Stop production after a producer-side failure
    pub(crate) fn fault(&mut self) {
        self.state = StreamState::Idle;
        self.stats.faults += 1;
        self.release_waiters();
    }

    pub(crate) fn mask(&self) -> usize {
        self.mask
    }

    pub(crate) fn write_ptr(&self) -> usize {
        self.write_ptr
    }
}

/// Shared producer/consumer state for both streams
///
/// One lock guards both cursor pairs; the producer takes it once per
/// interrupt. Each stream has its own condition variable so a peaks
/// completion does not wake full-spectrum waiters.
pub struct FlowControl {
    rings: Mutex<[Ring; 2]>,
    wakers: [Condvar; 2],
}

impl FlowControl {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new([Ring::new(Stream::Peaks), Ring::new(Stream::FullSpectrum)]),
            wakers: [Condvar::new(), Condvar::new()],
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, [Ring; 2]> {
        self.rings.lock()
    }

    pub(crate) fn wake(&self, stream: Stream) {
        self.wakers[stream.index()].notify_all();
    }

    /// Bind a set-up buffer pool to its stream; the stream starts idle
    pub fn attach(&self, pool: Arc<BufferPool>) {
        let stream = pool.stream();
        let mut rings = self.rings.lock();
        let ring = &mut rings[stream.index()];
        ring.mask = pool.geometry().mask();
        ring.pool = Some(pool);
        ring.state = StreamState::Idle;
        ring.reset_cursors();
        ring.release_waiters();
        drop(rings);
        self.wake(stream);
    }

    /// Unbind a stream's pool, releasing any waiter
    pub fn detach(&self, stream: Stream) -> Option<Arc<BufferPool>> {
        let mut rings = self.rings.lock();
        let ring = &mut rings[stream.index()];
        ring.state = StreamState::Idle;
        ring.release_waiters();
        let pool = ring.pool.take();
        drop(rings);
        self.wake(stream);
        pool
    }

    /// Start accepting completions with both cursors at slot 0
    pub fn arm(&self, stream: Stream) -> Result<(), AcquisitionError> {
        self.arm_at(stream, 0)
    }

    /// Start accepting completions with both cursors at `slot`
    ///
    /// `slot` is the buffer the hardware will fill next, so a device that has
    /// already transferred data does not replay stale slots on the first
    /// interrupt.
    pub fn arm_at(&self, stream: Stream, slot: usize) -> Result<(), AcquisitionError> {
        let mut rings = self.rings.lock();
        let ring = &mut rings[stream.index()];
        if ring.pool.is_none() {
            return Err(AcquisitionError::NotAttached { stream });
        }
        ring.reset_cursors();
        let slot = slot & ring.mask;
        ring.write_ptr = slot;
        ring.read_ptr = slot;
        ring.last_completed = slot;
        ring.state = StreamState::Armed;
        debug!("{} armed at slot {}", stream, slot);
        Ok(())
    }

    /// Stop accepting completions; blocked retrievals return `Cancelled`
    pub fn disarm(&self, stream: Stream) {
        let mut rings = self.rings.lock();
        let ring = &mut rings[stream.index()];
        if ring.state != StreamState::Idle {
            debug!("{} disarmed", stream);
        }
        ring.state = StreamState::Idle;
        ring.release_waiters();
        drop(rings);
        self.wake(stream);
    }

    pub fn state(&self, stream: Stream) -> StreamState {
        self.rings.lock()[stream.index()].state
    }

    /// Non-blocking readiness poll
    pub fn is_ready(&self, stream: Stream) -> bool {
        let rings = self.rings.lock();
        let ring = &rings[stream.index()];
        ring.state != StreamState::Idle && ring.has_data()
    }

    /// Completed slots not yet retrieved
    pub fn backlog(&self, stream: Stream) -> usize {
        let rings = self.rings.lock();
        let ring = &rings[stream.index()];
        match stream {
            Stream::Peaks => pending(ring.read_ptr, ring.write_ptr, ring.mask),
            Stream::FullSpectrum => ring.ready as usize,
        }
    }

    /// Current `(read, write)` cursor pair
    pub fn cursors(&self, stream: Stream) -> (usize, usize) {
        let rings = self.rings.lock();
        let ring = &rings[stream.index()];
        (ring.read_ptr, ring.write_ptr)
    }

    /// Number of threads blocked in a retrieval
    pub fn waiters(&self, stream: Stream) -> usize {
        self.rings.lock()[stream.index()].waiters
    }

    pub fn stats(&self, stream: Stream) -> StreamStats {
        self.rings.lock()[stream.index()].stats
    }

    /// Wait for the next completed slot and claim it
    ///
    /// Peaks slots come out in completion order. Full spectrum returns the
    /// most recently completed slot. With `timeout == None` the call blocks
    /// until data arrives or the stream is cancelled.
    pub fn retrieve(
        &self,
        stream: Stream,
        timeout: Option<Duration>,
    ) -> Result<usize, AcquisitionError> {
        self.claim(stream, timeout).map(|(slot, _)| slot)
    }

    /// [`FlowControl::retrieve`] returning a zero-copy view of the slot
    pub fn retrieve_view(
        &self,
        stream: Stream,
        timeout: Option<Duration>,
    ) -> Result<BufferView, AcquisitionError> {
        let (slot, pool) = self.claim(stream, timeout)?;
        Ok(pool.map_for_consumer(slot)?)
    }

    fn claim(
        &self,
        stream: Stream,
        timeout: Option<Duration>,
    ) -> Result<(usize, Arc<BufferPool>), AcquisitionError> {
        let i = stream.index();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut rings = self.rings.lock();

        let generation = {
            let ring = &rings[i];
            if ring.state == StreamState::Idle {
                return Err(AcquisitionError::StreamIdle { stream });
            }
            ring.generation
        };

        rings[i].waiters += 1;
        let result = loop {
            let ring = &mut rings[i];
            if ring.generation != generation {
                ring.stats.cancellations += 1;
                break Err(AcquisitionError::Cancelled { stream });
            }
            if ring.has_data() {
                let slot = ring.take();
                break ring
                    .pool
                    .clone()
                    .map(|pool| (slot, pool))
                    .ok_or(AcquisitionError::NotAttached { stream });
            }

            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        break Err(AcquisitionError::Timeout {
                            stream,
                            waited: timeout.unwrap_or_default(),
                        });
                    }
                    self.wakers[i].wait_until(&mut rings, deadline);
                }
                None => self.wakers[i].wait(&mut rings),
            }
        };
        rings[i].waiters -= 1;
        result
    }

    /// Release every thread blocked on `stream` with `Cancelled`
    ///
    /// Cursors are untouched; data that arrived stays retrievable.
    pub fn cancel(&self, stream: Stream) {
        let mut rings = self.rings.lock();
        let ring = &mut rings[stream.index()];
        if ring.waiters > 0 {
            debug!("Cancelling {} waiter(s) on {}", ring.waiters, stream);
        }
        ring.release_waiters();
        drop(rings);
        self.wake(stream);
    }

    /// Cancel both streams
    pub fn cancel_all(&self) {
        for stream in Stream::ALL {
            self.cancel(stream);
        }
    }

    /// Discard unread completions; returns how many were dropped
    pub fn flush(&self, stream: Stream) -> usize {
        let mut rings = self.rings.lock();
        let ring = &mut rings[stream.index()];
        let dropped = match stream {
            Stream::Peaks => pending(ring.read_ptr, ring.write_ptr, ring.mask),
            Stream::FullSpectrum => ring.ready as usize,
        };
        ring.read_ptr = ring.write_ptr;
        ring.ready = false;
        ring.stats.flushed += dropped as u64;
        if dropped > 0 {
            info!("Flushed {} unread {} buffer(s)", dropped, stream);
        }
        dropped
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FlowControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rings = self.rings.lock();
        let mut dbg = f.debug_struct("FlowControl");
        for ring in rings.iter() {
            dbg.field(
                ring.stream.as_str(),
                &format_args!(
                    "{:?} r={} w={} ready={}",
                    ring.state, ring.read_ptr, ring.write_ptr, ring.ready
                ),
            );
        }
        dbg.finish()
    }
}
