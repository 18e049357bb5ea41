//! Register file and DMA engine model

use crate::line::SimInterruptLine;
use dma_pool::HeapAllocator;
use parking_lot::Mutex;
use register_port::map;
use register_port::{DmaMask, InterruptFlags, RegisterBus, RegisterError, Stream, Width};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Size of the simulated register window in bytes
const WINDOW_BYTES: usize = 0x1000;

/// Geometry and identity of the simulated instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub peaks_count: u32,
    pub peaks_size: u32,
    pub fs_count: u32,
    pub fs_size: u32,
    /// Byte offset of the timestamp trailer in every buffer
    pub timestamp_offset: u32,
    /// Raw value of the HDL version register
    pub hdl_version: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peaks_count: 4,
            peaks_size: 64,
            fs_count: 1,
            fs_size: 4096,
            timestamp_offset: 56,
            hdl_version: 0x0001_0012,
        }
    }
}

struct SimState {
    window: Vec<u8>,
    peaks_serial: u64,
    fs_serial: u64,
    failing: HashSet<u32>,
}

impl SimState {
    fn locate(&self, width: Width, reg: u32) -> Result<usize, RegisterError> {
        let offset = width.byte_offset(reg);
        if offset + width.bytes() > self.window.len() {
            return Err(RegisterError::OutOfWindow {
                reg,
                width: width.bytes(),
                window: self.window.len(),
            });
        }
        if self.failing.contains(&reg) {
            return Err(RegisterError::access_failed(reg, "injected bus error"));
        }
        Ok(offset)
    }

    fn load(&self, width: Width, reg: u32) -> Result<u32, RegisterError> {
        let offset = self.locate(width, reg)?;
        let mut bytes = [0u8; 4];
        bytes[..width.bytes()].copy_from_slice(&self.window[offset..offset + width.bytes()]);
        Ok(u32::from_le_bytes(bytes))
    }

    fn store(&mut self, width: Width, reg: u32, value: u32) -> Result<(), RegisterError> {
        let offset = self.locate(width, reg)?;
        let bytes = value.to_le_bytes();
        self.window[offset..offset + width.bytes()].copy_from_slice(&bytes[..width.bytes()]);
        Ok(())
    }

    fn word(&self, reg: u32) -> u32 {
        let offset = Width::W32.byte_offset(reg);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.window[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn set_word(&mut self, reg: u32, value: u32) {
        let offset = Width::W32.byte_offset(reg);
        self.window[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Simulated SM500 FPGA
///
/// Implements [`RegisterBus`] so it can sit behind a register port exactly
/// like the memory-mapped window. Register `reg` at width `w` lives at byte
/// offset `reg * w`, the same as on the hardware.
pub struct SimulatedFpga {
    config: SimConfig,
    state: Mutex<SimState>,
    allocator: Arc<HeapAllocator>,
    line: SimInterruptLine,
}

impl SimulatedFpga {
    /// Power up an instrument with the given geometry
    pub fn new(config: SimConfig) -> Self {
        let mut state = SimState {
            window: vec![0u8; WINDOW_BYTES],
            // no data set has been transferred yet
            peaks_serial: u64::MAX,
            fs_serial: u64::MAX,
            failing: HashSet::new(),
        };
        state.set_word(map::HVER, config.hdl_version);
        state.set_word(map::NPKBUF, config.peaks_count);
        state.set_word(map::PKBUFSZ, config.peaks_size);
        state.set_word(map::NFSBUF, config.fs_count);
        state.set_word(map::FSBUFSZ, config.fs_size);
        state.set_word(map::TSOFST, config.timestamp_offset);
        state.set_word(map::DMASNLO, u32::MAX);
        state.set_word(map::DMASNHI, u32::MAX);

        debug!(
            "Simulated FPGA: {} x {} peaks, {} x {} full spectrum",
            config.peaks_count, config.peaks_size, config.fs_count, config.fs_size
        );

        Self {
            config,
            state: Mutex::new(state),
            allocator: Arc::new(HeapAllocator::new()),
            line: SimInterruptLine::new(),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Allocator whose bus addresses this instrument can reach
    pub fn allocator(&self) -> Arc<HeapAllocator> {
        self.allocator.clone()
    }

    /// Interrupt line raised on enabled completions
    pub fn interrupt_line(&self) -> SimInterruptLine {
        self.line.clone()
    }

    /// Current 32-bit value of a register
    pub fn register(&self, reg: u32) -> u32 {
        self.state.lock().word(reg)
    }

    /// DMA channels currently enabled
    pub fn dma_mask(&self) -> DmaMask {
        DmaMask(self.register(map::DMACR))
    }

    /// Interrupt sources currently enabled
    pub fn interrupt_mask(&self) -> InterruptFlags {
        InterruptFlags(self.register(map::INTE))
    }

    /// Latched, not yet cleared interrupt flags
    pub fn pending_flags(&self) -> InterruptFlags {
        InterruptFlags(self.register(map::INTF))
    }

    /// Serial number of the most recent peaks data set
    pub fn peaks_serial(&self) -> u64 {
        self.state.lock().peaks_serial
    }

    /// Make every access to `reg` fail
    pub fn fail_register(&self, reg: u32) {
        self.state.lock().failing.insert(reg);
    }

    /// Remove all injected failures
    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Assert the interrupt line without latching any flag
    pub fn raise_spurious(&self) {
        self.line.raise();
    }

    /// Complete `n` peaks transfers and raise a single (coalesced) interrupt
    ///
    /// Returns the number of transfers performed; zero when peaks DMA is off.
    pub fn complete_peaks(&self, n: usize, fs_available: bool) -> usize {
        let mut state = self.state.lock();
        if !DmaMask(state.word(map::DMACR)).contains(DmaMask::PEAKS) || n == 0 {
            return 0;
        }

        let mask = (self.config.peaks_count.max(1) - 1) as u64;
        for _ in 0..n {
            state.peaks_serial = state.peaks_serial.wrapping_add(1);
            let serial = state.peaks_serial;
            let slot = (serial & mask) as usize;
            self.transfer(&state, Stream::Peaks, slot, serial, self.config.peaks_size);
        }

        let serial = state.peaks_serial;
        state.set_word(map::DMASNLO, serial as u32);
        state.set_word(map::DMASNHI, (serial >> 32) as u32);

        let mut flags = InterruptFlags::PEAKS;
        if fs_available {
            flags = flags | InterruptFlags::FS_AVAILABLE;
        }
        self.latch(&mut state, flags);
        n
    }

    /// Complete one full-spectrum transfer
    pub fn complete_full_spectrum(&self) -> bool {
        let mut state = self.state.lock();
        if !DmaMask(state.word(map::DMACR)).contains(DmaMask::FULL_SPECTRUM) {
            return false;
        }

        state.fs_serial = state.fs_serial.wrapping_add(1);
        let serial = state.fs_serial;
        let slot = (serial & (self.config.fs_count.max(1) - 1) as u64) as usize;
        self.transfer(&state, Stream::FullSpectrum, slot, serial, self.config.fs_size);
        self.latch(&mut state, InterruptFlags::FULL_SPECTRUM);
        true
    }

    fn latch(&self, state: &mut SimState, flags: InterruptFlags) {
        let latched = InterruptFlags(state.word(map::INTF)) | flags;
        state.set_word(map::INTF, latched.bits());
        let enabled = InterruptFlags(state.word(map::INTE));
        if !(enabled & flags).is_empty() {
            self.line.raise();
        }
    }

    /// Write a recognizable payload: serial number first, then its low byte
    fn transfer(&self, state: &SimState, stream: Stream, slot: usize, serial: u64, size: u32) {
        let Some(reg) = stream.address_register(slot) else {
            warn!("{} slot {} has no address register", stream, slot);
            return;
        };
        let bus_addr = state.word(reg) as u64;
        let Some(memory) = self.allocator.resolve(bus_addr) else {
            warn!("{} slot {} targets unmapped bus address {:#x}", stream, slot, bus_addr);
            return;
        };

        let body = (self.config.timestamp_offset as usize).min(size as usize);
        let mut payload = vec![serial as u8; body];
        let head = body.min(8);
        payload[..head].copy_from_slice(&serial.to_le_bytes()[..head]);
        memory.write_at(0, &payload);
        trace!(%stream, slot, serial, "simulated DMA transfer");
    }
}

impl RegisterBus for SimulatedFpga {
    fn read8(&self, reg: u32) -> Result<u8, RegisterError> {
        Ok(self.state.lock().load(Width::W8, reg)? as u8)
    }

    fn read16(&self, reg: u32) -> Result<u16, RegisterError> {
        Ok(self.state.lock().load(Width::W16, reg)? as u16)
    }

    fn read32(&self, reg: u32) -> Result<u32, RegisterError> {
        self.state.lock().load(Width::W32, reg)
    }

    fn write8(&self, reg: u32, value: u8) -> Result<(), RegisterError> {
        self.state.lock().store(Width::W8, reg, value as u32)
    }

    fn write16(&self, reg: u32, value: u16) -> Result<(), RegisterError> {
        self.state.lock().store(Width::W16, reg, value as u32)
    }

    fn write32(&self, reg: u32, value: u32) -> Result<(), RegisterError> {
        self.state.lock().store(Width::W32, reg, value)
    }
}

impl std::fmt::Debug for SimulatedFpga {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedFpga")
            .field("config", &self.config)
            .field("peaks_serial", &self.peaks_serial())
            .finish()
    }
}
