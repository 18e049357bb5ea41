//! Register port over a pluggable bus

use crate::error::RegisterError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

/// Access width of a register transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Width {
    W8,
    W16,
    W32,
}

impl Width {
    /// Transaction size in bytes
    pub fn bytes(self) -> usize {
        match self {
            Width::W8 => 1,
            Width::W16 => 2,
            Width::W32 => 4,
        }
    }

    /// Byte offset of register `reg` in a window viewed at this width
    pub fn byte_offset(self, reg: u32) -> usize {
        reg as usize * self.bytes()
    }

    /// Truncate a value to this width
    pub fn truncate(self, value: u32) -> u32 {
        match self {
            Width::W8 => value & 0xFF,
            Width::W16 => value & 0xFFFF,
            Width::W32 => value,
        }
    }
}

/// Raw register transactions against one device
///
/// Implementations perform every call as a direct hardware access in call
/// order. Reads of status/flag registers may clear them.
pub trait RegisterBus: Send + Sync {
    fn read8(&self, reg: u32) -> Result<u8, RegisterError>;
    fn read16(&self, reg: u32) -> Result<u16, RegisterError>;
    fn read32(&self, reg: u32) -> Result<u32, RegisterError>;
    fn write8(&self, reg: u32, value: u8) -> Result<(), RegisterError>;
    fn write16(&self, reg: u32, value: u16) -> Result<(), RegisterError>;
    fn write32(&self, reg: u32, value: u32) -> Result<(), RegisterError>;
}

/// Register port bound to an open device handle
///
/// The port is the single gate to the bus: once [`RegisterPort::close`] has run
/// every access fails with [`RegisterError::DeviceUnavailable`].
pub struct RegisterPort {
    bus: RwLock<Option<Arc<dyn RegisterBus>>>,
}

impl RegisterPort {
    /// Open a port over a bus
    pub fn new(bus: Arc<dyn RegisterBus>) -> Self {
        Self {
            bus: RwLock::new(Some(bus)),
        }
    }

    /// Create a port with no device behind it
    pub fn closed() -> Self {
        Self {
            bus: RwLock::new(None),
        }
    }

    /// Check if the device handle is open
    pub fn is_open(&self) -> bool {
        self.bus.read().is_some()
    }

    /// Release the device handle
    pub fn close(&self) {
        if self.bus.write().take().is_some() {
            debug!("Register port closed");
        }
    }

    fn bus(&self) -> Result<Arc<dyn RegisterBus>, RegisterError> {
        self.bus
            .read()
            .as_ref()
            .cloned()
            .ok_or(RegisterError::DeviceUnavailable)
    }

    /// Read a register at the given width
    pub fn read(&self, width: Width, reg: u32) -> Result<u32, RegisterError> {
        let bus = self.bus()?;
        let value = match width {
            Width::W8 => bus.read8(reg)? as u32,
            Width::W16 => bus.read16(reg)? as u32,
            Width::W32 => bus.read32(reg)?,
        };
        trace!(reg, value, ?width, "register read");
        Ok(value)
    }

    /// Write a register at the given width (value is truncated to the width)
    pub fn write(&self, width: Width, reg: u32, value: u32) -> Result<(), RegisterError> {
        let bus = self.bus()?;
        trace!(reg, value, ?width, "register write");
        match width {
            Width::W8 => bus.write8(reg, value as u8),
            Width::W16 => bus.write16(reg, value as u16),
            Width::W32 => bus.write32(reg, value),
        }
    }

    pub fn read8(&self, reg: u32) -> Result<u8, RegisterError> {
        self.bus()?.read8(reg)
    }

    pub fn read16(&self, reg: u32) -> Result<u16, RegisterError> {
        self.bus()?.read16(reg)
    }

    pub fn read32(&self, reg: u32) -> Result<u32, RegisterError> {
        self.bus()?.read32(reg)
    }

    pub fn write8(&self, reg: u32, value: u8) -> Result<(), RegisterError> {
        self.bus()?.write8(reg, value)
    }

    pub fn write16(&self, reg: u32, value: u16) -> Result<(), RegisterError> {
        self.bus()?.write16(reg, value)
    }

    pub fn write32(&self, reg: u32, value: u32) -> Result<(), RegisterError> {
        self.bus()?.write32(reg, value)
    }

    /// Set `mask` bits with a read-modify-write
    pub fn set_bits(&self, width: Width, reg: u32, mask: u32) -> Result<(), RegisterError> {
        let current = self.read(width, reg)?;
        self.write(width, reg, width.truncate(current | mask))
    }

    /// Clear `mask` bits with a read-modify-write
    pub fn clear_bits(&self, width: Width, reg: u32, mask: u32) -> Result<(), RegisterError> {
        let current = self.read(width, reg)?;
        self.write(width, reg, width.truncate(current & !mask))
    }
}

impl std::fmt::Debug for RegisterPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterPort")
            .field("open", &self.is_open())
            .finish()
    }
}
