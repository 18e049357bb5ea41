//! SM500 register map
//!
//! Register numbers are slot indices into the BAR0 window; see
//! [`crate::Width::byte_offset`] for how a number becomes a byte offset.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Null register
pub const NULLR: u32 = 0x00;
/// HDL version register (packed ASCII, byte-reversed)
pub const HVER: u32 = 0x01;
/// First DMA transfer address register (peaks slot 0)
pub const DMATAR0: u32 = 0x02;
/// Last DMA transfer address register (peaks slot 7)
pub const DMATAR7: u32 = 0x09;
/// DMA transfer pointer
pub const DMAXP: u32 = 0x0A;
/// DMA count register
pub const DMACNT: u32 = 0x0B;
/// DMA control register
pub const DMACR: u32 = 0x0C;
/// Full-spectrum DMA address register
pub const DMAFSAR: u32 = 0x30;
/// Number of full-spectrum DMA buffers (read-only)
pub const NFSBUF: u32 = 0x31;
/// Full-spectrum buffer size in bytes (read-only)
pub const FSBUFSZ: u32 = 0x32;
/// Number of peaks DMA buffers (read-only)
pub const NPKBUF: u32 = 0x33;
/// Peaks buffer size in bytes (read-only)
pub const PKBUFSZ: u32 = 0x34;
/// Byte offset of the timestamp trailer inside every DMA buffer
pub const TSOFST: u32 = 0x35;
/// Low word of the serial number of the most recently DMAed data set
pub const DMASNLO: u32 = 0x36;
/// High word of the serial number of the most recently DMAed data set
pub const DMASNHI: u32 = 0x37;
/// System control register
pub const SYSCON: u32 = 0x80;
/// Interrupt enable register
pub const INTE: u32 = 0x100;
/// Interrupt flag register (read, then cleared by writing [`InterruptFlags::NONE`])
pub const INTF: u32 = 0x101;
/// Interrupt data register
pub const INTDR: u32 = 0x102;

/// Number of peaks DMA target address registers
pub const PEAKS_ADDRESS_SLOTS: usize = (DMATAR7 - DMATAR0 + 1) as usize;
/// Number of full-spectrum DMA target address registers
pub const FS_ADDRESS_SLOTS: usize = 1;

/// Acquisition stream produced by the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    /// Compact extracted-feature records
    Peaks,
    /// Raw scan records
    FullSpectrum,
}

impl Stream {
    /// Both streams, in setup order
    pub const ALL: [Stream; 2] = [Stream::Peaks, Stream::FullSpectrum];

    /// Dense index for per-stream tables
    pub fn index(self) -> usize {
        match self {
            Stream::Peaks => 0,
            Stream::FullSpectrum => 1,
        }
    }

    /// Short name for logs and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            Stream::Peaks => "peaks",
            Stream::FullSpectrum => "full_spectrum",
        }
    }

    /// Read-only register holding the buffer count
    pub fn count_register(self) -> u32 {
        match self {
            Stream::Peaks => NPKBUF,
            Stream::FullSpectrum => NFSBUF,
        }
    }

    /// Read-only register holding the buffer size in bytes
    pub fn size_register(self) -> u32 {
        match self {
            Stream::Peaks => PKBUFSZ,
            Stream::FullSpectrum => FSBUFSZ,
        }
    }

    /// Number of target address registers available to this stream
    pub fn address_slots(self) -> usize {
        match self {
            Stream::Peaks => PEAKS_ADDRESS_SLOTS,
            Stream::FullSpectrum => FS_ADDRESS_SLOTS,
        }
    }

    /// Target address register for a buffer slot, if the slot exists
    pub fn address_register(self, slot: usize) -> Option<u32> {
        if slot >= self.address_slots() {
            return None;
        }
        let base = match self {
            Stream::Peaks => DMATAR0,
            Stream::FullSpectrum => DMAFSAR,
        };
        Some(base + slot as u32)
    }

    /// DMA control bit enabling this stream
    pub fn dma_bit(self) -> DmaMask {
        match self {
            Stream::Peaks => DmaMask::PEAKS,
            Stream::FullSpectrum => DmaMask::FULL_SPECTRUM,
        }
    }

    /// Interrupt bit signalling a completion on this stream
    pub fn interrupt_bit(self) -> InterruptFlags {
        match self {
            Stream::Peaks => InterruptFlags::PEAKS,
            Stream::FullSpectrum => InterruptFlags::FULL_SPECTRUM,
        }
    }
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! register_bits {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            /// Raw register value
            pub fn bits(self) -> u32 {
                self.0
            }

            /// True when no bit is set
            pub fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// True when every bit of `other` is set
            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0 && other.0 != 0
            }
        }

        impl BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }

        impl BitAnd for $name {
            type Output = Self;
            fn bitand(self, rhs: Self) -> Self {
                Self(self.0 & rhs.0)
            }
        }

        impl Not for $name {
            type Output = Self;
            fn not(self) -> Self {
                Self(!self.0)
            }
        }
    };
}

register_bits!(
    /// Bits of the DMA control register
    DmaMask
);

impl DmaMask {
    /// All DMA stopped
    pub const NONE: DmaMask = DmaMask(0x0000);
    /// Peaks DMA enabled
    pub const PEAKS: DmaMask = DmaMask(0x0002);
    /// Full-spectrum DMA enabled
    pub const FULL_SPECTRUM: DmaMask = DmaMask(0x0004);
    /// Both streams
    pub const ALL: DmaMask = DmaMask(0x0006);
}

register_bits!(
    /// Bits of the interrupt enable and interrupt flag registers
    InterruptFlags
);

impl InterruptFlags {
    /// No interrupt
    pub const NONE: InterruptFlags = InterruptFlags(0x0000);
    /// Peaks DMA complete
    pub const PEAKS: InterruptFlags = InterruptFlags(0x0002);
    /// Full-spectrum DMA complete
    pub const FULL_SPECTRUM: InterruptFlags = InterruptFlags(0x0004);
    /// A full spectrum is available for the peaks data set of this interrupt
    pub const FS_AVAILABLE: InterruptFlags = InterruptFlags(1 << 31);
    /// Both completion interrupts
    pub const ALL: InterruptFlags = InterruptFlags(0x0006);
}

register_bits!(
    /// Bits of the system control register
    SystemControl
);

impl SystemControl {
    /// Scan run
    pub const SCAN_RUN: SystemControl = SystemControl(0x01);
    /// Operation mode
    pub const OPERATION_MODE: SystemControl = SystemControl(0x02);
    /// Soft reset of peripherals
    pub const SOFT_RESET: SystemControl = SystemControl(0x04);
    /// Scan interrupt reset
    pub const SCAN_INTERRUPT_RESET: SystemControl = SystemControl(0x08);
    /// Invert external sync
    pub const INVERT_SYNC: SystemControl = SystemControl(0x10);
}
