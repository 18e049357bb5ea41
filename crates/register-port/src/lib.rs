//! Register Port for the SM500 Optical Instrument
//!
//! Provides typed 8/16/32-bit access to the FPGA register window.
//! Supports:
//! - Pluggable register buses (memory-mapped BAR, simulated register file)
//! - Read-modify-write bit helpers
//! - The fixed register map and its control/interrupt bit layouts
//! - Version field decoding

mod error;
pub mod map;
pub mod mmio;
mod port;
pub mod version;

pub use error::RegisterError;
pub use map::{DmaMask, InterruptFlags, Stream, SystemControl};
pub use port::{RegisterBus, RegisterPort, Width};
pub use version::{decode_hdl_version, RawVersion};
