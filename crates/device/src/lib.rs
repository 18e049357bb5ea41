//! SM500 Device
//!
//! The consumer-facing layer of the acquisition stack:
//! - [`DeviceControl`]: DMA/interrupt enables, geometry discovery, versions
//! - [`Sm500Device`]: open/close lifecycle and stream retrieval
//! - [`AcquisitionService`]: async frame delivery for tokio consumers
//! - [`Platform`]: where register windows, DMA memory and interrupts come from

mod config;
mod control;
mod device;
mod error;
mod platform;
mod service;

pub use crate::config::DeviceConfig;
pub use control::{DeviceControl, DRIVER_VERSION};
pub use device::Sm500Device;
pub use error::DeviceError;
pub use platform::{LinuxPlatform, Platform};
#[cfg(feature = "simulator")]
pub use platform::SimulatedPlatform;
pub use service::{AcquisitionService, Frame};
