//! Hardware platforms: register window, DMA memory and interrupt source

use crate::control::DRIVER_VERSION;
use crate::error::DeviceError;
use acquisition::{InterruptSource, UioInterrupt};
use dma_pool::DmaAllocator;
use register_port::mmio::MmioBus;
use register_port::{RawVersion, RegisterBus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Resources a device instance is built from
pub trait Platform: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Open the register window behind a device node
    fn open_bus(&self, node: &str) -> Result<Arc<dyn RegisterBus>, DeviceError>;

    /// Allocator for device-reachable buffers
    fn allocator(&self) -> Arc<dyn DmaAllocator>;

    /// Bind the device's interrupt
    fn interrupt_source(&self) -> Result<Box<dyn InterruptSource>, DeviceError>;

    fn driver_version(&self) -> RawVersion {
        DRIVER_VERSION
    }
}

/// Linux platform: BAR resource file plus a UIO interrupt node
///
/// Physically contiguous memory comes from the supplied allocator (for
/// example a `u-dma-buf` backed implementation).
pub struct LinuxPlatform {
    uio_node: PathBuf,
    allocator: Arc<dyn DmaAllocator>,
}

impl LinuxPlatform {
    pub fn new(uio_node: impl Into<PathBuf>, allocator: Arc<dyn DmaAllocator>) -> Self {
        Self {
            uio_node: uio_node.into(),
            allocator,
        }
    }
}

impl Platform for LinuxPlatform {
    fn name(&self) -> &str {
        "linux"
    }

    fn open_bus(&self, node: &str) -> Result<Arc<dyn RegisterBus>, DeviceError> {
        info!("Opening {} on {}", node, self.name());
        let bus = MmioBus::open(node).map_err(|e| {
            error!("Cannot open {}: {}", node, e);
            DeviceError::DeviceUnavailable
        })?;
        Ok(Arc::new(bus))
    }

    fn allocator(&self) -> Arc<dyn DmaAllocator> {
        self.allocator.clone()
    }

    fn interrupt_source(&self) -> Result<Box<dyn InterruptSource>, DeviceError> {
        Ok(Box::new(UioInterrupt::open(&self.uio_node)?))
    }
}

#[cfg(feature = "simulator")]
mod simulated {
    use super::*;
    use acquisition::AcquisitionError;
    use fpga_sim::{SimConfig, SimInterruptLine, SimulatedFpga};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct SimInterrupt {
        line: SimInterruptLine,
        lost: Arc<AtomicBool>,
    }

    impl InterruptSource for SimInterrupt {
        fn wait(&mut self, timeout: Duration) -> Result<bool, AcquisitionError> {
            if self.lost.load(Ordering::SeqCst) {
                return Err(AcquisitionError::Interrupt(
                    "interrupt line lost".to_string(),
                ));
            }
            Ok(self.line.wait(timeout))
        }
    }

    /// Platform backed by a simulated FPGA
    pub struct SimulatedPlatform {
        fpga: Arc<SimulatedFpga>,
        available: AtomicBool,
        interrupts_lost: Arc<AtomicBool>,
    }

    impl SimulatedPlatform {
        pub fn new(config: SimConfig) -> Self {
            Self {
                fpga: Arc::new(SimulatedFpga::new(config)),
                available: AtomicBool::new(true),
                interrupts_lost: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Make every interrupt source of this platform fail its next wait
        pub fn lose_interrupts(&self, lost: bool) {
            self.interrupts_lost.store(lost, Ordering::SeqCst);
        }

        /// The instrument behind every device opened on this platform
        pub fn fpga(&self) -> &Arc<SimulatedFpga> {
            &self.fpga
        }

        /// Make subsequent opens fail as if the node did not exist
        pub fn set_available(&self, available: bool) {
            self.available.store(available, Ordering::SeqCst);
        }
    }

    impl Default for SimulatedPlatform {
        fn default() -> Self {
            Self::new(SimConfig::default())
        }
    }

    impl Platform for SimulatedPlatform {
        fn name(&self) -> &str {
            "simulator"
        }

        fn open_bus(&self, node: &str) -> Result<Arc<dyn RegisterBus>, DeviceError> {
            if !self.available.load(Ordering::SeqCst) {
                return Err(DeviceError::DeviceUnavailable);
            }
            info!("Opening simulated instrument as {}", node);
            Ok(self.fpga.clone())
        }

        fn allocator(&self) -> Arc<dyn DmaAllocator> {
            self.fpga.allocator()
        }

        fn interrupt_source(&self) -> Result<Box<dyn InterruptSource>, DeviceError> {
            Ok(Box::new(SimInterrupt {
                line: self.fpga.interrupt_line(),
                lost: self.interrupts_lost.clone(),
            }))
        }
    }
}

#[cfg(feature = "simulator")]
pub use simulated::SimulatedPlatform;
