//! Device control layer

use crate::error::DeviceError;
use dma_pool::Geometry;
use register_port::{
    decode_hdl_version, map, DmaMask, InterruptFlags, RawVersion, RegisterPort, Stream,
    SystemControl, Width,
};
use std::sync::Arc;
use tracing::debug;

/// Version of this user-space driver
pub const DRIVER_VERSION: RawVersion = RawVersion::new(0, 51);

/// Control operations over the register port
///
/// Every call goes straight to the hardware; nothing is cached.
#[derive(Debug, Clone)]
pub struct DeviceControl {
    port: Arc<RegisterPort>,
    driver_version: RawVersion,
}

impl DeviceControl {
    pub fn new(port: Arc<RegisterPort>, driver_version: RawVersion) -> Self {
        Self {
            port,
            driver_version,
        }
    }

    pub fn port(&self) -> &Arc<RegisterPort> {
        &self.port
    }

    /// Read and validate a stream's buffer geometry
    pub fn discover_geometry(&self, stream: Stream) -> Result<Geometry, DeviceError> {
        let geometry = Geometry::discover(&self.port, stream)?;
        geometry.validate(stream)?;
        debug!(
            "{} geometry: {} x {} bytes, timestamp at {}",
            stream, geometry.count, geometry.size, geometry.timestamp_offset
        );
        Ok(geometry)
    }

    /// Write the DMA control register
    pub fn set_dma(&self, mask: DmaMask) -> Result<(), DeviceError> {
        self.port.write32(map::DMACR, mask.bits())?;
        Ok(())
    }

    pub fn dma(&self) -> Result<DmaMask, DeviceError> {
        Ok(DmaMask(self.port.read32(map::DMACR)?))
    }

    /// Write the interrupt enable register
    pub fn set_interrupts(&self, mask: InterruptFlags) -> Result<(), DeviceError> {
        self.port.write32(map::INTE, mask.bits())?;
        Ok(())
    }

    pub fn interrupts(&self) -> Result<InterruptFlags, DeviceError> {
        Ok(InterruptFlags(self.port.read32(map::INTE)?))
    }

    /// Firmware version as `major.minor`
    pub fn firmware_version(&self) -> Result<String, DeviceError> {
        Ok(RawVersion::from_raw(self.port.read32(map::HVER)?).to_string())
    }

    /// Four-character HDL version string
    pub fn hdl_version(&self) -> Result<String, DeviceError> {
        Ok(decode_hdl_version(self.port.read32(map::HVER)?))
    }

    /// Driver version as `major.minor`
    pub fn driver_version(&self) -> String {
        self.driver_version.to_string()
    }

    pub fn raw_driver_version(&self) -> RawVersion {
        self.driver_version
    }

    /// 64-bit serial number of the last peaks data set
    pub fn serial_number(&self) -> Result<u64, DeviceError> {
        let lo = self.port.read32(map::DMASNLO)? as u64;
        let hi = self.port.read32(map::DMASNHI)? as u64;
        Ok((hi << 32) | lo)
    }

    pub fn system_control(&self) -> Result<SystemControl, DeviceError> {
        Ok(SystemControl(self.port.read32(map::SYSCON)?))
    }

    pub fn set_system_control(&self, value: SystemControl) -> Result<(), DeviceError> {
        self.port.write32(map::SYSCON, value.bits())?;
        Ok(())
    }

    /// Set or clear individual system control bits
    pub fn update_system_control(
        &self,
        bits: SystemControl,
        enable: bool,
    ) -> Result<(), DeviceError> {
        if enable {
            self.port.set_bits(Width::W32, map::SYSCON, bits.bits())?;
        } else {
            self.port.clear_bits(Width::W32, map::SYSCON, bits.bits())?;
        }
        Ok(())
    }

    /// Raw register read
    pub fn read_register(&self, width: Width, reg: u32) -> Result<u32, DeviceError> {
        Ok(self.port.read(width, reg)?)
    }

    /// Raw register write
    pub fn write_register(&self, width: Width, reg: u32, value: u32) -> Result<(), DeviceError> {
        Ok(self.port.write(width, reg, value)?)
    }
}
