//! Memory-mapped BAR0 register bus
//!
//! Maps the PCI resource file of the instrument (for example
//! `/sys/bus/pci/devices/0000:01:00.0/resource0`) and performs volatile
//! accesses. Register `reg` at width `w` lives at byte offset `reg * w`.

use crate::error::RegisterError;
use crate::port::{RegisterBus, Width};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tracing::{debug, info, warn};

/// Memory-mapped register window
pub struct MmioBus {
    ptr: *mut u8,
    size: usize,
    _file: File,
}

// SAFETY: the mapping is owned exclusively by this value and stays valid until
// Drop; volatile accesses from several threads are serialized by the hardware.
unsafe impl Send for MmioBus {}
unsafe impl Sync for MmioBus {}

impl MmioBus {
    /// Map a resource file read/write
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegisterError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| RegisterError::access_failed(0, format!("{}: {}", path.display(), e)))?;

        let size = file
            .metadata()
            .map_err(|e| RegisterError::access_failed(0, e.to_string()))?
            .len() as usize;
        if size == 0 {
            return Err(RegisterError::access_failed(
                0,
                format!("{} has an empty register window", path.display()),
            ));
        }

        // SAFETY: fd is open for read/write, size comes from the resource file
        // and MAP_SHARED makes device stores visible to the hardware.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RegisterError::access_failed(
                0,
                format!("mmap {}: {}", path.display(), std::io::Error::last_os_error()),
            ));
        }

        info!("Mapped register window {} ({:#x} bytes)", path.display(), size);

        Ok(Self {
            ptr: ptr.cast(),
            size,
            _file: file,
        })
    }

    /// Size of the mapped window in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    fn locate(&self, width: Width, reg: u32) -> Result<*mut u8, RegisterError> {
        let offset = width.byte_offset(reg);
        if offset + width.bytes() > self.size {
            return Err(RegisterError::OutOfWindow {
                reg,
                width: width.bytes(),
                window: self.size,
            });
        }
        // SAFETY: offset + width is within the mapping checked above.
        Ok(unsafe { self.ptr.add(offset) })
    }
}

impl RegisterBus for MmioBus {
    fn read8(&self, reg: u32) -> Result<u8, RegisterError> {
        let ptr = self.locate(Width::W8, reg)?;
        // SAFETY: in-bounds, naturally aligned device memory.
        Ok(unsafe { std::ptr::read_volatile(ptr) })
    }

    fn read16(&self, reg: u32) -> Result<u16, RegisterError> {
        let ptr = self.locate(Width::W16, reg)?;
        // SAFETY: in-bounds; offset is a multiple of 2 and the mapping is page aligned.
        Ok(unsafe { std::ptr::read_volatile(ptr.cast::<u16>()) })
    }

    fn read32(&self, reg: u32) -> Result<u32, RegisterError> {
        let ptr = self.locate(Width::W32, reg)?;
        // SAFETY: in-bounds; offset is a multiple of 4 and the mapping is page aligned.
        Ok(unsafe { std::ptr::read_volatile(ptr.cast::<u32>()) })
    }

    fn write8(&self, reg: u32, value: u8) -> Result<(), RegisterError> {
        let ptr = self.locate(Width::W8, reg)?;
        // SAFETY: see read8.
        unsafe { std::ptr::write_volatile(ptr, value) };
        Ok(())
    }

    fn write16(&self, reg: u32, value: u16) -> Result<(), RegisterError> {
        let ptr = self.locate(Width::W16, reg)?;
        // SAFETY: see read16.
        unsafe { std::ptr::write_volatile(ptr.cast::<u16>(), value) };
        Ok(())
    }

    fn write32(&self, reg: u32, value: u32) -> Result<(), RegisterError> {
        let ptr = self.locate(Width::W32, reg)?;
        // SAFETY: see read32.
        unsafe { std::ptr::write_volatile(ptr.cast::<u32>(), value) };
        Ok(())
    }
}

impl Drop for MmioBus {
    fn drop(&mut self) {
        // SAFETY: ptr/size are exactly the mapping created in open().
        let ret = unsafe { libc::munmap(self.ptr.cast(), self.size) };
        if ret != 0 {
            warn!(
                "munmap of register window failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            debug!("Unmapped register window");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn window_file(bytes: usize) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!(
            "sm500-mmio-{}-{}",
            std::process::id(),
            bytes
        ));
        let mut file = File::create(&path).unwrap();
        file.write_all(&vec![0u8; bytes]).unwrap();
        path
    }

    #[test]
    fn test_mapped_window_access() {
        let path = window_file(4096);
        let bus = MmioBus::open(&path).unwrap();
        assert_eq!(bus.size(), 4096);

        bus.write32(0x101, 0xDEAD_BEEF).unwrap();
        assert_eq!(bus.read32(0x101).unwrap(), 0xDEAD_BEEF);
        // byte view of the same window: register 0x404 is the low byte of 32-bit reg 0x101
        assert_eq!(bus.read8(0x404).unwrap(), 0xEF);
        assert_eq!(bus.read16(0x202).unwrap(), 0xBEEF);

        drop(bus);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_out_of_window() {
        let path = window_file(64);
        let bus = MmioBus::open(&path).unwrap();
        assert!(matches!(
            bus.read32(16),
            Err(RegisterError::OutOfWindow { reg: 16, .. })
        ));
        assert!(bus.read32(15).is_ok());
        drop(bus);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_missing_resource_file() {
        assert!(matches!(
            MmioBus::open("/nonexistent/sm500/resource0"),
            Err(RegisterError::AccessFailed { .. })
        ));
    }
}
