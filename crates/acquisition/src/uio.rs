//! Linux UIO interrupt source
//!
//! A UIO device node delivers one 32-bit event count per interrupt on
//! `read(2)`; writing `1` re-enables the interrupt after it fired.

use crate::error::AcquisitionError;
use crate::irq::InterruptSource;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Interrupt source backed by `/dev/uioN`
pub struct UioInterrupt {
    file: File,
    last_count: u32,
}

impl UioInterrupt {
    /// Open a UIO node and unmask its interrupt
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AcquisitionError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| AcquisitionError::Interrupt(format!("{}: {}", path.display(), e)))?;

        let mut uio = Self {
            file,
            last_count: 0,
        };
        uio.unmask()?;
        info!("Bound UIO interrupt {}", path.display());
        Ok(uio)
    }

    fn unmask(&mut self) -> Result<(), AcquisitionError> {
        self.file
            .write_all(&1u32.to_ne_bytes())
            .map_err(|e| AcquisitionError::Interrupt(format!("unmask: {}", e)))
    }

    /// Event count reported by the kernel on the last interrupt
    pub fn last_count(&self) -> u32 {
        self.last_count
    }
}

impl InterruptSource for UioInterrupt {
    fn wait(&mut self, timeout: Duration) -> Result<bool, AcquisitionError> {
        let mut pfd = libc::pollfd {
            fd: self.file.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(AcquisitionError::Interrupt(format!("poll: {}", err)));
        }
        if ret == 0 {
            return Ok(false);
        }

        let mut count = [0u8; 4];
        self.file
            .read_exact(&mut count)
            .map_err(|e| AcquisitionError::Interrupt(format!("read: {}", e)))?;
        self.last_count = u32::from_ne_bytes(count);
        debug!("UIO event count {}", self.last_count);

        self.unmask()?;
        Ok(true)
    }
}
