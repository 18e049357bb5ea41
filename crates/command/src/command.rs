//! Typed commands and responses

use crate::error::CommandError;
use crate::ioctl::{self, RegisterArg};
use register_port::{RawVersion, Width};
use serde::{Deserialize, Serialize};

/// A request from a control application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    ReadRegister { width: Width, reg: u32 },
    WriteRegister { width: Width, reg: u32, value: u32 },
    GetDriverVersion,
    /// Raw buffer-select word: bit 31 picks full-spectrum, low 16 bits the slot
    SetBufferSelect { raw: u32 },
    /// Block until the next peaks buffer completes
    GetNextPeaks,
    PeaksReady,
    /// Block until the next full-spectrum buffer completes
    GetNextFullSpectrum,
    FullSpectrumReady,
    /// Release every blocked retrieval on both streams
    CancelAll,
}

impl Command {
    /// Legacy ioctl request code carrying this command
    pub fn request_code(&self) -> u32 {
        match self {
            Command::ReadRegister { width, .. } => match width {
                Width::W8 => ioctl::READ_REG8,
                Width::W16 => ioctl::READ_REG16,
                Width::W32 => ioctl::READ_REG32,
            },
            Command::WriteRegister { width, .. } => match width {
                Width::W8 => ioctl::WRITE_REG8,
                Width::W16 => ioctl::WRITE_REG16,
                Width::W32 => ioctl::WRITE_REG32,
            },
            Command::GetDriverVersion => ioctl::DRV_VERSION,
            Command::SetBufferSelect { .. } => ioctl::SET_MMAP_INDEX,
            Command::GetNextPeaks => ioctl::GET_PEAKS_DATA,
            Command::PeaksReady => ioctl::PEAKS_DATA_READY,
            Command::GetNextFullSpectrum => ioctl::GET_SPECTRUM,
            Command::FullSpectrumReady => ioctl::FS_DATA_READY,
            Command::CancelAll => ioctl::CANCEL_READ,
        }
    }

    /// Rebuild a command from a legacy request
    ///
    /// Register requests take `reg`/`value` from the argument block; the
    /// buffer-select request takes the raw word from `value`.
    pub fn from_request(code: u32, arg: RegisterArg) -> Result<Self, CommandError> {
        let command = match code {
            ioctl::READ_REG8 => Self::read(Width::W8, arg),
            ioctl::READ_REG16 => Self::read(Width::W16, arg),
            ioctl::READ_REG32 => Self::read(Width::W32, arg),
            ioctl::WRITE_REG8 => Self::write(Width::W8, arg),
            ioctl::WRITE_REG16 => Self::write(Width::W16, arg),
            ioctl::WRITE_REG32 => Self::write(Width::W32, arg),
            ioctl::DRV_VERSION => Command::GetDriverVersion,
            ioctl::SET_MMAP_INDEX => Command::SetBufferSelect { raw: arg.value },
            ioctl::GET_PEAKS_DATA => Command::GetNextPeaks,
            ioctl::PEAKS_DATA_READY => Command::PeaksReady,
            ioctl::GET_SPECTRUM => Command::GetNextFullSpectrum,
            ioctl::FS_DATA_READY => Command::FullSpectrumReady,
            ioctl::CANCEL_READ => Command::CancelAll,
            other => return Err(CommandError::UnknownRequest(other)),
        };
        Ok(command)
    }

    fn read(width: Width, arg: RegisterArg) -> Self {
        Command::ReadRegister {
            width,
            reg: arg.reg,
        }
    }

    fn write(width: Width, arg: RegisterArg) -> Self {
        Command::WriteRegister {
            width,
            reg: arg.reg,
            value: arg.value,
        }
    }

    /// Whether the command can suspend the caller
    pub fn is_blocking(&self) -> bool {
        matches!(self, Command::GetNextPeaks | Command::GetNextFullSpectrum)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Register(u32),
    DriverVersion(RawVersion),
    /// Slot index of a completed buffer
    Slot(u32),
    Ready(bool),
}
