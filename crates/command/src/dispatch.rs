//! Command dispatch against an open device

use crate::codec::{decode, encode, Reply};
use crate::command::{Command, Response};
use crate::error::CommandError;
use device::Sm500Device;
use register_port::Stream;
use tracing::{debug, warn};

/// Execute one command
///
/// Blocking retrievals honor the device's configured timeout.
pub fn dispatch(device: &Sm500Device, command: Command) -> Result<Response, CommandError> {
    debug!("Dispatching {:?}", command);
    let timeout = device.config().retrieve_timeout();

    let response = match command {
        Command::ReadRegister { width, reg } => {
            Response::Register(device.control()?.read_register(width, reg)?)
        }
        Command::WriteRegister { width, reg, value } => {
            device.control()?.write_register(width, reg, value)?;
            Response::Done
        }
        Command::GetDriverVersion => {
            Response::DriverVersion(device.control()?.raw_driver_version())
        }
        Command::SetBufferSelect { raw } => {
            device.control()?;
            device.select_buffer(raw);
            Response::Done
        }
        Command::GetNextPeaks => {
            Response::Slot(device.retrieve_index(Stream::Peaks, timeout)? as u32)
        }
        Command::PeaksReady => Response::Ready(device.is_peaks_ready()),
        Command::GetNextFullSpectrum => {
            Response::Slot(device.retrieve_index(Stream::FullSpectrum, timeout)? as u32)
        }
        Command::FullSpectrumReady => Response::Ready(device.is_full_spectrum_ready()),
        Command::CancelAll => {
            device.cancel_all();
            Response::Done
        }
    };
    Ok(response)
}

/// Decode a command frame, execute it and encode the reply
///
/// Device failures travel back inside the reply; only malformed frames
/// fail the call.
pub fn handle_frame(device: &Sm500Device, frame: &[u8]) -> Result<Vec<u8>, CommandError> {
    let command: Command = decode(frame)?;
    let reply: Reply = dispatch(device, command).map_err(|e| {
        warn!("{:?} failed: {}", command, e);
        e.to_string()
    });
    encode(&reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::command_frame;
    use device::{DeviceConfig, DeviceError, SimulatedPlatform};
    use register_port::map::{DMACR, HVER, SYSCON};
    use register_port::{RawVersion, Width};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn open() -> (Arc<SimulatedPlatform>, Arc<Sm500Device>) {
        let platform = Arc::new(SimulatedPlatform::default());
        let device = Sm500Device::open(platform.clone(), DeviceConfig::default()).unwrap();
        (platform, Arc::new(device))
    }

    #[test]
    fn test_register_commands() {
        let (_platform, device) = open();
        assert_eq!(
            dispatch(
                &device,
                Command::ReadRegister {
                    width: Width::W32,
                    reg: HVER
                }
            )
            .unwrap(),
            Response::Register(0x0001_0012)
        );
        assert_eq!(
            dispatch(
                &device,
                Command::ReadRegister {
                    width: Width::W32,
                    reg: DMACR
                }
            )
            .unwrap(),
            Response::Register(6)
        );

        dispatch(
            &device,
            Command::WriteRegister {
                width: Width::W32,
                reg: SYSCON,
                value: 0x01,
            },
        )
        .unwrap();
        assert_eq!(
            dispatch(
                &device,
                Command::ReadRegister {
                    width: Width::W32,
                    reg: SYSCON
                }
            )
            .unwrap(),
            Response::Register(0x01)
        );
    }

    #[test]
    fn test_driver_version() {
        let (_platform, device) = open();
        assert_eq!(
            dispatch(&device, Command::GetDriverVersion).unwrap(),
            Response::DriverVersion(RawVersion::new(0, 51))
        );
    }

    #[test]
    fn test_peaks_retrieval() {
        let (platform, device) = open();
        assert_eq!(
            dispatch(&device, Command::PeaksReady).unwrap(),
            Response::Ready(false)
        );

        platform.fpga().complete_peaks(2, false);
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.stats(Stream::Peaks).completed < 2 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(
            dispatch(&device, Command::PeaksReady).unwrap(),
            Response::Ready(true)
        );
        assert_eq!(
            dispatch(&device, Command::GetNextPeaks).unwrap(),
            Response::Slot(0)
        );
        assert_eq!(
            dispatch(&device, Command::GetNextPeaks).unwrap(),
            Response::Slot(1)
        );
    }

    #[test]
    fn test_cancel_all_releases_blocked_command() {
        let (_platform, device) = open();
        let blocked = {
            let device = device.clone();
            thread::spawn(move || dispatch(&device, Command::GetNextFullSpectrum))
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while device.flow().waiters(Stream::FullSpectrum) == 0 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(dispatch(&device, Command::CancelAll).unwrap(), Response::Done);
        assert!(matches!(
            blocked.join().unwrap(),
            Err(CommandError::Device(DeviceError::Cancelled { .. }))
        ));
    }

    #[test]
    fn test_buffer_select() {
        let (_platform, device) = open();
        dispatch(&device, Command::SetBufferSelect { raw: 0x8000_0000 }).unwrap();
        assert_eq!(device.selected_buffer().stream(), Stream::FullSpectrum);
        assert_eq!(device.map_selected().unwrap().index(), 0);
    }

    #[test]
    fn test_closed_device() {
        let (_platform, device) = open();
        device.close();
        assert_eq!(
            dispatch(&device, Command::GetDriverVersion),
            Err(CommandError::Device(DeviceError::DeviceUnavailable))
        );
        assert_eq!(
            dispatch(&device, Command::GetNextPeaks),
            Err(CommandError::Device(DeviceError::DeviceUnavailable))
        );
    }

    #[test]
    fn test_handle_frame() {
        let (_platform, device) = open();
        let reply = handle_frame(&device, &command_frame(&Command::PeaksReady).unwrap()).unwrap();
        assert_eq!(decode::<Reply>(&reply).unwrap(), Ok(Response::Ready(false)));

        device.close();
        let reply =
            handle_frame(&device, &command_frame(&Command::GetDriverVersion).unwrap()).unwrap();
        assert!(decode::<Reply>(&reply).unwrap().is_err());

        assert!(matches!(
            handle_frame(&device, &[0xFF]),
            Err(CommandError::Codec(_))
        ));
    }
}
