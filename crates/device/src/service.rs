//! Async frame delivery for tokio consumers

use crate::device::Sm500Device;
use crate::error::DeviceError;
use dma_pool::{BufferView, Timestamp};
use register_port::Stream;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A completed buffer copied out of DMA memory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub stream: Stream,
    pub index: usize,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn from_view(view: &BufferView) -> Self {
        Self {
            stream: view.stream(),
            index: view.index(),
            timestamp: view.timestamp(),
            payload: view.to_vec(),
        }
    }
}

/// Background reader forwarding one stream's buffers over a channel
///
/// The reader stops when the service is stopped or dropped, when the
/// receiver goes away, or when the device is closed.
pub struct AcquisitionService {
    stream: Stream,
    receiver: mpsc::Receiver<Frame>,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AcquisitionService {
    /// Spawn a reader with room for `capacity` undelivered frames
    pub fn spawn(
        device: Arc<Sm500Device>,
        stream: Stream,
        capacity: usize,
    ) -> Result<Self, DeviceError> {
        if !device.is_open() {
            return Err(DeviceError::DeviceUnavailable);
        }
        if device.geometry(stream).is_none() {
            return Err(DeviceError::StreamDisabled { stream });
        }

        let (tx, rx) = mpsc::channel::<Frame>(capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let poll = device.config().irq_poll();

        let handle = thread::Builder::new()
            .name(format!("sm500-{}", stream))
            .spawn(move || {
                while !shutdown_clone.load(Ordering::SeqCst) {
                    match device.retrieve(stream, Some(poll)) {
                        Ok(view) => {
                            if tx.blocking_send(Frame::from_view(&view)).is_err() {
                                debug!("{} receiver dropped", stream);
                                break;
                            }
                        }
                        Err(DeviceError::Timeout { .. }) | Err(DeviceError::Cancelled { .. }) => {}
                        Err(e) => {
                            warn!("{} reader stopping: {}", stream, e);
                            break;
                        }
                    }
                }
                debug!("{} reader exited", stream);
            })
            .map_err(|e| {
                DeviceError::Interrupt(format!("cannot start {} reader: {}", stream, e))
            })?;

        info!("Acquisition service started for {}", stream);
        Ok(Self {
            stream,
            receiver: rx,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Receive the next frame; `None` once the reader has stopped
    pub async fn next(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the reader and wait for it; safe to call more than once
    ///
    /// Blocks for at most one retrieval poll. Frames already queued can
    /// still be received.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // fails a send parked on a full channel
        self.receiver.close();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} reader panicked", self.stream);
            }
        }
    }
}

impl Drop for AcquisitionService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, feature = "simulator"))]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::platform::SimulatedPlatform;
    use std::time::Duration;
    use tokio::time::timeout;

    fn open() -> (Arc<SimulatedPlatform>, Arc<Sm500Device>) {
        let platform = Arc::new(SimulatedPlatform::default());
        let device = Sm500Device::open(platform.clone(), DeviceConfig::default()).unwrap();
        (platform, Arc::new(device))
    }

    #[tokio::test]
    async fn test_service_delivers_frames() {
        let (platform, device) = open();
        let mut service = AcquisitionService::spawn(device.clone(), Stream::Peaks, 8).unwrap();
        assert_eq!(service.stream(), Stream::Peaks);

        platform.fpga().complete_peaks(2, false);
        for expected in 0..2usize {
            let frame = timeout(Duration::from_secs(5), service.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.stream, Stream::Peaks);
            assert_eq!(frame.index, expected);
            assert_eq!(frame.payload[..8], (expected as u64).to_le_bytes());
            assert_eq!(frame.payload.len(), 64);
        }
    }

    #[tokio::test]
    async fn test_stop_joins_reader_parked_on_full_channel() {
        let (platform, device) = open();
        let mut service = AcquisitionService::spawn(device.clone(), Stream::Peaks, 1).unwrap();
        assert!(service.is_running());

        platform.fpga().complete_peaks(3, false);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        // frame 0 queued, frame 1 waiting for room
        while device.stats(Stream::Peaks).retrieved < 2 {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        service.stop();
        assert!(!service.is_running());
        let queued = timeout(Duration::from_secs(5), service.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queued.index, 0);
        assert!(timeout(Duration::from_secs(5), service.next())
            .await
            .unwrap()
            .is_none());
        service.stop();
    }

    #[tokio::test]
    async fn test_service_ends_when_device_closes() {
        let (_platform, device) = open();
        let mut service =
            AcquisitionService::spawn(device.clone(), Stream::FullSpectrum, 1).unwrap();

        device.close();
        let end = timeout(Duration::from_secs(5), service.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_service_requires_enabled_stream() {
        let platform = Arc::new(SimulatedPlatform::default());
        let device =
            Arc::new(Sm500Device::open(platform.clone(), DeviceConfig::peaks_only()).unwrap());
        assert!(matches!(
            AcquisitionService::spawn(device.clone(), Stream::FullSpectrum, 4),
            Err(DeviceError::StreamDisabled { .. })
        ));

        device.close();
        assert!(matches!(
            AcquisitionService::spawn(device, Stream::Peaks, 4),
            Err(DeviceError::StreamDisabled { .. }) | Err(DeviceError::DeviceUnavailable)
        ));
    }
}
