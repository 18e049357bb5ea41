//! SM500 Acquisition Monitor
//!
//! Opens a device, streams both channels through [`AcquisitionService`] and
//! reports what arrived.

use device::{AcquisitionService, DeviceConfig, Frame, Sm500Device, SimulatedPlatform};
use dma_pool::Timestamp;
use fpga_sim::SimConfig;
use register_port::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Frames requested per simulated scan before a full spectrum is produced
const PEAKS_PER_SCAN: usize = 4;

/// Quiet period after which a finished run stops listening
const IDLE_LIMIT: Duration = Duration::from_millis(200);

/// Initialize logging
pub fn init_logging() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// What a monitoring run observed
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub peaks_received: usize,
    pub full_spectrum_received: usize,
    pub peaks_completed: u64,
    pub overruns: u64,
    pub last_timestamp: Option<Timestamp>,
}

impl RunSummary {
    fn record(&mut self, frame: &Frame) {
        match frame.stream {
            Stream::Peaks => self.peaks_received += 1,
            Stream::FullSpectrum => self.full_spectrum_received += 1,
        }
        if self.last_timestamp.map_or(true, |ts| frame.timestamp > ts) {
            self.last_timestamp = Some(frame.timestamp);
        }
    }
}

/// Run `frames` peaks completions through a simulated instrument
pub async fn run_simulated(
    config: DeviceConfig,
    sim: SimConfig,
    frames: usize,
) -> anyhow::Result<RunSummary> {
    let platform = Arc::new(SimulatedPlatform::new(sim));
    let device = Arc::new(Sm500Device::open(platform.clone(), config)?);
    let control = device.control()?;
    info!(
        "Monitoring {} (firmware {}, driver {})",
        device.node().unwrap_or_default(),
        control.firmware_version()?,
        control.driver_version()
    );

    let mut peaks = AcquisitionService::spawn(device.clone(), Stream::Peaks, 64)?;
    let mut spectra = AcquisitionService::spawn(device.clone(), Stream::FullSpectrum, 4)?;

    let fpga = platform.fpga().clone();
    let producer = tokio::task::spawn_blocking(move || {
        for i in 1..=frames {
            let end_of_scan = i % PEAKS_PER_SCAN == 0;
            fpga.complete_peaks(1, end_of_scan);
            if end_of_scan {
                fpga.complete_full_spectrum();
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    let mut summary = RunSummary::default();
    loop {
        let received = timeout(IDLE_LIMIT, async {
            tokio::select! {
                frame = peaks.next() => frame,
                frame = spectra.next() => frame,
            }
        })
        .await;
        match received {
            Ok(Some(frame)) => {
                debug!("{} #{} at {:?}", frame.stream, frame.index, frame.timestamp);
                summary.record(&frame);
                if summary.peaks_received >= frames {
                    break;
                }
            }
            Ok(None) => break,
            // overruns can leave fewer frames than completions
            Err(_) if producer.is_finished() => break,
            Err(_) => {}
        }
    }
    producer.await?;

    let stats = device.stats(Stream::Peaks);
    summary.peaks_completed = stats.completed;
    summary.overruns = stats.overruns + device.stats(Stream::FullSpectrum).overruns;

    peaks.stop();
    spectra.stop();
    device.close();
    Ok(summary)
}
