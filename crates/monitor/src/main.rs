//! SM500 Monitor - Main Entry Point

use device::DeviceConfig;
use fpga_sim::SimConfig;
use monitor::{init_logging, run_simulated};
use std::path::PathBuf;
use tracing::info;

const DEFAULT_FRAMES: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;

    info!("=== SM500 Monitor v{} ===", env!("CARGO_PKG_VERSION"));

    let mut args = std::env::args().skip(1);
    let config_path = args.next().map(PathBuf::from);
    let frames = match args.next() {
        Some(n) => n.parse()?,
        None => DEFAULT_FRAMES,
    };

    let config = DeviceConfig::load(config_path.as_deref())?;
    let summary = run_simulated(config, SimConfig::default(), frames).await?;

    info!(
        "Received {} peaks and {} full-spectrum frames ({} overruns)",
        summary.peaks_received, summary.full_spectrum_received, summary.overruns
    );
    Ok(())
}
