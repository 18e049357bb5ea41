//! Interrupt-driven producer

use crate::clock::{Clock, SystemClock};
use crate::cursor::target_slot;
use crate::flow::{FlowControl, Ring, StreamState};
use metrics::counter;
use register_port::{map, InterruptFlags, RegisterError, RegisterPort, Stream, Width};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// What one interrupt event did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterruptOutcome {
    /// Flags read (and cleared) from the interrupt flag register
    pub flags: InterruptFlags,
    pub peaks_completed: usize,
    pub fs_completed: usize,
    /// Completions that overwrote unread data
    pub overruns: usize,
    /// Streams shut down by a failure during this event
    pub faulted: usize,
}

impl InterruptOutcome {
    /// True when no flag was pending
    pub fn is_spurious(&self) -> bool {
        self.flags.is_empty() && self.faulted == 0
    }
}

/// Producer side of the acquisition pipeline
///
/// [`AcquisitionEngine::on_interrupt`] is the only entry point; it never
/// blocks on consumers and never returns an error. Register failures shut the
/// affected stream down instead.
pub struct AcquisitionEngine {
    port: Arc<RegisterPort>,
    flow: Arc<FlowControl>,
    clock: Arc<dyn Clock>,
}

impl AcquisitionEngine {
    pub fn new(port: Arc<RegisterPort>, flow: Arc<FlowControl>, clock: Arc<dyn Clock>) -> Self {
        Self { port, flow, clock }
    }

    /// Engine stamping buffers with wall-clock time
    pub fn with_system_clock(port: Arc<RegisterPort>, flow: Arc<FlowControl>) -> Self {
        Self::new(port, flow, Arc::new(SystemClock))
    }

    pub fn flow(&self) -> &Arc<FlowControl> {
        &self.flow
    }

    pub fn port(&self) -> &Arc<RegisterPort> {
        &self.port
    }

    /// Read the pending flags and clear them immediately
    fn take_flags(&self) -> Result<InterruptFlags, RegisterError> {
        let flags = InterruptFlags(self.port.read32(map::INTF)?);
        self.port.write32(map::INTF, InterruptFlags::NONE.bits())?;
        Ok(flags)
    }

    /// Handle one hardware interrupt event
    pub fn on_interrupt(&self) -> InterruptOutcome {
        counter!("sm500_interrupts_total").increment(1);

        let flags = match self.take_flags() {
            Ok(flags) => flags,
            Err(e) => {
                error!("Interrupt flag access failed: {}", e);
                return InterruptOutcome {
                    faulted: self.fault_all(),
                    ..Default::default()
                };
            }
        };

        if flags.is_empty() {
            // one interrupt may have covered several peaks completions
            debug!("Spurious interrupt");
            counter!("sm500_spurious_interrupts_total").increment(1);
            return InterruptOutcome::default();
        }
        trace!(flags = flags.bits(), "interrupt");

        let mut outcome = InterruptOutcome {
            flags,
            ..Default::default()
        };
        let mut faulted = Vec::new();
        {
            let mut rings = self.flow.lock();
            let [peaks, full_spectrum] = &mut *rings;

            if flags.contains(InterruptFlags::FULL_SPECTRUM) {
                self.complete_full_spectrum(full_spectrum, &mut outcome, &mut faulted);
            }
            if flags.contains(InterruptFlags::PEAKS) {
                self.drain_peaks(peaks, full_spectrum, flags, &mut outcome, &mut faulted);
            }
        }

        if flags.contains(InterruptFlags::FULL_SPECTRUM) {
            self.flow.wake(Stream::FullSpectrum);
        }
        if flags.contains(InterruptFlags::PEAKS) {
            self.flow.wake(Stream::Peaks);
        }
        for stream in faulted {
            self.shut_down(stream);
        }
        outcome
    }

    fn complete_full_spectrum(
        &self,
        ring: &mut Ring,
        outcome: &mut InterruptOutcome,
        faulted: &mut Vec<Stream>,
    ) {
        if ring.state == StreamState::Idle {
            debug!("Full-spectrum interrupt while idle");
            return;
        }

        let ts = ring.pending_fs.take().unwrap_or_else(|| self.clock.now());
        match ring.complete(ts) {
            Ok(overrun) => {
                outcome.fs_completed += 1;
                outcome.overruns += overrun as usize;
                record(Stream::FullSpectrum, 1, overrun as u64);
            }
            Err(e) => {
                error!("Full-spectrum completion failed: {}", e);
                ring.fault();
                outcome.faulted += 1;
                faulted.push(Stream::FullSpectrum);
            }
        }
    }

    /// Advance the peaks write cursor up to the slot after the hardware serial
    fn drain_peaks(
        &self,
        ring: &mut Ring,
        full_spectrum: &mut Ring,
        flags: InterruptFlags,
        outcome: &mut InterruptOutcome,
        faulted: &mut Vec<Stream>,
    ) {
        if ring.state == StreamState::Idle {
            debug!("Peaks interrupt while idle");
            return;
        }

        let serial = match self.port.read32(map::DMASNLO) {
            Ok(serial) => serial,
            Err(e) => {
                error!("Peaks serial number read failed: {}", e);
                ring.fault();
                outcome.faulted += 1;
                faulted.push(Stream::Peaks);
                return;
            }
        };

        let target = target_slot(serial, ring.mask());
        let mut overruns = 0;
        while ring.write_ptr() != target {
            let ts = self.clock.now();
            match ring.complete(ts) {
                Ok(overrun) => {
                    outcome.peaks_completed += 1;
                    overruns += overrun as usize;
                }
                Err(e) => {
                    error!("Peaks completion failed: {}", e);
                    ring.fault();
                    outcome.faulted += 1;
                    faulted.push(Stream::Peaks);
                    break;
                }
            }
            if flags.contains(InterruptFlags::FS_AVAILABLE) {
                full_spectrum.pending_fs = Some(ts);
            }
        }

        if overruns > 0 {
            debug!("Peaks overrun: {} unread buffer(s) overwritten", overruns);
        }
        outcome.overruns += overruns;
        record(Stream::Peaks, outcome.peaks_completed as u64, overruns as u64);
    }

    /// Stop every running stream after the interrupt path itself failed
    ///
    /// Waiters are released with `Cancelled`; later retrievals see the stream
    /// idle. Returns the number of streams faulted.
    pub fn fault_all(&self) -> usize {
        let faulted: Vec<Stream> = {
            let mut rings = self.flow.lock();
            rings
                .iter_mut()
                .filter(|ring| ring.state != StreamState::Idle)
                .map(|ring| {
                    ring.fault();
                    ring.stream
                })
                .collect()
        };
        for &stream in &faulted {
            self.shut_down(stream);
        }
        faulted.len()
    }

    /// Turn a faulted stream's DMA and interrupt source off
    fn shut_down(&self, stream: Stream) {
        counter!("sm500_stream_faults_total", "stream" => stream.as_str()).increment(1);
        self.flow.wake(stream);

        if let Err(e) = self
            .port
            .clear_bits(Width::W32, map::INTE, stream.interrupt_bit().bits())
        {
            warn!("Could not mask {} interrupts: {}", stream, e);
        }
        if let Err(e) = self
            .port
            .clear_bits(Width::W32, map::DMACR, stream.dma_bit().bits())
        {
            warn!("Could not stop {} DMA: {}", stream, e);
        }
    }
}

fn record(stream: Stream, completed: u64, overruns: u64) {
    counter!("sm500_buffers_completed_total", "stream" => stream.as_str()).increment(completed);
    if overruns > 0 {
        counter!("sm500_overruns_total", "stream" => stream.as_str()).increment(overruns);
    }
}

impl std::fmt::Debug for AcquisitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionEngine")
            .field("port", &self.port)
            .field("flow", &self.flow)
            .finish()
    }
}
