//! Stream-oriented device abstraction

use crate::config::DeviceConfig;
use crate::control::DeviceControl;
use crate::error::DeviceError;
use crate::platform::Platform;
use acquisition::{
    target_slot, AcquisitionEngine, AcquisitionError, Clock, FlowControl, IrqDispatcher,
    StreamStats, SystemClock,
};
use dma_pool::{BufferPool, BufferSelector, BufferView, Geometry};
use parking_lot::Mutex;
use register_port::{DmaMask, InterruptFlags, RegisterPort, Stream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Resources held while the device is open
struct Session {
    node: String,
    port: Arc<RegisterPort>,
    control: DeviceControl,
    streams: Vec<Stream>,
    pools: Vec<Arc<BufferPool>>,
    dispatcher: Option<IrqDispatcher>,
}

impl Session {
    fn masks(&self) -> (DmaMask, InterruptFlags) {
        self.streams
            .iter()
            .fold((DmaMask::NONE, InterruptFlags::NONE), |(dma, irq), s| {
                (dma | s.dma_bit(), irq | s.interrupt_bit())
            })
    }

    fn pool(&self, stream: Stream) -> Option<&Arc<BufferPool>> {
        self.pools.iter().find(|p| p.stream() == stream)
    }

    /// Quiesce the hardware, release waiters, free buffers, close the port
    ///
    /// Tolerates a partially built session. Returns the number of buffers
    /// released.
    fn shut_down(&mut self, flow: &FlowControl) -> usize {
        if let Err(e) = self.control.set_interrupts(InterruptFlags::NONE) {
            warn!("Could not disable interrupts on {}: {}", self.node, e);
        }
        if let Err(e) = self.control.set_dma(DmaMask::NONE) {
            warn!("Could not disable DMA on {}: {}", self.node, e);
        }

        for stream in Stream::ALL {
            flow.disarm(stream);
        }
        if let Some(mut dispatcher) = self.dispatcher.take() {
            dispatcher.stop();
        }

        let mut released = 0;
        for pool in self.pools.drain(..) {
            flow.detach(pool.stream());
            released += pool.teardown();
        }

        self.port.close();
        released
    }
}

/// An SM500 instrument opened for acquisition
///
/// Opening sets up the buffer pools of every enabled stream, binds the
/// interrupt and enables interrupts and DMA. Retrieval calls block on the
/// stream's flow control and never hold the device lock while waiting.
pub struct Sm500Device {
    config: DeviceConfig,
    platform: Arc<dyn Platform>,
    clock: Arc<dyn Clock>,
    flow: Arc<FlowControl>,
    session: Mutex<Option<Session>>,
    selector: Mutex<BufferSelector>,
}

impl Sm500Device {
    /// Open the configured device node
    pub fn open(platform: Arc<dyn Platform>, config: DeviceConfig) -> Result<Self, DeviceError> {
        let node = config.device_node.clone();
        Self::open_named(platform, config, &node)
    }

    /// Open a specific device node
    pub fn open_named(
        platform: Arc<dyn Platform>,
        config: DeviceConfig,
        node: &str,
    ) -> Result<Self, DeviceError> {
        Self::open_with_clock(platform, config, node, Arc::new(SystemClock))
    }

    /// Open with a custom timestamp source
    pub fn open_with_clock(
        platform: Arc<dyn Platform>,
        config: DeviceConfig,
        node: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, DeviceError> {
        let device = Self {
            config,
            platform,
            clock,
            flow: Arc::new(FlowControl::new()),
            session: Mutex::new(None),
            selector: Mutex::new(BufferSelector::default()),
        };
        device.reopen(node)?;
        Ok(device)
    }

    /// Open again after [`Sm500Device::close`]; no-op while open
    pub fn reopen(&self, node: &str) -> Result<(), DeviceError> {
        let mut slot = self.session.lock();
        if slot.is_some() {
            debug!("{} already open", node);
            return Ok(());
        }

        let bus = self.platform.open_bus(node)?;
        let port = Arc::new(RegisterPort::new(bus));
        let mut session = Session {
            node: node.to_string(),
            control: DeviceControl::new(port.clone(), self.platform.driver_version()),
            port,
            streams: Stream::ALL
                .into_iter()
                .filter(|s| match s {
                    Stream::Peaks => self.config.enable_peaks,
                    Stream::FullSpectrum => self.config.enable_full_spectrum,
                })
                .collect(),
            pools: Vec::new(),
            dispatcher: None,
        };

        match self.start(&mut session) {
            Ok(()) => {
                *slot = Some(session);
                Ok(())
            }
            Err(e) => {
                error!("Failed to open {}: {}", node, e);
                let released = session.shut_down(&self.flow);
                debug!("Unwound {} buffer(s)", released);
                Err(e)
            }
        }
    }

    fn start(&self, session: &mut Session) -> Result<(), DeviceError> {
        let control = session.control.clone();
        info!(
            "SM500 on {}: firmware {}, HDL {:?}, driver {}",
            session.node,
            control.firmware_version()?,
            control.hdl_version()?,
            control.driver_version()
        );

        // nothing may complete while pools are being programmed
        control.set_interrupts(InterruptFlags::NONE)?;
        control.set_dma(DmaMask::NONE)?;

        let allocator = self.platform.allocator();
        for stream in session.streams.clone() {
            let geometry = control.discover_geometry(stream)?;
            let pool = Arc::new(BufferPool::new(stream, geometry, allocator.clone())?);
            session.pools.push(pool.clone());
            pool.setup(&session.port)?;
            self.flow.attach(pool);
        }

        let engine = Arc::new(AcquisitionEngine::new(
            session.port.clone(),
            self.flow.clone(),
            self.clock.clone(),
        ));
        let source = self.platform.interrupt_source()?;
        session.dispatcher = Some(IrqDispatcher::spawn(
            source,
            engine,
            self.config.irq_poll(),
        )?);

        // line the cursors up with the slot the hardware fills next
        let serial = control.serial_number()?;
        for pool in &session.pools {
            let start = match pool.stream() {
                Stream::Peaks => target_slot(serial as u32, pool.geometry().mask()),
                Stream::FullSpectrum => 0,
            };
            self.flow.arm_at(pool.stream(), start)?;
        }

        let (dma, irq) = session.masks();
        control.set_interrupts(irq)?;
        control.set_dma(dma)?;
        info!("Acquisition enabled on {}: {:?}", session.node, session.streams);
        Ok(())
    }

    /// Disable acquisition and release every resource; safe to repeat
    pub fn close(&self) {
        let Some(mut session) = self.session.lock().take() else {
            debug!("Device already closed");
            return;
        };
        let released = session.shut_down(&self.flow);
        *self.selector.lock() = BufferSelector::default();
        info!("Closed {} ({} buffers released)", session.node, released);
    }

    pub fn is_open(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Node the device was opened on
    pub fn node(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.node.clone())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn flow(&self) -> &Arc<FlowControl> {
        &self.flow
    }

    /// Control layer of the open device
    pub fn control(&self) -> Result<DeviceControl, DeviceError> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.control.clone())
            .ok_or(DeviceError::DeviceUnavailable)
    }

    /// Geometry of an enabled stream
    pub fn geometry(&self, stream: Stream) -> Option<Geometry> {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.pool(stream).map(|p| p.geometry()))
    }

    fn retrieval_error(&self, e: AcquisitionError) -> DeviceError {
        match e {
            AcquisitionError::StreamIdle { .. } | AcquisitionError::NotAttached { .. }
                if !self.is_open() =>
            {
                DeviceError::DeviceUnavailable
            }
            other => other.into(),
        }
    }

    /// Wait for the next completed buffer of a stream
    pub fn retrieve(
        &self,
        stream: Stream,
        timeout: Option<Duration>,
    ) -> Result<BufferView, DeviceError> {
        self.flow
            .retrieve_view(stream, timeout)
            .map_err(|e| self.retrieval_error(e))
    }

    /// Wait for the next completed slot, returning only its index
    pub fn retrieve_index(
        &self,
        stream: Stream,
        timeout: Option<Duration>,
    ) -> Result<usize, DeviceError> {
        self.flow
            .retrieve(stream, timeout)
            .map_err(|e| self.retrieval_error(e))
    }

    /// Next peaks buffer, honoring the configured timeout
    pub fn get_next_peaks(&self) -> Result<BufferView, DeviceError> {
        self.retrieve(Stream::Peaks, self.config.retrieve_timeout())
    }

    /// Next full-spectrum buffer, honoring the configured timeout
    pub fn get_next_full_spectrum(&self) -> Result<BufferView, DeviceError> {
        self.retrieve(Stream::FullSpectrum, self.config.retrieve_timeout())
    }

    pub fn is_ready(&self, stream: Stream) -> bool {
        self.flow.is_ready(stream)
    }

    pub fn is_peaks_ready(&self) -> bool {
        self.is_ready(Stream::Peaks)
    }

    pub fn is_full_spectrum_ready(&self) -> bool {
        self.is_ready(Stream::FullSpectrum)
    }

    /// Release every blocked retrieval on a stream
    pub fn cancel(&self, stream: Stream) {
        self.flow.cancel(stream);
    }

    /// Release every blocked retrieval on both streams
    pub fn cancel_all(&self) {
        self.flow.cancel_all();
    }

    /// Drop unread completions of a stream
    pub fn flush(&self, stream: Stream) -> usize {
        self.flow.flush(stream)
    }

    pub fn stats(&self, stream: Stream) -> StreamStats {
        self.flow.stats(stream)
    }

    /// Driver version as `major.minor`
    pub fn driver_version(&self) -> Result<String, DeviceError> {
        Ok(self.control()?.driver_version())
    }

    /// Zero-copy view of any slot of an enabled stream
    pub fn map_buffer(&self, stream: Stream, index: usize) -> Result<BufferView, DeviceError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(DeviceError::DeviceUnavailable)?;
        let pool = session
            .pool(stream)
            .ok_or(DeviceError::StreamDisabled { stream })?;
        Ok(pool.map_for_consumer(index)?)
    }

    /// Point the buffer-select cursor at a raw selector word
    pub fn select_buffer(&self, raw: u32) {
        let selector = BufferSelector::from_raw(raw);
        debug!(
            "Buffer select: {} #{}",
            selector.stream(),
            selector.index()
        );
        *self.selector.lock() = selector;
    }

    pub fn selected_buffer(&self) -> BufferSelector {
        *self.selector.lock()
    }

    /// Map the selected buffer, then move the cursor to the next slot
    pub fn map_selected(&self) -> Result<BufferView, DeviceError> {
        let mut selector = self.selector.lock();
        let view = self.map_buffer(selector.stream(), selector.index())?;
        selector.advance();
        Ok(view)
    }
}

impl Drop for Sm500Device {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Sm500Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sm500Device")
            .field("platform", &self.platform.name())
            .field("node", &self.node())
            .field("flow", &self.flow)
            .finish()
    }
}

#[cfg(all(test, feature = "simulator"))]
mod tests {
    use super::*;
    use crate::platform::SimulatedPlatform;
    use acquisition::ManualClock;
    use dma_pool::{Timestamp, FS_SELECT};
    use fpga_sim::SimConfig;
    use std::thread;
    use std::time::Instant;

    const NODE: &str = "/dev/sm500";

    struct Rig {
        platform: Arc<SimulatedPlatform>,
        clock: Arc<ManualClock>,
    }

    impl Rig {
        fn new(config: SimConfig) -> Self {
            Self {
                platform: Arc::new(SimulatedPlatform::new(config)),
                clock: Arc::new(ManualClock::new(Timestamp::new(100, 0))),
            }
        }

        fn open_with(&self, config: DeviceConfig) -> Result<Sm500Device, DeviceError> {
            Sm500Device::open_with_clock(
                self.platform.clone(),
                config,
                NODE,
                self.clock.clone(),
            )
        }

        fn open(&self) -> Sm500Device {
            self.open_with(DeviceConfig::default()).unwrap()
        }

        /// One peaks completion, stamped one second after the previous
        fn complete(&self, device: &Sm500Device) -> Timestamp {
            self.clock.advance(Duration::from_secs(1));
            let stamp = self.clock.now();
            let before = device.stats(Stream::Peaks).completed;
            self.platform.fpga().complete_peaks(1, false);
            wait_until(|| device.stats(Stream::Peaks).completed > before);
            stamp
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_open_enables_acquisition() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();
        let fpga = rig.platform.fpga();

        assert!(device.is_open());
        assert_eq!(device.node().as_deref(), Some(NODE));
        assert_eq!(fpga.dma_mask(), DmaMask::ALL);
        assert_eq!(
            fpga.interrupt_mask(),
            InterruptFlags::PEAKS | InterruptFlags::FULL_SPECTRUM
        );
        assert_eq!(fpga.allocator().live(), 5);
        assert_eq!(device.driver_version().unwrap(), "0.51");
        assert_eq!(device.control().unwrap().firmware_version().unwrap(), "1.18");
    }

    #[test]
    fn test_acquisition_scenario() {
        let rig = Rig::new(SimConfig {
            peaks_count: 4,
            peaks_size: 64,
            ..SimConfig::default()
        });
        let device = rig.open();
        let geometry = device.geometry(Stream::Peaks).unwrap();
        assert_eq!((geometry.count, geometry.size), (4, 64));

        let t1 = rig.complete(&device);
        let t2 = rig.complete(&device);
        let t3 = rig.complete(&device);
        assert!(t1 < t2 && t2 < t3);

        assert!(device.is_peaks_ready());
        assert_eq!(device.get_next_peaks().unwrap().timestamp(), t1);
        assert_eq!(device.get_next_peaks().unwrap().timestamp(), t2);
        assert!(device.is_peaks_ready());
        assert_eq!(device.get_next_peaks().unwrap().timestamp(), t3);
        assert!(!device.is_peaks_ready());
    }

    #[test]
    fn test_fifo_order_matches_completion_order() {
        let rig = Rig::new(SimConfig {
            peaks_count: 8,
            ..SimConfig::default()
        });
        let device = rig.open();
        let stamps: Vec<Timestamp> = (0..7).map(|_| rig.complete(&device)).collect();
        let delivered: Vec<Timestamp> = (0..7)
            .map(|_| device.get_next_peaks().unwrap().timestamp())
            .collect();
        assert_eq!(delivered, stamps);
    }

    #[test]
    fn test_overrun_never_delivers_the_first() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();
        let stamps: Vec<Timestamp> = (0..5).map(|_| rig.complete(&device)).collect();

        let first = device.get_next_peaks().unwrap().timestamp();
        assert_ne!(first, stamps[0]);
        assert!(first >= stamps[3]);
        assert_eq!(device.stats(Stream::Peaks).overruns, 1);
    }

    #[test]
    fn test_write_cursor_wraps_after_count_completions() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();
        let (_, start) = device.flow().cursors(Stream::Peaks);
        for _ in 0..4 {
            rig.complete(&device);
        }
        assert_eq!(device.flow().cursors(Stream::Peaks).1, start);
        assert_eq!(start, 0);
    }

    #[test]
    fn test_cancel_all_releases_every_waiter() {
        let rig = Rig::new(SimConfig::default());
        let device = Arc::new(rig.open());

        let waiters: Vec<_> = (0..3)
            .map(|i| {
                let device = device.clone();
                let stream = if i == 0 {
                    Stream::FullSpectrum
                } else {
                    Stream::Peaks
                };
                thread::spawn(move || device.retrieve(stream, None))
            })
            .collect();
        wait_until(|| {
            device.flow().waiters(Stream::Peaks) == 2
                && device.flow().waiters(Stream::FullSpectrum) == 1
        });

        device.cancel_all();
        for waiter in waiters {
            assert!(matches!(
                waiter.join().unwrap(),
                Err(DeviceError::Cancelled { .. })
            ));
        }
    }

    #[test]
    fn test_close_twice() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();
        rig.complete(&device);

        device.close();
        assert!(!device.is_open());
        assert_eq!(rig.platform.fpga().allocator().live(), 0);
        assert_eq!(rig.platform.fpga().dma_mask(), DmaMask::NONE);
        assert_eq!(rig.platform.fpga().interrupt_mask(), InterruptFlags::NONE);

        device.close();
        assert_eq!(rig.platform.fpga().allocator().live(), 0);
        assert!(matches!(
            device.get_next_peaks(),
            Err(DeviceError::DeviceUnavailable)
        ));
        assert!(matches!(
            device.map_buffer(Stream::Peaks, 0),
            Err(DeviceError::DeviceUnavailable)
        ));
        assert!(!device.is_peaks_ready());
    }

    #[test]
    fn test_close_releases_blocked_reader() {
        let rig = Rig::new(SimConfig::default());
        let device = Arc::new(rig.open());
        let reader = {
            let device = device.clone();
            thread::spawn(move || device.get_next_peaks())
        };
        wait_until(|| device.flow().waiters(Stream::Peaks) == 1);

        device.close();
        assert!(matches!(
            reader.join().unwrap(),
            Err(DeviceError::Cancelled { .. })
        ));
    }

    #[test]
    fn test_interrupt_loss_releases_blocked_reader() {
        let rig = Rig::new(SimConfig::default());
        let device = Arc::new(rig.open());
        let reader = {
            let device = device.clone();
            thread::spawn(move || device.get_next_peaks())
        };
        wait_until(|| device.flow().waiters(Stream::Peaks) == 1);

        rig.platform.lose_interrupts(true);
        assert!(matches!(
            reader.join().unwrap(),
            Err(DeviceError::Cancelled { .. })
        ));
        assert!(device.is_open());
        assert!(matches!(
            device.get_next_full_spectrum(),
            Err(DeviceError::StreamDisabled { .. })
        ));
        assert_eq!(device.stats(Stream::Peaks).faults, 1);
        assert_eq!(rig.platform.fpga().dma_mask(), DmaMask::NONE);
        assert_eq!(rig.platform.fpga().interrupt_mask(), InterruptFlags::NONE);

        // a fresh session binds a working source again
        rig.platform.lose_interrupts(false);
        device.close();
        device.reopen(NODE).unwrap();
        rig.complete(&device);
        assert!(device.get_next_peaks().is_ok());
    }

    #[test]
    fn test_reopen_continues_from_hardware_position() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();
        for _ in 0..3 {
            rig.complete(&device);
        }
        device.close();
        device.reopen(NODE).unwrap();
        assert!(!device.is_peaks_ready());

        rig.complete(&device);
        let view = device.get_next_peaks().unwrap();
        assert_eq!(view.index(), 3);
        assert_eq!(view.to_vec()[..8], 3u64.to_le_bytes());
    }

    #[test]
    fn test_failed_allocation_unwinds() {
        let rig = Rig::new(SimConfig::default());
        rig.platform.fpga().allocator().fail_after(2);

        let err = rig.open_with(DeviceConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::AllocationFailed {
                stream: Stream::Peaks,
                ..
            }
        ));
        assert_eq!(rig.platform.fpga().allocator().live(), 0);
        assert_eq!(rig.platform.fpga().dma_mask(), DmaMask::NONE);
    }

    #[test]
    fn test_invalid_geometry_unwinds() {
        let rig = Rig::new(SimConfig {
            peaks_count: 3,
            ..SimConfig::default()
        });
        assert!(matches!(
            rig.open_with(DeviceConfig::default()),
            Err(DeviceError::InvalidGeometry { .. })
        ));
        assert_eq!(rig.platform.fpga().allocator().live(), 0);
    }

    #[test]
    fn test_missing_device() {
        let rig = Rig::new(SimConfig::default());
        rig.platform.set_available(false);
        assert!(matches!(
            rig.open_with(DeviceConfig::default()),
            Err(DeviceError::DeviceUnavailable)
        ));
    }

    #[test]
    fn test_disabled_stream() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open_with(DeviceConfig::peaks_only()).unwrap();
        assert_eq!(rig.platform.fpga().dma_mask(), DmaMask::PEAKS);
        assert!(matches!(
            device.get_next_full_spectrum(),
            Err(DeviceError::StreamDisabled { .. })
        ));
        assert!(device.geometry(Stream::FullSpectrum).is_none());
    }

    #[test]
    fn test_configured_timeout() {
        let rig = Rig::new(SimConfig::default());
        let device = rig
            .open_with(DeviceConfig {
                retrieve_timeout_ms: Some(20),
                ..DeviceConfig::default()
            })
            .unwrap();
        assert!(matches!(
            device.get_next_peaks(),
            Err(DeviceError::Timeout { .. })
        ));
    }

    #[test]
    fn test_buffer_select_cursor() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();

        device.select_buffer(2);
        assert_eq!(device.map_selected().unwrap().index(), 2);
        assert_eq!(device.map_selected().unwrap().index(), 3);
        assert!(matches!(
            device.map_selected(),
            Err(DeviceError::InvalidBufferIndex { index: 4, .. })
        ));

        device.select_buffer(FS_SELECT);
        let view = device.map_selected().unwrap();
        assert_eq!(view.stream(), Stream::FullSpectrum);
        assert_eq!(view.len(), 4096);
        assert_eq!(device.selected_buffer().index(), 1);
    }

    #[test]
    fn test_full_spectrum_retrieval() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();
        assert!(!device.is_full_spectrum_ready());

        rig.platform.fpga().complete_full_spectrum();
        wait_until(|| device.is_full_spectrum_ready());
        let view = device.get_next_full_spectrum().unwrap();
        assert_eq!(view.index(), 0);
        assert!(!device.is_full_spectrum_ready());
    }

    #[test]
    fn test_flush_before_reading() {
        let rig = Rig::new(SimConfig::default());
        let device = rig.open();
        rig.complete(&device);
        rig.complete(&device);
        assert_eq!(device.flush(Stream::Peaks), 2);
        assert!(!device.is_peaks_ready());
    }
}
