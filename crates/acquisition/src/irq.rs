//! Interrupt binding: runs the engine's handler on a dedicated thread

use crate::engine::AcquisitionEngine;
use crate::error::AcquisitionError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Something that signals hardware interrupts
pub trait InterruptSource: Send + 'static {
    /// Block until the interrupt fires or `timeout` elapses
    ///
    /// Returns `Ok(true)` when an interrupt was delivered.
    fn wait(&mut self, timeout: Duration) -> Result<bool, AcquisitionError>;
}

impl InterruptSource for Box<dyn InterruptSource> {
    fn wait(&mut self, timeout: Duration) -> Result<bool, AcquisitionError> {
        (**self).wait(timeout)
    }
}

/// Background thread delivering interrupts to [`AcquisitionEngine::on_interrupt`]
pub struct IrqDispatcher {
    shutdown: Arc<AtomicBool>,
    handled: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl IrqDispatcher {
    /// Start dispatching; `poll` bounds how long shutdown can go unnoticed
    pub fn spawn<S: InterruptSource>(
        mut source: S,
        engine: Arc<AcquisitionEngine>,
        poll: Duration,
    ) -> Result<Self, AcquisitionError> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicU64::new(0));
        let shutdown_clone = shutdown.clone();
        let handled_clone = handled.clone();

        let handle = thread::Builder::new()
            .name("sm500-irq".to_string())
            .spawn(move || {
                while !shutdown_clone.load(Ordering::SeqCst) {
                    match source.wait(poll) {
                        Ok(true) => {
                            engine.on_interrupt();
                            handled_clone.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            let faulted = engine.fault_all();
                            error!(
                                "Interrupt source failed, {} stream(s) shut down: {}",
                                faulted, e
                            );
                            break;
                        }
                    }
                }
                debug!("Interrupt dispatcher exited");
            })
            .map_err(|e| AcquisitionError::Interrupt(e.to_string()))?;

        info!("Interrupt dispatcher started (poll {:?})", poll);

        Ok(Self {
            shutdown,
            handled,
            handle: Some(handle),
        })
    }

    /// Interrupt events handed to the engine so far
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread and wait for it; safe to call more than once
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Interrupt dispatcher panicked");
            }
        }
    }
}

impl Drop for IrqDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
