//! Simulated interrupt line

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct LineState {
    pending: Mutex<u64>,
    cond: Condvar,
}

/// Level-style interrupt line; edges raised before a wait are merged into one
#[derive(Clone, Default)]
pub struct SimInterruptLine {
    inner: Arc<LineState>,
}

impl SimInterruptLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert the line
    pub fn raise(&self) {
        *self.inner.pending.lock() += 1;
        self.inner.cond.notify_one();
    }

    /// Wait for the line to be asserted, consuming every pending edge
    ///
    /// Returns `false` when the timeout elapsed with the line idle.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.inner.pending.lock();
        if *pending == 0 {
            self.inner.cond.wait_for(&mut pending, timeout);
        }
        if *pending > 0 {
            *pending = 0;
            true
        } else {
            false
        }
    }

    /// Number of edges raised since the last wait
    pub fn pending(&self) -> u64 {
        *self.inner.pending.lock()
    }
}

impl std::fmt::Debug for SimInterruptLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimInterruptLine")
            .field("pending", &self.pending())
            .finish()
    }
}
