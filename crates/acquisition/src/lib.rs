//! Acquisition Engine and Flow Control
//!
//! The producer side turns hardware interrupts into completed buffer slots;
//! the consumer side hands those slots out in order, blocking until data is
//! available or the wait is cancelled.
//!
//! ```text
//! interrupt source ──► AcquisitionEngine::on_interrupt ──► FlowControl ──► retrieve()
//!                         (read/clear INTF, stamp, advance)     (cursors, condvars)
//! ```

mod clock;
mod cursor;
mod engine;
mod error;
mod flow;
mod irq;
pub mod uio;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cursor::{advance, pending, target_slot};
pub use engine::{AcquisitionEngine, InterruptOutcome};
pub use error::AcquisitionError;
pub use flow::{FlowControl, StreamState, StreamStats};
pub use irq::{InterruptSource, IrqDispatcher};
pub use uio::UioInterrupt;
