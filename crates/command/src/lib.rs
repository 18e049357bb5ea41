//! SM500 Command Surface
//!
//! Every operation a control application can request, in three encodings:
//! - [`Command`] / [`Response`]: typed values, dispatched against an open device
//! - [`ioctl`]: the legacy Linux request codes and argument layout
//! - [`encode`] / [`decode`]: postcard frames for message transports

mod codec;
mod command;
mod dispatch;
mod error;
pub mod ioctl;

pub use codec::{command_frame, decode, encode, Reply};
pub use command::{Command, Response};
pub use dispatch::{dispatch, handle_frame};
pub use error::CommandError;
