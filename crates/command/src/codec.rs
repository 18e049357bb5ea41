//! Postcard framing

use crate::command::{Command, Response};
use crate::error::CommandError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// What a transport sends back for one command frame
pub type Reply = Result<Response, String>;

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CommandError> {
    Ok(postcard::to_allocvec(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CommandError> {
    Ok(postcard::from_bytes(bytes)?)
}

/// Encode a command ready for the wire
pub fn command_frame(command: &Command) -> Result<Vec<u8>, CommandError> {
    encode(command)
}
