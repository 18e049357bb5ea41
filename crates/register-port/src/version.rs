//! Version field decoding

use serde::{Deserialize, Serialize};
use std::fmt;

/// Packed `major << 16 | minor` version number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawVersion {
    pub major: u16,
    pub minor: u16,
}

impl RawVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Unpack a raw register/driver value
    pub const fn from_raw(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xFFFF) as u16,
        }
    }

    /// Pack back into the raw representation
    pub const fn to_raw(self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }
}

impl fmt::Display for RawVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Decode the packed 4-character HDL version register
///
/// The FPGA stores the characters low byte first while the string reads high
/// byte first, so the bytes are reversed. Always yields exactly 4 characters.
pub fn decode_hdl_version(raw: u32) -> String {
    raw.to_be_bytes().iter().map(|&b| char::from(b)).collect()
}
