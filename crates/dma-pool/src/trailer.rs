//! Completion timestamp stored in every DMA buffer

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Bytes occupied by the timestamp (seconds word, nanoseconds word)
pub const TIMESTAMP_LEN: usize = 8;

/// Wall-clock time a buffer was completed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch (saturates at `u32::MAX`)
    pub secs: u32,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    pub const fn new(secs: u32, nanos: u32) -> Self {
        Self { secs, nanos }
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(Self::from_duration)
            .unwrap_or_default()
    }

    /// Latest representable time
    pub const MAX: Self = Self::new(u32::MAX, 999_999_999);

    /// Convert from a duration since the epoch, clamping past [`Timestamp::MAX`]
    pub fn from_duration(d: Duration) -> Self {
        match u32::try_from(d.as_secs()) {
            Ok(secs) => Self {
                secs,
                nanos: d.subsec_nanos(),
            },
            Err(_) => Self::MAX,
        }
    }

    /// Duration since the epoch
    pub fn as_duration(&self) -> Duration {
        Duration::new(self.secs as u64, self.nanos)
    }

    /// Encode as two little-endian words
    pub fn to_bytes(&self) -> [u8; TIMESTAMP_LEN] {
        let mut out = [0u8; TIMESTAMP_LEN];
        out[..4].copy_from_slice(&self.secs.to_le_bytes());
        out[4..].copy_from_slice(&self.nanos.to_le_bytes());
        out
    }
}
