//! Buffer-select cursor used by mapping clients

use register_port::Stream;
use serde::{Deserialize, Serialize};

/// Selector bit choosing the full-spectrum pool
pub const FS_SELECT: u32 = 0x8000_0000;

const INDEX_MASK: u32 = 0xFFFF;

/// Which buffer the next mapping request refers to
///
/// Encoded as a single word: [`FS_SELECT`] picks the stream, the low 16 bits
/// hold the slot index. Each successful mapping advances the index so that
/// consecutive maps walk the pool in order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSelector(u32);

impl BufferSelector {
    /// Decode a raw selector word; unused bits are dropped
    pub fn from_raw(raw: u32) -> Self {
        Self(raw & (FS_SELECT | INDEX_MASK))
    }

    /// Select a slot of a stream
    pub fn new(stream: Stream, index: u16) -> Self {
        let fs = match stream {
            Stream::Peaks => 0,
            Stream::FullSpectrum => FS_SELECT,
        };
        Self(fs | index as u32)
    }

    /// Raw selector word
    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn stream(self) -> Stream {
        if self.0 & FS_SELECT != 0 {
            Stream::FullSpectrum
        } else {
            Stream::Peaks
        }
    }

    pub fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// Move to the next slot of the same stream
    pub fn advance(&mut self) {
        let next = (self.0 & INDEX_MASK).wrapping_add(1) & INDEX_MASK;
        self.0 = (self.0 & FS_SELECT) | next;
    }
}
