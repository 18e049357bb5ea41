//! Power-of-two cursor arithmetic

/// Next slot after `ptr` in a ring of `mask + 1` slots
#[inline]
pub fn advance(ptr: usize, mask: usize) -> usize {
    (ptr + 1) & mask
}

/// Completed slots not yet read
///
/// `read == write` is "nothing new"; a ring that was lapped exactly reports 0.
#[inline]
pub fn pending(read: usize, write: usize, mask: usize) -> usize {
    write.wrapping_sub(read) & mask
}

/// Slot the producer must reach after the data set with `serial` completed
#[inline]
pub fn target_slot(serial: u32, mask: usize) -> usize {
    (serial.wrapping_add(1) as usize) & mask
}
