//! Raw word access into the region.
//!
//! The allocator owns one contiguous byte buffer and addresses everything in
//! it — block headers, control fields, cluster nodes — by byte offset from
//! its base. These are the only two primitives that actually touch memory;
//! every other module builds on them instead of doing its own pointer
//! arithmetic.

use crate::word::W;
use core::ptr;

/// Reads one machine word at `offset` bytes from `base`.
///
/// # Safety
/// `base + offset` must be valid for a `W`-byte, word-aligned read for the
/// lifetime of the call.
#[inline]
pub unsafe fn read_word(base: *mut u8, offset: usize) -> usize {
    debug_assert_eq!(offset % W, 0);
    unsafe { ptr::read(base.add(offset) as *const usize) }
}

/// Writes one machine word at `offset` bytes from `base`.
///
/// # Safety
/// `base + offset` must be valid for a `W`-byte, word-aligned write for the
/// lifetime of the call.
#[inline]
pub unsafe fn write_word(base: *mut u8, offset: usize, value: usize) {
    debug_assert_eq!(offset % W, 0);
    unsafe { ptr::write(base.add(offset) as *mut usize, value) }
}
