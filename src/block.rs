//! Block header & chain (component A)
//!
//! Every block carries two identical header words — one at its first word,
//! one at its last — packing `size_in_bytes` into the high bits and a
//! `free` flag into the lowest bit. Because every block size is a multiple
//! of `W`, that lowest bit is always free for the flag. The duplicate
//! footer is the sole means of reverse traversal; it replaces a
//! doubly-linked free list.

use crate::raw::{read_word, write_word};
use crate::word::W;

/// A single header/footer word: `size_in_bytes` in the high bits, `free` in
/// the lowest bit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct BlockHeader(usize);

impl BlockHeader {
    const FREE_BIT: usize = 0x1;

    #[inline]
    pub(crate) fn new(size: usize, free: bool) -> Self {
        debug_assert_eq!(size & Self::FREE_BIT, 0, "block size must be word-aligned");
        Self(size | if free { Self::FREE_BIT } else { 0 })
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.0 & !Self::FREE_BIT
    }

    #[inline]
    pub(crate) fn is_free(&self) -> bool {
        self.0 & Self::FREE_BIT != 0
    }
}

impl From<usize> for BlockHeader {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<BlockHeader> for usize {
    fn from(value: BlockHeader) -> Self {
        value.0
    }
}

/// A block as read back from the region: its offset from `base`, its size
/// in bytes (headers included), and whether it is currently free.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct BlockInfo {
    pub offset: usize,
    pub size: usize,
    pub free: bool,
}

impl BlockInfo {
    #[inline]
    pub(crate) fn payload(&self) -> usize {
        self.offset + W
    }

    #[inline]
    pub(crate) fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// The three blocks visible from a given block: its immediate predecessor
/// and successor in the region, if any, found via the header/footer chain.
pub(crate) struct BlockChain {
    pub previous: Option<BlockInfo>,
    pub current: BlockInfo,
    pub next: Option<BlockInfo>,
}

/// Writes a block's header and footer at `offset` and returns its payload
/// offset (`offset + W`).
///
/// # Safety
/// `[offset, offset + size)` must be valid, word-aligned region bytes.
pub(crate) unsafe fn block_write(base: *mut u8, offset: usize, size: usize, free: bool) -> usize {
    debug_assert!(size >= crate::word::BLOCK_MIN);
    let header: usize = BlockHeader::new(size, free).into();
    unsafe {
        write_word(base, offset, header);
        write_word(base, offset + size - W, header);
    }
    offset + W
}

/// Recovers a block's starting offset from a payload pointer offset.
#[inline]
pub(crate) fn block_from_payload(payload_offset: usize) -> usize {
    payload_offset - W
}

/// Reads a block's header back from the region, given a payload offset.
///
/// # Safety
/// `payload_offset - W` must hold a previously-written header word.
pub(crate) unsafe fn block_read(base: *mut u8, payload_offset: usize) -> BlockInfo {
    let offset = block_from_payload(payload_offset);
    let header: BlockHeader = unsafe { read_word(base, offset) }.into();
    BlockInfo {
        offset,
        size: header.size(),
        free: header.is_free(),
    }
}

/// Reads a block's header back from the region, given the block's own
/// offset (not its payload offset).
///
/// # Safety
/// `offset` must hold a previously-written header word.
pub(crate) unsafe fn block_read_at(base: *mut u8, offset: usize) -> BlockInfo {
    let header: BlockHeader = unsafe { read_word(base, offset) }.into();
    BlockInfo {
        offset,
        size: header.size(),
        free: header.is_free(),
    }
}

/// Builds the previous/current/next chain around the block at
/// `payload_offset`.
///
/// `region_start` is the offset of the first possible block (just past the
/// control structure); `region_used` is the current bump frontier — blocks
/// never extend past it.
///
/// # Safety
/// `payload_offset` must address a live block header/footer pair, and
/// `region_start`/`region_used` must describe a consistent, tiled region.
pub(crate) unsafe fn block_chain(
    base: *mut u8,
    payload_offset: usize,
    region_start: usize,
    region_used: usize,
) -> BlockChain {
    let current = unsafe { block_read(base, payload_offset) };

    let previous = if current.offset > region_start {
        // The footer of the previous block lies one word below our header.
        let prev_footer_offset = current.offset - W;
        let prev_header: BlockHeader = unsafe { read_word(base, prev_footer_offset) }.into();
        let prev_size = prev_header.size();
        let prev_offset = current.offset - prev_size;
        Some(BlockInfo {
            offset: prev_offset,
            size: prev_size,
            free: prev_header.is_free(),
        })
    } else {
        None
    };

    let next = if current.end() < region_used {
        Some(unsafe { block_read_at(base, current.end()) })
    } else {
        None
    };

    BlockChain {
        previous,
        current,
        next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(len: usize) -> Vec<u8> {
        vec![0u8; len]
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = buffer(256);
        let base = buf.as_mut_ptr();
        let payload = unsafe { block_write(base, 16, 64, true) };
        assert_eq!(payload, 16 + W);

        let info = unsafe { block_read(base, payload) };
        assert_eq!(info.offset, 16);
        assert_eq!(info.size, 64);
        assert!(info.free);
    }

    #[test]
    fn header_equals_footer() {
        let mut buf = buffer(256);
        let base = buf.as_mut_ptr();
        unsafe { block_write(base, 0, 32, false) };

        let header = unsafe { read_word(base, 0) };
        let footer = unsafe { read_word(base, 32 - W) };
        assert_eq!(header, footer);
    }

    #[test]
    fn chain_finds_both_neighbours() {
        let mut buf = buffer(256);
        let base = buf.as_mut_ptr();

        // Three adjacent blocks of 32 bytes each, starting at offset 0.
        unsafe {
            block_write(base, 0, 32, true);
            block_write(base, 32, 32, false);
            block_write(base, 64, 32, true);
        }

        let chain = unsafe { block_chain(base, 32 + W, 0, 96) };
        assert!(chain.previous.is_some());
        assert_eq!(chain.previous.unwrap().offset, 0);
        assert!(chain.previous.unwrap().free);

        assert_eq!(chain.current.offset, 32);
        assert!(!chain.current.free);

        assert!(chain.next.is_some());
        assert_eq!(chain.next.unwrap().offset, 64);
        assert!(chain.next.unwrap().free);
    }

    #[test]
    fn chain_at_boundaries_has_no_neighbours() {
        let mut buf = buffer(256);
        let base = buf.as_mut_ptr();
        unsafe { block_write(base, 0, 32, false) };

        let chain = unsafe { block_chain(base, W, 0, 32) };
        assert!(chain.previous.is_none());
        assert!(chain.next.is_none());
    }
}
