//! Allocator façade (component E)
//!
//! Owns the region and glues the block layer (`block`), the free-block map
//! (`free_map`), and the deferred-free cache together. `Heap` itself is just
//! a base pointer — every other piece of allocator state (`free`, `used`,
//! `size`, the deferred-free-cache head, the free-map root) lives in the
//! region's control words so that the self-referential tree machinery in
//! `cluster` can read and mutate it through the same `NodeHost` it uses for
//! node storage.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::block::{block_chain, block_from_payload, block_read, block_read_at, block_write, BlockInfo};
use crate::cluster::{ClusterItem, ClusterNode, NodeHost};
use crate::free_map::FreeMap;
use crate::raw::{read_word, write_word};
use crate::word::{round_down, round_up, BLOCK_MIN, W};

/// A fixed-region, bounded-time allocator. Carved from a single contiguous
/// byte range supplied by the host at [`Heap::create`]; everything this
/// struct needs beyond that base pointer is control state living inside the
/// region itself.
pub struct Heap {
    base: *mut u8,
}

impl Heap {
    const CTRL_FREE: usize = 0;
    const CTRL_USED: usize = W;
    const CTRL_SIZE: usize = 2 * W;
    const CTRL_DEFERRED: usize = 3 * W;
    const CTRL_MAP_ROOT: usize = 4 * W;

    /// Size in bytes of the control structure at the front of the region:
    /// `free`, `used`, `size`, `deferred_free_head`, `map_root`.
    pub const CONTROL_BYTES: usize = 5 * W;

    /// Carves an allocator out of `[base, base + size)`. `base` is rounded up
    /// and `size` down to word alignment; `None` if the aligned region
    /// doesn't leave room for the control structure.
    ///
    /// # Safety
    /// `[base, base + size)` must be valid for reads and writes for as long
    /// as the returned `Heap` (and any pointer it hands out) is in use, and
    /// must not overlap any other live allocation.
    pub unsafe fn create(base: *mut u8, size: usize) -> Option<Heap> {
        let addr = base as usize;
        let adjust = round_up(addr) - addr;
        if adjust > size {
            return None;
        }
        let aligned_size = round_down(size - adjust);
        if aligned_size <= Self::CONTROL_BYTES {
            return None;
        }

        let heap = Heap {
            base: unsafe { base.add(adjust) },
        };
        unsafe {
            write_word(heap.base, Self::CTRL_FREE, 0);
            write_word(heap.base, Self::CTRL_USED, Self::CONTROL_BYTES);
            write_word(heap.base, Self::CTRL_SIZE, aligned_size);
            write_word(heap.base, Self::CTRL_DEFERRED, 0);
            write_word(heap.base, Self::CTRL_MAP_ROOT, 0);
        }
        Some(heap)
    }

    fn free_bytes_ctrl(&self) -> usize {
        unsafe { read_word(self.base, Self::CTRL_FREE) }
    }

    fn set_free_bytes_ctrl(&mut self, v: usize) {
        unsafe { write_word(self.base, Self::CTRL_FREE, v) }
    }

    fn used(&self) -> usize {
        unsafe { read_word(self.base, Self::CTRL_USED) }
    }

    fn set_used(&mut self, v: usize) {
        unsafe { write_word(self.base, Self::CTRL_USED, v) }
    }

    fn size(&self) -> usize {
        unsafe { read_word(self.base, Self::CTRL_SIZE) }
    }

    fn deferred_head(&self) -> usize {
        unsafe { read_word(self.base, Self::CTRL_DEFERRED) }
    }

    fn set_deferred_head(&mut self, v: usize) {
        unsafe { write_word(self.base, Self::CTRL_DEFERRED, v) }
    }

    fn map_root(&self) -> usize {
        unsafe { read_word(self.base, Self::CTRL_MAP_ROOT) }
    }

    fn set_map_root(&mut self, v: usize) {
        unsafe { write_word(self.base, Self::CTRL_MAP_ROOT, v) }
    }

    /// Bytes available to a caller right now: cataloged free blocks plus
    /// untouched reserve past the bump frontier.
    pub fn bytes_free(&self) -> usize {
        self.free_bytes_ctrl() + (self.size() - self.used())
    }

    /// Size of the largest block a caller could get in one `alloc` call
    /// without anything being freed first: either the untouched reserve or
    /// the largest size currently cataloged in the free-block map, whichever
    /// is bigger.
    pub fn largest_free_block(&self) -> usize {
        let tail_slack = self.size() - self.used();
        let map = FreeMap::from_root(self.map_root());
        tail_slack.max(map.largest_size(self).unwrap_or(0))
    }

    fn map_add(&mut self, size: usize, offset: usize) -> Option<()> {
        let mut map = FreeMap::from_root(self.map_root());
        let result = map.add(self, size, offset);
        self.set_map_root(map.root());
        if result.is_some() {
            self.set_free_bytes_ctrl(self.free_bytes_ctrl() + size);
        }
        result
    }

    fn map_remove_exact(&mut self, size: usize, offset: usize) {
        let mut map = FreeMap::from_root(self.map_root());
        let removed = map.remove(self, size, offset);
        self.set_map_root(map.root());
        debug_assert!(removed, "coalesced neighbour must have been cataloged");
        if removed {
            self.set_free_bytes_ctrl(self.free_bytes_ctrl() - size);
        }
    }

    fn map_get_best_fit(&mut self, need: usize) -> Option<(usize, usize)> {
        let mut map = FreeMap::from_root(self.map_root());
        let got = map.get_block(self, need);
        self.set_map_root(map.root());
        if let Some((size, _)) = got {
            self.set_free_bytes_ctrl(self.free_bytes_ctrl() - size);
        }
        got
    }

    /// Writes a carved-out, in-use block at `block_off`. If what's left over
    /// after `need` bytes is at least `BLOCK_MIN`, it's split off and pushed
    /// onto the deferred-free cache rather than published back to the map
    /// synchronously.
    fn carve(&mut self, size_found: usize, block_off: usize, need: usize) -> usize {
        if size_found - need >= BLOCK_MIN {
            let payload = unsafe { block_write(self.base, block_off, need, false) };
            self.push_deferred(block_off + need, size_found - need);
            payload
        } else {
            unsafe { block_write(self.base, block_off, size_found, false) }
        }
    }

    fn map_alloc(&mut self, need: usize) -> Option<usize> {
        let (size, off) = self.map_get_best_fit(need)?;
        Some(self.carve(size, off, need))
    }

    fn foot_alloc(&mut self, need: usize) -> Option<usize> {
        let used = self.used();
        if used + need > self.size() {
            return None;
        }
        let payload = unsafe { block_write(self.base, used, need, false) };
        self.set_used(used + need);
        Some(payload)
    }

    /// Pushes the block at `block_off` (size `size`) onto the deferred-free
    /// cache. Written as not-free so a subsequent `free()` of a neighbour
    /// won't mistake it for a cataloged free block and merge into memory
    /// that the cache still owns.
    fn push_deferred(&mut self, block_off: usize, size: usize) {
        let payload = unsafe { block_write(self.base, block_off, size, false) };
        let old_head = self.deferred_head();
        unsafe { write_word(self.base, payload, old_head) };
        self.set_deferred_head(payload);
    }

    fn pop_deferred_if_fits(&mut self, need: usize) -> Option<usize> {
        let head = self.deferred_head();
        if head == 0 {
            return None;
        }
        let info = unsafe { block_read(self.base, head) };
        if info.size < need {
            return None;
        }
        let next = unsafe { read_word(self.base, head) };
        self.set_deferred_head(next);
        Some(self.carve(info.size, info.offset, need))
    }

    /// Internal-node allocation path used by the cluster-tree machinery
    /// (through [`NodeHost::alloc_node`]). Never calls `map_add` and never
    /// splits a recovered block back into the map — only the deferred-free
    /// cache and the bump frontier feed it, which keeps it from recursing
    /// back into an already-locked map mutation.
    fn heap_alloc_internal(&mut self, need: usize) -> Option<usize> {
        let need = round_up(need).max(BLOCK_MIN);
        if let Some(p) = self.pop_deferred_if_fits(need) {
            return Some(p);
        }
        if let Some(p) = self.map_alloc(need) {
            return Some(p);
        }
        self.foot_alloc(need)
    }

    /// Migrates at most one deferred-free-cache entry into the free-block
    /// map. If no internal node is available to catalog it, the block is
    /// pushed back onto the cache rather than lost.
    fn drain_one_deferred_into_map(&mut self) {
        let head = self.deferred_head();
        if head == 0 {
            return;
        }
        let info = unsafe { block_read(self.base, head) };
        let next = unsafe { read_word(self.base, head) };
        self.set_deferred_head(next);

        unsafe { block_write(self.base, info.offset, info.size, true) };
        if self.map_add(info.size, info.offset).is_none() {
            unsafe { block_write(self.base, info.offset, info.size, false) };
            self.push_deferred(info.offset, info.size);
        }
    }

    /// Allocates `n` bytes. Returns `None` on out-of-memory; the region is
    /// left unchanged.
    pub fn alloc(&mut self, n: usize) -> Option<NonNull<u8>> {
        debug_assert!(n > 0, "alloc size must be non-zero");
        let need = (round_up(n) + 2 * W).max(BLOCK_MIN);

        if let Some(payload) = self.map_alloc(need) {
            self.drain_one_deferred_into_map();
            return NonNull::new(unsafe { self.base.add(payload) });
        }
        if let Some(payload) = self.foot_alloc(need) {
            return NonNull::new(unsafe { self.base.add(payload) });
        }
        None
    }

    fn free_at(&mut self, payload_offset: usize) {
        let region_start = Self::CONTROL_BYTES;
        let region_used = self.used();
        let chain = unsafe { block_chain(self.base, payload_offset, region_start, region_used) };
        let mut cur: BlockInfo = chain.current;

        if let Some(prev) = chain.previous {
            if prev.free {
                self.map_remove_exact(prev.size, prev.offset);
                cur = BlockInfo {
                    offset: prev.offset,
                    size: prev.size + cur.size,
                    free: false,
                };
            }
        }

        if chain.next.is_none() {
            // The merged block abuts the bump frontier: reclaim it by
            // shrinking `used` rather than publishing it to the map.
            self.set_used(cur.offset);
            return;
        }

        let next = chain.next.unwrap();
        if next.free {
            self.map_remove_exact(next.size, next.offset);
            cur = BlockInfo {
                offset: cur.offset,
                size: cur.size + next.size,
                free: false,
            };
        }

        unsafe { block_write(self.base, cur.offset, cur.size, true) };
        if self.map_add(cur.size, cur.offset).is_none() {
            unsafe { block_write(self.base, cur.offset, cur.size, false) };
            self.push_deferred(cur.offset, cur.size);
        }
        self.drain_one_deferred_into_map();
    }

    /// Frees a block previously returned by `alloc`. `None` is a no-op.
    ///
    /// # Safety
    /// `p`, if present, must be a pointer this `Heap` handed out from
    /// `alloc` and not already freed.
    pub unsafe fn free(&mut self, p: Option<NonNull<u8>>) {
        let Some(p) = p else { return };
        let payload_offset = (p.as_ptr() as usize) - (self.base as usize);
        self.free_at(payload_offset);
    }
}

impl NodeHost for Heap {
    fn base_ptr(&self) -> *mut u8 {
        self.base
    }

    fn alloc_node<Item: ClusterItem>(&mut self) -> Option<usize> {
        let need = round_up(size_of::<ClusterNode<Item>>()) + 2 * W;
        self.heap_alloc_internal(need)
    }

    fn free_node(&mut self, offset: usize) {
        let block_off = block_from_payload(offset);
        let info = unsafe { block_read_at(self.base, block_off) };
        self.push_deferred(info.offset, info.size);
    }
}
