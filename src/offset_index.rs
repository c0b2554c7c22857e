//! Offset index (component C)
//!
//! An ordered set of `usize` region offsets, built directly on the cluster
//! tree. Used standalone as the free-block map's size-collision index (one
//! per size class with more than one free block), and the map itself is
//! built the same way one layer up.

use crate::cluster::{Cluster, NodeHost};

#[derive(Default)]
pub(crate) struct OffsetIndex {
    tree: Cluster<usize>,
}

impl OffsetIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing tree by its root offset (used when a free-block
    /// map item's nested index is read back out of its `index_root` field).
    pub(crate) fn from_root(root: usize) -> Self {
        Self {
            tree: Cluster { root, ..Cluster::default() },
        }
    }

    pub(crate) fn root(&self) -> usize {
        self.tree.root
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub(crate) fn len<H: NodeHost>(&self, host: &H) -> usize {
        self.tree.len(host)
    }

    pub(crate) fn first<H: NodeHost>(&self, host: &H) -> Option<usize> {
        self.tree.first(host)
    }

    pub(crate) fn last<H: NodeHost>(&self, host: &H) -> Option<usize> {
        self.tree.last(host)
    }

    /// Inserts `offset`. `None` means a cluster node could not be allocated;
    /// the caller is responsible for falling back to the deferred-free
    /// cache.
    pub(crate) fn add<H: NodeHost>(&mut self, host: &mut H, offset: usize) -> Option<()> {
        self.tree.add(host, offset)
    }

    pub(crate) fn remove<H: NodeHost>(&mut self, host: &mut H, offset: usize) -> Option<usize> {
        self.tree.remove_exact(host, offset)
    }

    /// Removes and returns the largest offset in the index (the tail-pop
    /// policy used when a free-block map item degenerates from a nested
    /// index back to a single inline offset).
    pub(crate) fn pop_last<H: NodeHost>(&mut self, host: &mut H) -> Option<usize> {
        let last = self.tree.last(host)?;
        self.tree.remove_exact(host, last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterNode;

    struct TestHost {
        buf: Vec<u8>,
        bump: usize,
    }

    impl TestHost {
        fn new(size: usize) -> Self {
            Self {
                buf: vec![0u8; size],
                bump: 0,
            }
        }
    }

    impl NodeHost for TestHost {
        fn base_ptr(&self) -> *mut u8 {
            self.buf.as_ptr() as *mut u8
        }

        fn alloc_node<Item: crate::cluster::ClusterItem>(&mut self) -> Option<usize> {
            let size = crate::word::round_up(core::mem::size_of::<ClusterNode<Item>>());
            if self.bump + size > self.buf.len() {
                return None;
            }
            let off = self.bump;
            self.bump += size;
            unsafe {
                core::ptr::write(
                    self.buf.as_mut_ptr().add(off) as *mut ClusterNode<Item>,
                    ClusterNode::default(),
                );
            }
            Some(off)
        }

        fn free_node(&mut self, _offset: usize) {}
    }

    #[test]
    fn tracks_offsets_in_order() {
        let mut host = TestHost::new(1 << 16);
        let mut idx = OffsetIndex::new();

        for off in [400usize, 64, 256, 128] {
            idx.add(&mut host, off).unwrap();
        }

        assert_eq!(idx.first(&host), Some(64));
        assert_eq!(idx.last(&host), Some(400));
        assert_eq!(idx.len(&host), 4);
    }

    #[test]
    fn pop_last_removes_the_tail() {
        let mut host = TestHost::new(1 << 16);
        let mut idx = OffsetIndex::new();
        for off in [64usize, 128, 192] {
            idx.add(&mut host, off).unwrap();
        }

        assert_eq!(idx.pop_last(&mut host), Some(192));
        assert_eq!(idx.pop_last(&mut host), Some(128));
        assert_eq!(idx.pop_last(&mut host), Some(64));
        assert_eq!(idx.pop_last(&mut host), None);
        assert!(idx.is_empty());
    }

    #[test]
    fn remove_missing_offset_is_a_no_op() {
        let mut host = TestHost::new(1 << 16);
        let mut idx = OffsetIndex::new();
        idx.add(&mut host, 64).unwrap();
        assert_eq!(idx.remove(&mut host, 999), None);
        assert_eq!(idx.len(&host), 1);
    }
}
