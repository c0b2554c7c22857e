//! Free-block map (component D)
//!
//! An ordered map from block size to the offset(s) of free blocks of that
//! size, built on the same cluster tree as the offset index. A size with
//! more than one free block holds a nested [`OffsetIndex`] instead of a
//! bare offset.

use crate::cluster::{Cluster, ClusterItem, NodeHost};
use crate::offset_index::OffsetIndex;

/// One leaf entry: a size paired with either a single inline offset or the
/// root of a nested offset index.
#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct MapItem {
    pub(crate) size: usize,
    pub(crate) offset: usize,
    pub(crate) single: bool,
    pub(crate) index_root: usize,
}

impl ClusterItem for MapItem {
    fn key(&self) -> usize {
        self.size
    }

    fn is_tombstone(&self) -> bool {
        self.single && self.offset == 0
    }

    fn make_tombstone(&mut self) {
        self.offset = 0;
        self.single = true;
    }
}

#[derive(Default)]
pub(crate) struct FreeMap {
    tree: Cluster<MapItem>,
}

impl FreeMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing tree by its root offset (used to reconstruct the
    /// heap-wide free-block map from its control-word root on each
    /// operation).
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

    /// The largest size currently catalogued, used for `largest_free_block`.
    pub(crate) fn largest_size<H: NodeHost>(&self, host: &H) -> Option<usize> {
        self.tree.last(host).map(|it| it.size)
    }

    fn exact<H: NodeHost>(&self, host: &H, size: usize) -> Option<MapItem> {
        self.tree.find_min_ge(host, size).filter(|it| it.size == size)
    }

    /// Publishes a free block. A size with no entry gets a `single` item;
    /// a second offset at the same size promotes it to a nested index.
    pub(crate) fn add<H: NodeHost>(&mut self, host: &mut H, size: usize, offset: usize) -> Option<()> {
        match self.exact(host, size) {
            None => {
                let item = MapItem {
                    size,
                    offset,
                    single: true,
                    index_root: 0,
                };
                self.tree.add(host, item)
            }
            Some(item) if item.single => {
                self.tree.remove_exact(host, size);
                let mut inner = OffsetIndex::new();
                if inner.add(host, item.offset).is_none() || inner.add(host, offset).is_none() {
                    self.tree.add(host, item);
                    return None;
                }
                let promoted = MapItem {
                    size,
                    offset: 0,
                    single: false,
                    index_root: inner.root(),
                };
                self.tree.add(host, promoted)
            }
            Some(item) => {
                self.tree.remove_exact(host, size);
                let mut inner = OffsetIndex::from_root(item.index_root);
                if inner.add(host, offset).is_none() {
                    self.tree.add(host, item);
                    return None;
                }
                let updated = MapItem {
                    index_root: inner.root(),
                    ..item
                };
                self.tree.add(host, updated)
            }
        }
    }

    /// Best-fit lookup: the smallest cataloged size `>= min_size`, with one
    /// of its offsets removed. Offsets within a size class are consumed
    /// from the tail of the nested index.
    pub(crate) fn get_block<H: NodeHost>(&mut self, host: &mut H, min_size: usize) -> Option<(usize, usize)> {
        let found = self.tree.find_min_ge(host, min_size)?;
        if found.single {
            self.tree.remove_exact(host, found.size);
            return Some((found.size, found.offset));
        }

        let mut inner = OffsetIndex::from_root(found.index_root);
        let popped = inner.pop_last(host)?;
        self.tree.remove_exact(host, found.size);

        let remaining = inner.len(host);
        if remaining == 1 {
            let last = inner.pop_last(host).unwrap();
            let demoted = MapItem {
                size: found.size,
                offset: last,
                single: true,
                index_root: 0,
            };
            self.tree.add(host, demoted);
        } else if remaining > 1 {
            let updated = MapItem {
                index_root: inner.root(),
                ..found
            };
            self.tree.add(host, updated);
        }

        Some((found.size, popped))
    }

    /// Removes a block by exact `(size, offset)` identity, mirroring `add`
    /// in reverse.
    pub(crate) fn remove<H: NodeHost>(&mut self, host: &mut H, size: usize, offset: usize) -> bool {
        let Some(found) = self.exact(host, size) else {
            return false;
        };

        if found.single {
            if found.offset != offset {
                return false;
            }
            self.tree.remove_exact(host, size);
            return true;
        }

        let mut inner = OffsetIndex::from_root(found.index_root);
        if inner.remove(host, offset).is_none() {
            return false;
        }
        self.tree.remove_exact(host, size);

        let remaining = inner.len(host);
        if remaining == 1 {
            let last = inner.pop_last(host).unwrap();
            let demoted = MapItem {
                size,
                offset: last,
                single: true,
                index_root: 0,
            };
            self.tree.add(host, demoted);
        } else if remaining > 1 {
            let updated = MapItem {
                index_root: inner.root(),
                ..found
            };
            self.tree.add(host, updated);
        }
        true
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

        fn alloc_node<Item: ClusterItem>(&mut self) -> Option<usize> {
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
    fn single_offset_round_trips() {
        let mut host = TestHost::new(1 << 16);
        let mut map = FreeMap::new();
        map.add(&mut host, 64, 1000).unwrap();

        assert_eq!(map.get_block(&mut host, 32), Some((64, 1000)));
        assert!(map.is_empty());
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_size() {
        let mut host = TestHost::new(1 << 16);
        let mut map = FreeMap::new();
        for (size, off) in [(32, 1), (64, 2), (128, 3)] {
            map.add(&mut host, size, off).unwrap();
        }

        assert_eq!(map.get_block(&mut host, 48), Some((64, 2)));
        assert_eq!(map.get_block(&mut host, 48), Some((128, 3)));
        assert_eq!(map.get_block(&mut host, 48), None);
    }

    #[test]
    fn same_size_collisions_share_an_entry() {
        let mut host = TestHost::new(1 << 16);
        let mut map = FreeMap::new();
        map.add(&mut host, 64, 100).unwrap();
        map.add(&mut host, 64, 200).unwrap();
        map.add(&mut host, 64, 300).unwrap();

        assert_eq!(map.get_block(&mut host, 64), Some((64, 300)));
        assert_eq!(map.get_block(&mut host, 64), Some((64, 200)));
        assert_eq!(map.get_block(&mut host, 64), Some((64, 100)));
        assert!(map.is_empty());
    }

    #[test]
    fn exact_remove_mirrors_add() {
        let mut host = TestHost::new(1 << 16);
        let mut map = FreeMap::new();
        map.add(&mut host, 64, 100).unwrap();
        map.add(&mut host, 64, 200).unwrap();

        assert!(map.remove(&mut host, 64, 100));
        assert!(!map.remove(&mut host, 64, 999));
        assert_eq!(map.get_block(&mut host, 1), Some((64, 200)));
    }

    #[test]
    fn largest_size_tracks_the_map() {
        let mut host = TestHost::new(1 << 16);
        let mut map = FreeMap::new();
        assert_eq!(map.largest_size(&host), None);
        map.add(&mut host, 64, 1).unwrap();
        map.add(&mut host, 256, 2).unwrap();
        map.add(&mut host, 128, 3).unwrap();
        assert_eq!(map.largest_size(&host), Some(256));
    }
}
