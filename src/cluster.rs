//! Cluster tree (component B)
//!
//! Shared infrastructure for the offset index and the free-block map: an
//! ordered, fan-out-`FANOUT` tree whose nodes are themselves carved out of
//! the region it helps manage. Node allocation and deallocation are
//! delegated to a [`NodeHost`] (implemented by the allocator façade in
//! `heap.rs`), which is also where the reentrancy the self-hosted design
//! creates is ultimately resolved.

use crate::word::FANOUT;
use static_assertions::const_assert;

const_assert!(FANOUT <= 15); // child_count must fit in ClusterMeta's 4 bits

/// Packed per-node header: `level` (0 = leaf), `child_count`, `dirty`,
/// `locked`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub(crate) struct ClusterMeta(usize);

impl ClusterMeta {
    const LEVEL_MASK: usize = 0xF;
    const COUNT_SHIFT: usize = 4;
    const COUNT_MASK: usize = 0xF << Self::COUNT_SHIFT;
    const DIRTY_BIT: usize = 1 << 8;
    const LOCKED_BIT: usize = 1 << 9;

    fn new(level: u8, child_count: u8) -> Self {
        Self((level as usize & Self::LEVEL_MASK) | ((child_count as usize) << Self::COUNT_SHIFT))
    }

    pub(crate) fn level(&self) -> u8 {
        (self.0 & Self::LEVEL_MASK) as u8
    }

    fn set_level(&mut self, level: u8) {
        self.0 = (self.0 & !Self::LEVEL_MASK) | (level as usize & Self::LEVEL_MASK);
    }

    pub(crate) fn child_count(&self) -> u8 {
        ((self.0 & Self::COUNT_MASK) >> Self::COUNT_SHIFT) as u8
    }

    fn set_child_count(&mut self, count: u8) {
        self.0 = (self.0 & !Self::COUNT_MASK) | ((count as usize) << Self::COUNT_SHIFT);
    }

    pub(crate) fn dirty(&self) -> bool {
        self.0 & Self::DIRTY_BIT != 0
    }

    fn set_dirty(&mut self, value: bool) {
        if value {
            self.0 |= Self::DIRTY_BIT;
        } else {
            self.0 &= !Self::DIRTY_BIT;
        }
    }

    pub(crate) fn locked(&self) -> bool {
        self.0 & Self::LOCKED_BIT != 0
    }

    fn set_locked(&mut self, value: bool) {
        if value {
            self.0 |= Self::LOCKED_BIT;
        } else {
            self.0 &= !Self::LOCKED_BIT;
        }
    }
}

/// A payload a cluster tree can store. `key` drives ordering; a tombstoned
/// item is logically absent but physically still occupies its slot until
/// `cleanup` runs.
pub(crate) trait ClusterItem: Copy + Default {
    fn key(&self) -> usize;
    fn is_tombstone(&self) -> bool;
    fn make_tombstone(&mut self);
}

impl ClusterItem for usize {
    fn key(&self) -> usize {
        *self
    }

    fn is_tombstone(&self) -> bool {
        *self == usize::MAX
    }

    fn make_tombstone(&mut self) {
        *self = usize::MAX;
    }
}

/// One node of a cluster tree: a leaf holding up to `FANOUT` items, or an
/// internal node holding up to `FANOUT` child offsets plus cached
/// first/last keys and total subtree item count.
///
/// The same layout is reused for both roles: `items` is only meaningful
/// when `meta.level() == 0`, `children` only when `meta.level() > 0`.
#[repr(C)]
pub(crate) struct ClusterNode<Item: ClusterItem> {
    pub(crate) meta: ClusterMeta,
    pub(crate) first: usize,
    pub(crate) last: usize,
    pub(crate) item_count: usize,
    pub(crate) children: [usize; FANOUT],
    pub(crate) items: [Item; FANOUT],
}

impl<Item: ClusterItem> Default for ClusterNode<Item> {
    fn default() -> Self {
        Self {
            meta: ClusterMeta::default(),
            first: 0,
            last: 0,
            item_count: 0,
            children: [0; FANOUT],
            items: [Item::default(); FANOUT],
        }
    }
}

/// Back-end a [`Cluster`] carves its nodes from. Implemented once, by the
/// allocator façade, and shared by every cluster tree the façade owns (the
/// offset index, the free-block map, and every map item's nested offset
/// index).
pub(crate) trait NodeHost {
    fn base_ptr(&self) -> *mut u8;
    /// Carves a zeroed, word-sized-appropriate block for one
    /// `ClusterNode<Item>` out of the region and returns its offset.
    /// `None` means out of memory.
    fn alloc_node<Item: ClusterItem>(&mut self) -> Option<usize>;
    /// Returns a node's backing block to the deferred-free cache. Never
    /// re-enters the free-block map directly.
    fn free_node(&mut self, offset: usize);
}

#[inline]
unsafe fn node_ref<'a, Item: ClusterItem, H: NodeHost>(host: &H, offset: usize) -> &'a ClusterNode<Item> {
    unsafe { &*(host.base_ptr().add(offset) as *const ClusterNode<Item>) }
}

#[inline]
unsafe fn node_mut<'a, Item: ClusterItem, H: NodeHost>(
    host: &mut H,
    offset: usize,
) -> &'a mut ClusterNode<Item> {
    unsafe { &mut *(host.base_ptr().add(offset) as *mut ClusterNode<Item>) }
}

fn level_of<Item: ClusterItem, H: NodeHost>(host: &H, off: usize) -> u8 {
    unsafe { node_ref::<Item, H>(host, off) }.meta.level()
}

fn count_of<Item: ClusterItem, H: NodeHost>(host: &H, off: usize) -> u8 {
    unsafe { node_ref::<Item, H>(host, off) }.meta.child_count()
}

fn locked_of<Item: ClusterItem, H: NodeHost>(host: &H, off: usize) -> bool {
    unsafe { node_ref::<Item, H>(host, off) }.meta.locked()
}

fn dirty_of<Item: ClusterItem, H: NodeHost>(host: &H, off: usize) -> bool {
    unsafe { node_ref::<Item, H>(host, off) }.meta.dirty()
}

fn set_locked<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize, value: bool) {
    unsafe { node_mut::<Item, H>(host, off) }.meta.set_locked(value);
}

fn set_dirty<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize, value: bool) {
    unsafe { node_mut::<Item, H>(host, off) }.meta.set_dirty(value);
}

fn first_key_of<Item: ClusterItem, H: NodeHost>(host: &H, off: usize) -> usize {
    unsafe { node_ref::<Item, H>(host, off) }.first
}

fn nth_child<Item: ClusterItem, H: NodeHost>(host: &H, off: usize, idx: usize) -> usize {
    unsafe { node_ref::<Item, H>(host, off) }.children[idx]
}

/// Moves the element at `idx` out, shifting the tail left by one. Returns
/// the new count.
fn compact_remove_at<T: Copy + Default>(arr: &mut [T], count: u8, idx: usize) -> u8 {
    let c = count as usize;
    for i in idx..c - 1 {
        arr[i] = arr[i + 1];
    }
    arr[c - 1] = T::default();
    count - 1
}

/// Inserts `value` into the first `count` slots of `arr`, keeping it sorted
/// by `key_of`. Returns the new count.
fn insert_sorted<T: Copy, K: Fn(&T) -> usize>(arr: &mut [T], count: u8, value: T, key_of: K) -> u8 {
    let c = count as usize;
    let mut pos = c;
    for i in 0..c {
        if key_of(&value) < key_of(&arr[i]) {
            pos = i;
            break;
        }
    }
    for i in (pos..c).rev() {
        arr[i + 1] = arr[i];
    }
    arr[pos] = value;
    count + 1
}

/// Splits the upper half of `src`'s first `src_count` slots into `dst`.
/// Returns `(new_src_count, new_dst_count)`.
fn split_half<T: Copy + Default>(src: &mut [T], src_count: u8, dst: &mut [T]) -> (u8, u8) {
    let total = src_count as usize;
    let keep = total / 2;
    let moved = total - keep;
    for i in 0..moved {
        dst[i] = src[keep + i];
        src[keep + i] = T::default();
    }
    (keep as u8, moved as u8)
}

/// Appends `src`'s first `src_count` slots onto `dst`'s first `dst_count`.
/// Returns the new `dst_count`.
fn append_all<T: Copy>(dst: &mut [T], dst_count: u8, src: &[T], src_count: u8) -> u8 {
    for i in 0..src_count as usize {
        dst[dst_count as usize + i] = src[i];
    }
    dst_count + src_count
}

/// Moves the smallest slot of `src` onto the end of `dst`.
fn shift_one_left<T: Copy + Default>(src: &mut [T], src_count: u8, dst: &mut [T], dst_count: u8) -> (u8, u8) {
    dst[dst_count as usize] = src[0];
    let new_src = compact_remove_at(src, src_count, 0);
    (new_src, dst_count + 1)
}

/// Moves the largest slot of `src` onto the front of `dst`.
fn shift_one_right<T: Copy + Default>(src: &mut [T], src_count: u8, dst: &mut [T], dst_count: u8) -> (u8, u8) {
    let moved = src[src_count as usize - 1];
    for i in (0..dst_count as usize).rev() {
        dst[i + 1] = dst[i];
    }
    dst[0] = moved;
    src[src_count as usize - 1] = T::default();
    (src_count - 1, dst_count + 1)
}

fn recompute_leaf_bounds<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize) {
    let node = unsafe { node_mut::<Item, H>(host, off) };
    let count = node.meta.child_count() as usize;
    if count == 0 {
        node.first = 0;
        node.last = 0;
        node.item_count = 0;
        return;
    }
    node.first = node.items[0].key();
    node.last = node.items[count - 1].key();
    node.item_count = count;
}

fn recompute_internal_bounds<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize) {
    let count = count_of::<Item, H>(host, off) as usize;
    let mut first = None;
    let mut last = 0usize;
    let mut total = 0usize;
    for i in 0..count {
        let c = nth_child::<Item, H>(host, off, i);
        let child = unsafe { node_ref::<Item, H>(host, c) };
        if child.meta.child_count() == 0 {
            continue; // empty subtree, ignored per invariant 8
        }
        if first.is_none() {
            first = Some(child.first);
        }
        last = child.last;
        total += child.item_count;
    }
    let node = unsafe { node_mut::<Item, H>(host, off) };
    node.first = first.unwrap_or(0);
    node.last = last;
    node.item_count = total;
}

fn recompute_bounds<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize) {
    if level_of::<Item, H>(host, off) == 0 {
        recompute_leaf_bounds::<Item, H>(host, off);
    } else {
        recompute_internal_bounds::<Item, H>(host, off);
    }
}

fn insert_item_sorted<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize, item: Item) {
    let node = unsafe { node_mut::<Item, H>(host, off) };
    let count = node.meta.child_count();
    let new_count = insert_sorted(&mut node.items, count, item, |it| it.key());
    node.meta.set_child_count(new_count);
    recompute_leaf_bounds::<Item, H>(host, off);
}

fn insert_child_sorted<Item: ClusterItem, H: NodeHost>(
    host: &mut H,
    off: usize,
    child_off: usize,
    child_first: usize,
) {
    // Children are sorted by their own cached `first`; resolve those
    // through the host before touching the array so positions stay stable
    // while comparing.
    let count = count_of::<Item, H>(host, off) as usize;
    let mut firsts = [0usize; FANOUT];
    for i in 0..count {
        let c = nth_child::<Item, H>(host, off, i);
        firsts[i] = first_key_of::<Item, H>(host, c);
    }

    let mut pos = count;
    for (i, &f) in firsts.iter().enumerate().take(count) {
        if child_first < f {
            pos = i;
            break;
        }
    }

    let node = unsafe { node_mut::<Item, H>(host, off) };
    for i in (pos..count).rev() {
        node.children[i + 1] = node.children[i];
    }
    node.children[pos] = child_off;
    node.meta.set_child_count(count as u8 + 1);
    recompute_internal_bounds::<Item, H>(host, off);
}

fn choose_child_index<Item: ClusterItem, H: NodeHost>(host: &H, off: usize, key: usize) -> usize {
    let node = unsafe { node_ref::<Item, H>(host, off) };
    let count = node.meta.child_count() as usize;
    for i in 0..count {
        let c = node.children[i];
        let child = unsafe { node_ref::<Item, H>(host, c) };
        if child.meta.child_count() == 0 {
            continue;
        }
        if key <= child.last {
            return i;
        }
    }
    count.saturating_sub(1)
}

fn find_item_index<Item: ClusterItem, H: NodeHost>(host: &H, off: usize, key: usize) -> Option<usize> {
    let node = unsafe { node_ref::<Item, H>(host, off) };
    let count = node.meta.child_count() as usize;
    (0..count).find(|&i| !node.items[i].is_tombstone() && node.items[i].key() == key)
}

/// What an `add` at one level hands back to its parent.
enum AddOutcome {
    Done,
    NewSibling { offset: usize, first_key: usize },
}

enum NewSlot<Item> {
    LeafItem(Item),
    Child { offset: usize, first_key: usize },
}

/// Makes room in `off` for one more slot (shift with a sibling, or split),
/// then inserts it. `parent_off`/`my_index` locate `off` among its
/// siblings; both are `None`/unused when `off` is the root.
fn make_room_and_insert<Item: ClusterItem, H: NodeHost>(
    host: &mut H,
    off: usize,
    parent_off: Option<usize>,
    my_index: usize,
    slot: NewSlot<Item>,
) -> Result<AddOutcome, ()> {
    let count = count_of::<Item, H>(host, off);

    if (count as usize) < FANOUT {
        match slot {
            NewSlot::LeafItem(it) => insert_item_sorted::<Item, H>(host, off, it),
            NewSlot::Child { offset, first_key } => {
                insert_child_sorted::<Item, H>(host, off, offset, first_key)
            }
        }
        return Ok(AddOutcome::Done);
    }

    if let Some(p_off) = parent_off {
        let parent_count = count_of::<Item, H>(host, p_off) as usize;

        if let Some(roomy_index) = find_roomy_sibling::<Item, H>(host, p_off, my_index, parent_count) {
            rotate_toward_target::<Item, H>(host, p_off, roomy_index, my_index);
            match slot {
                NewSlot::LeafItem(it) => insert_item_sorted::<Item, H>(host, off, it),
                NewSlot::Child { offset, first_key } => {
                    insert_child_sorted::<Item, H>(host, off, offset, first_key)
                }
            }
            recompute_internal_bounds::<Item, H>(host, p_off);
            return Ok(AddOutcome::Done);
        }
    }

    // Split: allocate a same-level sibling and divide this node's contents.
    let new_off = match host.alloc_node::<Item>() {
        None => return Err(()),
        Some(o) => o,
    };
    let level = level_of::<Item, H>(host, off);
    unsafe { node_mut::<Item, H>(host, new_off) }.meta = ClusterMeta::new(level, 0);

    if level == 0 {
        let a = unsafe { node_mut::<Item, H>(host, off) };
        let src_count = a.meta.child_count();
        let mut dst_items = [Item::default(); FANOUT];
        let (new_src, new_dst) = split_half(&mut a.items, src_count, &mut dst_items);
        a.meta.set_child_count(new_src);
        let b = unsafe { node_mut::<Item, H>(host, new_off) };
        b.items = dst_items;
        b.meta.set_child_count(new_dst);
    } else {
        let a = unsafe { node_mut::<Item, H>(host, off) };
        let src_count = a.meta.child_count();
        let mut dst_children = [0usize; FANOUT];
        let (new_src, new_dst) = split_half(&mut a.children, src_count, &mut dst_children);
        a.meta.set_child_count(new_src);
        let b = unsafe { node_mut::<Item, H>(host, new_off) };
        b.children = dst_children;
        b.meta.set_child_count(new_dst);
    }
    recompute_bounds::<Item, H>(host, off);
    recompute_bounds::<Item, H>(host, new_off);

    let new_off_first = first_key_of::<Item, H>(host, new_off);
    match slot {
        NewSlot::LeafItem(it) => {
            if it.key() < new_off_first {
                insert_item_sorted::<Item, H>(host, off, it);
            } else {
                insert_item_sorted::<Item, H>(host, new_off, it);
            }
        }
        NewSlot::Child { offset, first_key } => {
            if first_key < new_off_first {
                insert_child_sorted::<Item, H>(host, off, offset, first_key);
            } else {
                insert_child_sorted::<Item, H>(host, new_off, offset, first_key);
            }
        }
    }

    Ok(AddOutcome::NewSibling {
        offset: new_off,
        first_key: first_key_of::<Item, H>(host, new_off),
    })
}

/// Moves one slot between adjacent siblings `left`/`right` so that the
/// fuller one (`full_is_left`) gives up its boundary slot to the other.
fn shift_with_sibling<Item: ClusterItem, H: NodeHost>(
    host: &mut H,
    left: usize,
    right: usize,
    full_is_left: bool,
) {
    let level = level_of::<Item, H>(host, left);
    if full_is_left {
        // `left` is full; move its largest slot onto the front of `right`.
        if level == 0 {
            let a = unsafe { node_mut::<Item, H>(host, left) };
            let ac = a.meta.child_count();
            let mut items_b = unsafe { node_ref::<Item, H>(host, right) }.items;
            let bc = unsafe { node_ref::<Item, H>(host, right) }.meta.child_count();
            let (na, nb) = shift_one_right(&mut a.items, ac, &mut items_b, bc);
            a.meta.set_child_count(na);
            let b = unsafe { node_mut::<Item, H>(host, right) };
            b.items = items_b;
            b.meta.set_child_count(nb);
        } else {
            let a = unsafe { node_mut::<Item, H>(host, left) };
            let ac = a.meta.child_count();
            let mut children_b = unsafe { node_ref::<Item, H>(host, right) }.children;
            let bc = unsafe { node_ref::<Item, H>(host, right) }.meta.child_count();
            let (na, nb) = shift_one_right(&mut a.children, ac, &mut children_b, bc);
            a.meta.set_child_count(na);
            let b = unsafe { node_mut::<Item, H>(host, right) };
            b.children = children_b;
            b.meta.set_child_count(nb);
        }
    } else {
        // `right` is full; move its smallest slot onto the end of `left`.
        if level == 0 {
            let b = unsafe { node_mut::<Item, H>(host, right) };
            let bc = b.meta.child_count();
            let mut items_a = unsafe { node_ref::<Item, H>(host, left) }.items;
            let ac = unsafe { node_ref::<Item, H>(host, left) }.meta.child_count();
            let (nb, na) = shift_one_left(&mut b.items, bc, &mut items_a, ac);
            b.meta.set_child_count(nb);
            let a = unsafe { node_mut::<Item, H>(host, left) };
            a.items = items_a;
            a.meta.set_child_count(na);
        } else {
            let b = unsafe { node_mut::<Item, H>(host, right) };
            let bc = b.meta.child_count();
            let mut children_a = unsafe { node_ref::<Item, H>(host, left) }.children;
            let ac = unsafe { node_ref::<Item, H>(host, left) }.meta.child_count();
            let (nb, na) = shift_one_left(&mut b.children, bc, &mut children_a, ac);
            b.meta.set_child_count(nb);
            let a = unsafe { node_mut::<Item, H>(host, left) };
            a.children = children_a;
            a.meta.set_child_count(na);
        }
    }
}

/// Walks outward from `my_index` in both directions at once, one hop per
/// step, and returns the index of the nearest sibling under `parent_off`
/// with spare capacity (count < FANOUT). `None` iff every sibling is full.
fn find_roomy_sibling<Item: ClusterItem, H: NodeHost>(
    host: &H,
    parent_off: usize,
    my_index: usize,
    parent_count: usize,
) -> Option<usize> {
    let mut left = my_index;
    let mut right = my_index;
    loop {
        let can_left = left > 0;
        let can_right = right + 1 < parent_count;
        if !can_left && !can_right {
            return None;
        }
        if can_left {
            left -= 1;
            let c = nth_child::<Item, H>(host, parent_off, left);
            if count_of::<Item, H>(host, c) < FANOUT as u8 {
                return Some(left);
            }
        }
        if can_right {
            right += 1;
            let c = nth_child::<Item, H>(host, parent_off, right);
            if count_of::<Item, H>(host, c) < FANOUT as u8 {
                return Some(right);
            }
        }
    }
}

/// Rotates one slot through every full sibling between `roomy_index` and
/// `target_index`, leaving `target_index` with one spare slot. Each hop
/// moves a single boundary item from the side nearer the target into the
/// side nearer the room, so no intervening node is ever asked to hold more
/// than `FANOUT` items at once.
fn rotate_toward_target<Item: ClusterItem, H: NodeHost>(
    host: &mut H,
    parent_off: usize,
    roomy_index: usize,
    target_index: usize,
) {
    if roomy_index < target_index {
        for idx in (roomy_index + 1)..=target_index {
            let left = nth_child::<Item, H>(host, parent_off, idx - 1);
            let right = nth_child::<Item, H>(host, parent_off, idx);
            shift_with_sibling::<Item, H>(host, left, right, false);
            recompute_bounds::<Item, H>(host, left);
            recompute_bounds::<Item, H>(host, right);
        }
    } else {
        for idx in (target_index..roomy_index).rev() {
            let left = nth_child::<Item, H>(host, parent_off, idx);
            let right = nth_child::<Item, H>(host, parent_off, idx + 1);
            shift_with_sibling::<Item, H>(host, left, right, true);
            recompute_bounds::<Item, H>(host, left);
            recompute_bounds::<Item, H>(host, right);
        }
    }
}

fn add_rec<Item: ClusterItem, H: NodeHost>(
    host: &mut H,
    off: usize,
    parent_off: Option<usize>,
    my_index: usize,
    item: Item,
) -> Result<AddOutcome, ()> {
    let locked_before = locked_of::<Item, H>(host, off);
    if !locked_before {
        set_locked::<Item, H>(host, off, true);
    }

    let outcome = if level_of::<Item, H>(host, off) == 0 {
        make_room_and_insert::<Item, H>(host, off, parent_off, my_index, NewSlot::LeafItem(item))
    } else {
        let idx = choose_child_index::<Item, H>(host, off, item.key());
        let child_off = nth_child::<Item, H>(host, off, idx);
        match add_rec::<Item, H>(host, child_off, Some(off), idx, item) {
            Err(()) => Err(()),
            Ok(AddOutcome::Done) => {
                recompute_internal_bounds::<Item, H>(host, off);
                Ok(AddOutcome::Done)
            }
            Ok(AddOutcome::NewSibling { offset, first_key }) => make_room_and_insert::<Item, H>(
                host,
                off,
                parent_off,
                my_index,
                NewSlot::Child { offset, first_key },
            ),
        }
    };

    if !locked_before {
        if dirty_of::<Item, H>(host, off) {
            cleanup_node::<Item, H>(host, off);
        }
        set_locked::<Item, H>(host, off, false);
    }
    outcome
}

fn remove_rec<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize, key: usize) -> Option<Item> {
    let locked_before = locked_of::<Item, H>(host, off);
    if !locked_before {
        set_locked::<Item, H>(host, off, true);
    }

    let result = if level_of::<Item, H>(host, off) == 0 {
        match find_item_index::<Item, H>(host, off, key) {
            None => None,
            Some(i) => {
                let node = unsafe { node_mut::<Item, H>(host, off) };
                let item = node.items[i];
                if locked_before {
                    node.items[i].make_tombstone();
                    node.meta.set_dirty(true);
                } else {
                    let count = node.meta.child_count();
                    let new_count = compact_remove_at(&mut node.items, count, i);
                    node.meta.set_child_count(new_count);
                    recompute_leaf_bounds::<Item, H>(host, off);
                }
                Some(item)
            }
        }
    } else {
        let idx = choose_child_index::<Item, H>(host, off, key);
        let child_off = nth_child::<Item, H>(host, off, idx);
        match remove_rec::<Item, H>(host, child_off, key) {
            None => None,
            Some(item) => {
                set_dirty::<Item, H>(host, off, true);
                Some(item)
            }
        }
    };

    if !locked_before {
        if dirty_of::<Item, H>(host, off) {
            cleanup_node::<Item, H>(host, off);
        }
        set_locked::<Item, H>(host, off, false);
    }
    result
}

/// Tail cleanup for a node left `dirty` by a deferred tombstone somewhere
/// in its subtree. Physically compacts tombstoned leaf items, frees
/// emptied children, and opportunistically merges adjacent children that
/// now fit together.
fn cleanup_node<Item: ClusterItem, H: NodeHost>(host: &mut H, off: usize) {
    if level_of::<Item, H>(host, off) == 0 {
        let node = unsafe { node_mut::<Item, H>(host, off) };
        let count = node.meta.child_count() as usize;
        let mut compacted = [Item::default(); FANOUT];
        let mut new_count = 0u8;
        for i in 0..count {
            if !node.items[i].is_tombstone() {
                compacted[new_count as usize] = node.items[i];
                new_count += 1;
            }
        }
        node.items = compacted;
        node.meta.set_child_count(new_count);
        node.meta.set_dirty(false);
        recompute_leaf_bounds::<Item, H>(host, off);
        return;
    }

    let count = count_of::<Item, H>(host, off) as usize;
    let snapshot = unsafe { node_ref::<Item, H>(host, off) }.children;
    let mut new_children = [0usize; FANOUT];
    let mut new_count = 0u8;
    for i in 0..count {
        let c = snapshot[i];
        let empty = count_of::<Item, H>(host, c) == 0;
        if empty {
            host.free_node(c);
            continue;
        }
        if dirty_of::<Item, H>(host, c) {
            cleanup_node::<Item, H>(host, c);
        }
        new_children[new_count as usize] = c;
        new_count += 1;
    }

    // Opportunistic combine: merge adjacent children that now fit in one.
    let mut i = 0usize;
    while i + 1 < new_count as usize {
        let a = new_children[i];
        let b = new_children[i + 1];
        if count_of::<Item, H>(host, a) as usize + count_of::<Item, H>(host, b) as usize <= FANOUT {
            merge_into::<Item, H>(host, a, b);
            host.free_node(b);
            for j in (i + 1)..(new_count as usize - 1) {
                new_children[j] = new_children[j + 1];
            }
            new_count -= 1;
        } else {
            i += 1;
        }
    }

    let node = unsafe { node_mut::<Item, H>(host, off) };
    node.children = new_children;
    node.meta.set_child_count(new_count);
    node.meta.set_dirty(false);
    recompute_internal_bounds::<Item, H>(host, off);
}

/// Appends `src`'s contents onto `dst` (same level assumed).
fn merge_into<Item: ClusterItem, H: NodeHost>(host: &mut H, dst: usize, src: usize) {
    let level = level_of::<Item, H>(host, dst);
    if level == 0 {
        let src_items = unsafe { node_ref::<Item, H>(host, src) }.items;
        let src_count = count_of::<Item, H>(host, src);
        let d = unsafe { node_mut::<Item, H>(host, dst) };
        let dc = d.meta.child_count();
        let new_count = append_all(&mut d.items, dc, &src_items, src_count);
        d.meta.set_child_count(new_count);
    } else {
        let src_children = unsafe { node_ref::<Item, H>(host, src) }.children;
        let src_count = count_of::<Item, H>(host, src);
        let d = unsafe { node_mut::<Item, H>(host, dst) };
        let dc = d.meta.child_count();
        let new_count = append_all(&mut d.children, dc, &src_children, src_count);
        d.meta.set_child_count(new_count);
    }
    recompute_bounds::<Item, H>(host, dst);
}

fn descend_extreme<Item: ClusterItem, H: NodeHost>(host: &H, off: usize, want_min: bool) -> Option<Item> {
    if off == 0 {
        return None;
    }
    let node = unsafe { node_ref::<Item, H>(host, off) };
    let count = node.meta.child_count() as usize;
    if node.meta.level() == 0 {
        if count == 0 {
            return None;
        }
        return Some(if want_min { node.items[0] } else { node.items[count - 1] });
    }
    if want_min {
        for i in 0..count {
            let c = node.children[i];
            if count_of::<Item, H>(host, c) > 0 {
                return descend_extreme::<Item, H>(host, c, true);
            }
        }
    } else {
        for i in (0..count).rev() {
            let c = node.children[i];
            if count_of::<Item, H>(host, c) > 0 {
                return descend_extreme::<Item, H>(host, c, false);
            }
        }
    }
    None
}

fn find_min_ge_rec<Item: ClusterItem, H: NodeHost>(host: &H, off: usize, key: usize) -> Option<Item> {
    let node = unsafe { node_ref::<Item, H>(host, off) };
    let count = node.meta.child_count() as usize;
    if node.meta.level() == 0 {
        for i in 0..count {
            if !node.items[i].is_tombstone() && node.items[i].key() >= key {
                return Some(node.items[i]);
            }
        }
        return None;
    }
    for i in 0..count {
        let c = node.children[i];
        let child = unsafe { node_ref::<Item, H>(host, c) };
        if child.meta.child_count() == 0 {
            continue;
        }
        if child.last >= key {
            if let Some(found) = find_min_ge_rec::<Item, H>(host, c, key) {
                return Some(found);
            }
        }
    }
    None
}

/// An ordered associative container built over the cluster-tree machinery
/// above. Holds only the root offset (`0` = empty); all state lives in the
/// region via the owning [`NodeHost`].
pub(crate) struct Cluster<Item: ClusterItem> {
    pub(crate) root: usize,
    _marker: core::marker::PhantomData<Item>,
}

impl<Item: ClusterItem> Default for Cluster<Item> {
    fn default() -> Self {
        Self {
            root: 0,
            _marker: core::marker::PhantomData,
        }
    }
}

impl<Item: ClusterItem> Cluster<Item> {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.root == 0
    }

    pub(crate) fn len<H: NodeHost>(&self, host: &H) -> usize {
        if self.root == 0 {
            0
        } else {
            unsafe { node_ref::<Item, H>(host, self.root) }.item_count
        }
    }

    pub(crate) fn first<H: NodeHost>(&self, host: &H) -> Option<Item> {
        descend_extreme::<Item, H>(host, self.root, true)
    }

    pub(crate) fn last<H: NodeHost>(&self, host: &H) -> Option<Item> {
        descend_extreme::<Item, H>(host, self.root, false)
    }

    pub(crate) fn find_min_ge<H: NodeHost>(&self, host: &H, key: usize) -> Option<Item> {
        if self.root == 0 {
            return None;
        }
        find_min_ge_rec::<Item, H>(host, self.root, key)
    }

    pub(crate) fn add<H: NodeHost>(&mut self, host: &mut H, item: Item) -> Option<()> {
        if self.root == 0 {
            let leaf_off = host.alloc_node::<Item>()?;
            insert_item_sorted::<Item, H>(host, leaf_off, item);
            self.root = leaf_off;
            return Some(());
        }

        match add_rec::<Item, H>(host, self.root, None, 0, item) {
            Err(()) => None,
            Ok(AddOutcome::Done) => Some(()),
            Ok(AddOutcome::NewSibling { offset: sibling_off, .. }) => match host.alloc_node::<Item>() {
                None => {
                    merge_into::<Item, H>(host, self.root, sibling_off);
                    host.free_node(sibling_off);
                    None
                }
                Some(new_root_off) => {
                    let level = level_of::<Item, H>(host, self.root);
                    unsafe { node_mut::<Item, H>(host, new_root_off) }.meta = ClusterMeta::new(level + 1, 0);
                    let old_root = self.root;
                    insert_child_sorted::<Item, H>(
                        host,
                        new_root_off,
                        old_root,
                        first_key_of::<Item, H>(host, old_root),
                    );
                    insert_child_sorted::<Item, H>(
                        host,
                        new_root_off,
                        sibling_off,
                        first_key_of::<Item, H>(host, sibling_off),
                    );
                    self.root = new_root_off;
                    Some(())
                }
            },
        }
    }

    pub(crate) fn remove_exact<H: NodeHost>(&mut self, host: &mut H, key: usize) -> Option<Item> {
        if self.root == 0 {
            return None;
        }
        let result = remove_rec::<Item, H>(host, self.root, key);
        if result.is_some() {
            self.maybe_drop_root::<H>(host);
        }
        result
    }

    pub(crate) fn remove_at<H: NodeHost>(&mut self, host: &mut H, rank: usize) -> Option<Item> {
        if self.root == 0 {
            return None;
        }
        let key = key_at_rank::<Item, H>(host, self.root, rank)?;
        self.remove_exact::<H>(host, key)
    }

    fn maybe_drop_root<H: NodeHost>(&mut self, host: &mut H) {
        loop {
            if self.root == 0 {
                break;
            }
            if locked_of::<Item, H>(host, self.root) {
                break;
            }
            if level_of::<Item, H>(host, self.root) == 0 {
                break;
            }
            let count = count_of::<Item, H>(host, self.root);
            if count == 0 {
                host.free_node(self.root);
                self.root = 0;
                break;
            }
            if count == 1 {
                let only_child = nth_child::<Item, H>(host, self.root, 0);
                host.free_node(self.root);
                self.root = only_child;
                continue;
            }
            break;
        }
    }
}

fn key_at_rank<Item: ClusterItem, H: NodeHost>(host: &H, off: usize, rank: usize) -> Option<usize> {
    let node = unsafe { node_ref::<Item, H>(host, off) };
    if node.meta.level() == 0 {
        let count = node.meta.child_count() as usize;
        if rank >= count {
            return None;
        }
        return Some(node.items[rank].key());
    }
    let mut remaining = rank;
    for i in 0..node.meta.child_count() as usize {
        let c = node.children[i];
        let child = unsafe { node_ref::<Item, H>(host, c) };
        if child.meta.child_count() == 0 {
            continue;
        }
        if remaining < child.item_count {
            return key_at_rank::<Item, H>(host, c, remaining);
        }
        remaining -= child.item_count;
    }
    None
}

/// Recursively checks a cluster tree against invariants 6-9: no node left
/// `dirty`/`locked`, every `child_count <= FANOUT`, and every node's cached
/// `first`/`last`/`item_count` agreeing with a brute-force scan of its own
/// subtree. Returns `false` on the first violation found anywhere in the
/// tree rooted at `root` (`root == 0`, the empty tree, always holds).
/// Exposed crate-wide so other modules' tests can check a cluster tree they
/// don't otherwise have the internals to inspect.
#[cfg(test)]
pub(crate) fn check_invariants<Item: ClusterItem, H: NodeHost>(host: &H, root: usize) -> bool {
    root == 0 || check_node_invariants::<Item, H>(host, root).is_some()
}

/// Returns the node's level on success, so callers can confirm every child
/// of an internal node sits exactly one level below it (the tree is
/// height-balanced by construction).
#[cfg(test)]
fn check_node_invariants<Item: ClusterItem, H: NodeHost>(host: &H, off: usize) -> Option<u8> {
    let node = unsafe { node_ref::<Item, H>(host, off) };
    if node.meta.dirty() || node.meta.locked() {
        return None;
    }
    let count = node.meta.child_count() as usize;
    if count > FANOUT {
        return None;
    }

    if node.meta.level() == 0 {
        let expected_first = if count == 0 { 0 } else { node.items[0].key() };
        let expected_last = if count == 0 { 0 } else { node.items[count - 1].key() };
        if node.first != expected_first || node.last != expected_last || node.item_count != count {
            return None;
        }
        return Some(0);
    }

    let mut child_level = None;
    let mut expected_first = None;
    let mut expected_last = 0usize;
    let mut expected_total = 0usize;
    for i in 0..count {
        let c = node.children[i];
        let lvl = check_node_invariants::<Item, H>(host, c)?;
        match child_level {
            None => child_level = Some(lvl),
            Some(seen) if seen != lvl => return None,
            _ => {}
        }
        let child = unsafe { node_ref::<Item, H>(host, c) };
        if child.meta.child_count() == 0 {
            continue;
        }
        if expected_first.is_none() {
            expected_first = Some(child.first);
        }
        expected_last = child.last;
        expected_total += child.item_count;
    }
    if let Some(lvl) = child_level {
        if node.meta.level() != lvl + 1 {
            return None;
        }
    }
    if node.first != expected_first.unwrap_or(0) || node.last != expected_last || node.item_count != expected_total {
        return None;
    }
    Some(node.meta.level())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::word::W;

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

        fn free_node(&mut self, _offset: usize) {
            // Tests never need reclaimed node storage back.
        }
    }

    #[test]
    fn insert_and_find_without_split() {
        let mut host = TestHost::new(1 << 16);
        let mut set: Cluster<usize> = Cluster::new();

        for v in [50usize, 10, 30, 20, 40] {
            assert!(set.add(&mut host, v).is_some());
        }

        assert_eq!(set.first(&host), Some(10));
        assert_eq!(set.last(&host), Some(50));
        assert_eq!(set.len(&host), 5);
        assert_eq!(set.find_min_ge(&host, 25), Some(30));
    }

    #[test]
    fn insert_forces_split_and_stays_ordered() {
        let mut host = TestHost::new(1 << 16);
        let mut set: Cluster<usize> = Cluster::new();

        let values: Vec<usize> = (0..40).map(|i| i * 3).collect();
        for &v in &values {
            assert!(set.add(&mut host, v).is_some());
        }

        assert_eq!(set.len(&host), values.len());
        assert_eq!(set.first(&host), Some(0));
        assert_eq!(set.last(&host), Some(*values.last().unwrap()));

        for &v in &values {
            assert_eq!(set.find_min_ge(&host, v), Some(v));
        }
        assert!(check_invariants::<usize, TestHost>(&host, set.root));
    }

    #[test]
    fn multi_hop_shift_finds_a_sibling_beyond_the_immediate_neighbours() {
        let mut host = TestHost::new(1 << 16);

        // Four leaf children under one parent: the first three are
        // completely full, the fourth has one spare slot. A single-hop
        // shift starting from child 0 would see only child 1 (also full)
        // and give up; the multi-hop walk must reach past it to child 3
        // and rotate a slot through children 2 and 1 on the way.
        let mut child_offs = [0usize; 4];
        for (i, off) in child_offs.iter_mut().enumerate() {
            let o = host.alloc_node::<usize>().unwrap();
            let count = if i == 3 { FANOUT - 1 } else { FANOUT };
            {
                let node = unsafe { node_mut::<usize, TestHost>(&mut host, o) };
                node.meta = ClusterMeta::new(0, 0);
                for slot in 0..count {
                    node.items[slot] = i * 1000 + slot;
                }
                node.meta.set_child_count(count as u8);
            }
            recompute_leaf_bounds::<usize, TestHost>(&mut host, o);
            *off = o;
        }

        let parent_off = host.alloc_node::<usize>().unwrap();
        {
            let parent = unsafe { node_mut::<usize, TestHost>(&mut host, parent_off) };
            parent.meta = ClusterMeta::new(1, 4);
            parent.children[..4].copy_from_slice(&child_offs);
        }
        recompute_internal_bounds::<usize, TestHost>(&mut host, parent_off);

        let roomy = find_roomy_sibling::<usize, TestHost>(&host, parent_off, 0, 4);
        assert_eq!(roomy, Some(3));

        rotate_toward_target::<usize, TestHost>(&mut host, parent_off, 3, 0);

        assert_eq!(count_of::<usize, TestHost>(&host, child_offs[0]), (FANOUT - 1) as u8);
        assert_eq!(count_of::<usize, TestHost>(&host, child_offs[1]), FANOUT as u8);
        assert_eq!(count_of::<usize, TestHost>(&host, child_offs[2]), FANOUT as u8);
        assert_eq!(count_of::<usize, TestHost>(&host, child_offs[3]), FANOUT as u8);
    }

    #[test]
    fn remove_shrinks_and_find_reflects_it() {
        let mut host = TestHost::new(1 << 16);
        let mut set: Cluster<usize> = Cluster::new();

        let values: Vec<usize> = (0..25).collect();
        for &v in &values {
            set.add(&mut host, v).unwrap();
        }

        for v in (0..25).step_by(2) {
            assert_eq!(set.remove_exact(&mut host, v), Some(v));
        }

        assert_eq!(set.len(&host), 12);
        for v in (0..25).step_by(2) {
            assert_eq!(set.find_min_ge(&host, v), if v < 24 { Some(v + 1) } else { None });
        }
        for v in (1..25).step_by(2) {
            assert_eq!(set.find_min_ge(&host, v), Some(v));
        }
        assert!(check_invariants::<usize, TestHost>(&host, set.root));
    }

    #[test]
    fn remove_at_rank_uses_cached_counts() {
        let mut host = TestHost::new(1 << 16);
        let mut set: Cluster<usize> = Cluster::new();
        let values: Vec<usize> = (0..17).map(|i| i * 10).collect();
        for &v in &values {
            set.add(&mut host, v).unwrap();
        }

        let removed = set.remove_at(&mut host, 5).unwrap();
        assert_eq!(removed, values[5]);
        assert_eq!(set.len(&host), values.len() - 1);
        assert!(check_invariants::<usize, TestHost>(&host, set.root));
    }

    #[test]
    fn removing_everything_empties_the_tree() {
        let mut host = TestHost::new(1 << 16);
        let mut set: Cluster<usize> = Cluster::new();
        let values: Vec<usize> = (0..37).collect();
        for &v in &values {
            set.add(&mut host, v).unwrap();
        }
        for &v in &values {
            assert_eq!(set.remove_exact(&mut host, v), Some(v));
        }
        assert!(set.is_empty());
        assert_eq!(set.len(&host), 0);
        assert_eq!(set.first(&host), None);
    }

    #[test]
    fn node_size_is_word_aligned_friendly() {
        // Sanity check that the generic node layout doesn't explode in size
        // for the one Item type used standalone (the offset index).
        assert!(core::mem::size_of::<ClusterNode<usize>>() < 4096);
        assert!(W >= 4);
    }
}
