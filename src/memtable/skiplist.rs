//! Concurrent skiplist over arena-encoded entries.
//!
//! ## Thread safety
//!
//! Writes require external synchronization (the surrounding engine's write
//! mutex). Reads only require that the list outlives them; they proceed
//! without locks.
//!
//! The rules that make this sound:
//!
//! - Allocated nodes are never deleted until the list's arena is dropped.
//! - A node's entry pointer, byte size and height are written before the
//!   node is published and never change afterwards. Only the next/FIFO
//!   pointers are mutated post-publication.
//! - Publication is a release-store of the node into a predecessor's next
//!   pointer; readers traverse with acquire-loads, so they observe fully
//!   initialized nodes.
//! - `max_height` is raised with a relaxed store *before* the new
//!   high-level pointers are stitched. A reader that sees the new height
//!   and a still-null forward pointer drops a level, which is safe because
//!   null sorts after every key.
//!
//! The FIFO chain threaded through the same nodes is writer-only state;
//! see [`fifo`](super::fifo).

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use log::debug;
use rand::Rng;

use super::arena::Arena;
use super::fifo::Fifo;
use super::format::{compare_sequence, EntryComparator};

/// Maximum node height.
pub(crate) const MAX_HEIGHT: usize = 12;

/// A node climbs one level with probability 1/BRANCHING.
const BRANCHING: u32 = 4;

/// A skiplist node.
///
/// Allocated in the arena with a trailing array of `height` forward
/// pointers; only the node's own levels may be touched. The same record
/// carries the FIFO chain pointers, an intrusive layout decision: one
/// allocation, two link structures.
///
/// `fifo_next` is overloaded. While the node is live it is the forward
/// link of the insertion chain; after the node is thawed it becomes the
/// "next obsolete" link. The two uses never overlap because an obsolete
/// node is never relinked into the live chain.
#[repr(C)]
pub(crate) struct Node {
    entry: *const u8,
    byte_size: usize,
    height: usize,
    fifo_next: AtomicPtr<Node>,
    fifo_prev: AtomicPtr<Node>,
    /// Trailing array, really `height` entries long. `next[0]` is the
    /// lowest level.
    next: [AtomicPtr<Node>; 1],
}

impl Node {
    /// Pointer to the encoded entry this node indexes.
    pub(crate) fn entry(&self) -> *const u8 {
        self.entry
    }

    /// Bytes this node contributes to FIFO accounting (node memory plus
    /// encoded entry). Set once at creation.
    pub(crate) fn byte_size(&self) -> usize {
        self.byte_size
    }

    fn next_atomic(&self, level: usize) -> &AtomicPtr<Node> {
        debug_assert!(level < self.height);
        // The trailing array extends past the declared length; `height`
        // slots were allocated.
        unsafe { &*self.next.as_ptr().add(level) }
    }

    /// Acquire-load of the forward pointer: observes a fully initialized
    /// node.
    pub(crate) fn next(&self, level: usize) -> *mut Node {
        self.next_atomic(level).load(AtomicOrdering::Acquire)
    }

    /// Release-store of the forward pointer: publishes the pointee.
    pub(crate) fn set_next(&self, level: usize, x: *mut Node) {
        self.next_atomic(level).store(x, AtomicOrdering::Release)
    }

    /// Relaxed load, safe only on the serialized writer's own scratch
    /// state.
    fn no_barrier_next(&self, level: usize) -> *mut Node {
        self.next_atomic(level).load(AtomicOrdering::Relaxed)
    }

    /// Relaxed store for stitching before publication.
    fn no_barrier_set_next(&self, level: usize, x: *mut Node) {
        self.next_atomic(level).store(x, AtomicOrdering::Relaxed)
    }

    pub(crate) fn fifo_next(&self) -> *mut Node {
        self.fifo_next.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn set_fifo_next(&self, x: *mut Node) {
        self.fifo_next.store(x, AtomicOrdering::Release)
    }

    pub(crate) fn no_barrier_fifo_next(&self) -> *mut Node {
        self.fifo_next.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn no_barrier_set_fifo_next(&self, x: *mut Node) {
        self.fifo_next.store(x, AtomicOrdering::Relaxed)
    }

    pub(crate) fn fifo_prev(&self) -> *mut Node {
        self.fifo_prev.load(AtomicOrdering::Acquire)
    }

    pub(crate) fn no_barrier_set_fifo_prev(&self, x: *mut Node) {
        self.fifo_prev.store(x, AtomicOrdering::Relaxed)
    }
}

/// Probabilistic ordered index over arena entries, with the FIFO
/// insertion chain threaded through its nodes.
pub(crate) struct SkipList {
    cmp: EntryComparator,
    arena: Arc<Arena>,
    head: *mut Node,
    /// Height of the entire list. Modified only by `insert`; read racily
    /// by readers, stale values are fine.
    max_height: AtomicUsize,
    /// Live entries: inserted minus thawed.
    len: AtomicUsize,
    fifo: Fifo,
}

// Readers are lock-free over published state; all mutation is confined to
// the externally serialized writer. See the module docs.
unsafe impl Send for SkipList {}
unsafe impl Sync for SkipList {}

impl SkipList {
    pub(crate) fn new(cmp: EntryComparator, arena: Arc<Arena>, hot_threshold: usize) -> Self {
        let list = Self {
            cmp,
            arena,
            head: ptr::null_mut(),
            max_height: AtomicUsize::new(1),
            len: AtomicUsize::new(0),
            fifo: Fifo::new(hot_threshold),
        };
        let head = list.new_node(ptr::null(), 0, MAX_HEIGHT);
        // A fresh node's forward pointers are already null.
        Self { head, ..list }
    }

    pub(crate) fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    fn max_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Relaxed)
    }

    fn new_node(&self, entry: *const u8, entry_bytes: usize, height: usize) -> *mut Node {
        let node_bytes = std::mem::size_of::<Node>()
            + (height - 1) * std::mem::size_of::<AtomicPtr<Node>>();
        let node = self.arena.allocate_aligned(node_bytes) as *mut Node;
        unsafe {
            ptr::addr_of_mut!((*node).entry).write(entry);
            ptr::addr_of_mut!((*node).byte_size).write(node_bytes + entry_bytes);
            ptr::addr_of_mut!((*node).height).write(height);
            ptr::addr_of_mut!((*node).fifo_next).write(AtomicPtr::new(ptr::null_mut()));
            ptr::addr_of_mut!((*node).fifo_prev).write(AtomicPtr::new(ptr::null_mut()));
            let levels = ptr::addr_of_mut!((*node).next) as *mut AtomicPtr<Node>;
            for i in 0..height {
                levels.add(i).write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    fn random_height() -> usize {
        let mut rng = rand::rng();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.random_ratio(1, BRANCHING) {
            height += 1;
        }
        height
    }

    /// True if `key` sorts after the entry stored in `n`. A null `n` acts
    /// as infinite.
    fn key_is_after_node(&self, key: *const u8, n: *mut Node) -> bool {
        !n.is_null() && self.cmp.compare_entries(unsafe { (*n).entry() }, key) == Ordering::Less
    }

    /// Returns the earliest node at or after `key`, or null.
    ///
    /// If `prev` is provided, fills `prev[level]` with the predecessor at
    /// every level, for the insert path.
    fn find_greater_or_equal(
        &self,
        key: *const u8,
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(prev) = prev.as_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Returns the latest node with an entry before `key`, or the head
    /// sentinel if there is none.
    fn find_less_than(&self, key: *const u8) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null()
                || self.cmp.compare_entries(unsafe { (*next).entry() }, key) != Ordering::Less
            {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Returns the last node in the list, or the head sentinel if empty.
    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { (*x).next(level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Inserts the entry at `entry` (`entry_bytes` encoded bytes) into the
    /// ordered index and appends its node to the FIFO chain.
    ///
    /// Requires external writer serialization. Nothing comparing equal to
    /// the entry's internal key may already be in the list.
    pub(crate) fn insert(&self, entry: *const u8, entry_bytes: usize) {
        let mut prev: [*mut Node; MAX_HEIGHT] = [ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(entry, Some(&mut prev));
        debug_assert!(
            x.is_null() || self.cmp.compare_entries(entry, unsafe { (*x).entry() }) != Ordering::Equal,
            "duplicate internal key inserted"
        );

        let height = Self::random_height();
        if height > self.max_height() {
            for p in prev.iter_mut().take(height).skip(self.max_height()) {
                *p = self.head;
            }
            // Raised before the new levels are stitched; a racing reader
            // that sees the new height finds null pointers and drops a
            // level (null sorts after all keys).
            self.max_height.store(height, AtomicOrdering::Relaxed);
        }

        let node = self.new_node(entry, entry_bytes, height);
        // The chain link happens before the node is visible to readers;
        // readers never traverse FIFO pointers.
        self.fifo.insert(node);

        unsafe {
            for (level, &p) in prev.iter().enumerate().take(height) {
                // Relaxed store suffices here: the release-store into the
                // predecessor is what publishes the node.
                (*node).no_barrier_set_next(level, (*p).no_barrier_next(level));
                (*p).set_next(level, node);
            }
        }
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// True if an entry comparing equal to `key` is in the list.
    pub(crate) fn contains(&self, key: *const u8) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && self.cmp.compare_entries(key, unsafe { (*x).entry() }) == Ordering::Equal
    }

    /// Moves the superseded node `y` from the FIFO chain to the obsolete
    /// list. `r` classifies which zone's byte counter it leaves; see
    /// [`Fifo::thaw`].
    ///
    /// The node stays in the ordered index so older versions remain
    /// visible to readers until `separate` rewrites the list.
    pub(crate) fn thaw(&self, y: *mut Node, r: Ordering) {
        self.fifo.thaw(y, r);
        self.len.fetch_sub(1, AtomicOrdering::Relaxed);
    }

    /// Resets the sentinel's level-0 forward pointer. Part of the
    /// separation rewrite.
    fn set_head(&self, node: *mut Node) {
        unsafe { (*self.head).set_next(0, node) }
    }

    /// The first node after `x` whose user key differs from `x`'s,
    /// skipping older versions of the same key.
    pub(crate) fn next_distinct_key(&self, x: *mut Node) -> *mut Node {
        unsafe {
            let mut n = (*x).next(0);
            while !n.is_null() && self.cmp.same_user_key((*n).entry(), (*x).entry()) {
                n = (*n).next(0);
            }
            n
        }
    }

    /// Rewrites the level-0 chain to contain only the cold residue.
    ///
    /// Keeps, for each distinct user key, its newest (FIFO-live) node iff
    /// that node is older than the `anchor` entry; a null anchor keeps
    /// every newest-per-key node (dropping obsoletes only). Returns false,
    /// without mutating the list, if no node qualifies.
    ///
    /// Higher levels are left stale on purpose: after separation the list
    /// serves exactly one consumer, the flusher's in-order level-0 walk.
    pub(crate) fn separate(&self, anchor: Option<*const u8>) -> bool {
        let is_cold = |e: *const u8| match anchor {
            None => true,
            Some(a) => compare_sequence(e, a) == Ordering::Greater,
        };

        unsafe {
            let mut x = (*self.head).next(0);
            let mut first = ptr::null_mut();
            while !x.is_null() {
                if is_cold((*x).entry()) {
                    first = x;
                    break;
                }
                x = self.next_distinct_key(x);
            }
            if first.is_null() {
                debug!("separate found no cold entries, nothing to flush");
                return false;
            }

            self.set_head(first);
            let mut kept = first;
            let mut scan = self.next_distinct_key(first);
            let mut dropped = 0usize;
            while !scan.is_null() {
                let succ = self.next_distinct_key(scan);
                if is_cold((*scan).entry()) {
                    (*kept).set_next(0, scan);
                    kept = scan;
                } else {
                    dropped += 1;
                }
                scan = succ;
            }
            (*kept).set_next(0, ptr::null_mut());
            debug!("separate rewrote level 0, dropped {} hot nodes", dropped);
        }
        true
    }
}

/// Iteration over the contents of a skiplist.
pub(crate) struct SkipListIterator<'a> {
    list: &'a SkipList,
    node: *mut Node,
}

impl<'a> SkipListIterator<'a> {
    /// Returns an iterator over `list`. Initially not valid.
    pub(crate) fn new(list: &'a SkipList) -> Self {
        Self { list, node: ptr::null_mut() }
    }

    pub(crate) fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Entry pointer at the current position. Requires `valid()`.
    pub(crate) fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).entry() }
    }

    /// Current node. Requires `valid()`.
    pub(crate) fn node(&self) -> *mut Node {
        debug_assert!(self.valid());
        self.node
    }

    pub(crate) fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).next(0) };
    }

    /// Steps back by searching for the last node before the current one;
    /// nodes carry no back links in the ordered index.
    pub(crate) fn prev(&mut self) {
        debug_assert!(self.valid());
        let node = self.list.find_less_than(unsafe { (*self.node).entry() });
        self.node = if node == self.list.head { ptr::null_mut() } else { node };
    }

    /// Advances to the first entry at or after `key` (entry-encoded form).
    pub(crate) fn seek(&mut self, key: *const u8) {
        self.node = self.list.find_greater_or_equal(key, None);
    }

    pub(crate) fn seek_to_first(&mut self) {
        self.node = unsafe { (*self.list.head).next(0) };
    }

    pub(crate) fn seek_to_last(&mut self) {
        let node = self.list.find_last();
        self.node = if node == self.list.head { ptr::null_mut() } else { node };
    }

    /// Advances until the user key differs from the current one, skipping
    /// older versions. The separation pass walks the list this way.
    pub(crate) fn seek_to_next_key(&mut self) {
        debug_assert!(self.valid());
        self.node = self.list.next_distinct_key(self.node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::memtable::format::{
        encode_entry, InternalKeyComparator, ParsedEntry, ValueType,
    };

    fn new_list(threshold: usize) -> SkipList {
        let icmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
        SkipList::new(EntryComparator::new(icmp), Arc::new(Arena::new()), threshold)
    }

    fn insert(list: &SkipList, key: &[u8], seq: u64, value: &[u8]) {
        let (entry, len) = encode_entry(list.arena.as_ref(), seq, ValueType::Value, key, value);
        list.insert(entry, len);
    }

    fn collect_keys(list: &SkipList) -> Vec<(Vec<u8>, u64)> {
        let mut iter = SkipListIterator::new(list);
        iter.seek_to_first();
        let mut out = Vec::new();
        while iter.valid() {
            let e = ParsedEntry::decode(iter.key());
            out.push((e.user_key.to_vec(), e.sequence));
            iter.next();
        }
        out
    }

    #[test]
    fn test_empty_list() {
        let list = new_list(1024);
        let mut iter = SkipListIterator::new(&list);
        assert!(!iter.valid());
        iter.seek_to_first();
        assert!(!iter.valid());
        iter.seek_to_last();
        assert!(!iter.valid());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn test_insert_orders_by_internal_key() {
        let list = new_list(1024);
        insert(&list, b"b", 2, b"vb");
        insert(&list, b"a", 1, b"va");
        insert(&list, b"c", 3, b"vc");
        // Newer version of "a" must come first within the key.
        insert(&list, b"a", 4, b"va2");

        assert_eq!(
            collect_keys(&list),
            vec![
                (b"a".to_vec(), 4),
                (b"a".to_vec(), 1),
                (b"b".to_vec(), 2),
                (b"c".to_vec(), 3),
            ]
        );
        assert_eq!(list.len(), 4);
    }

    #[test]
    fn test_contains() {
        let list = new_list(1024);
        insert(&list, b"k1", 5, b"v");
        let (probe, _) = encode_entry(list.arena.as_ref(), 5, ValueType::Value, b"k1", b"");
        assert!(list.contains(probe));
        let (probe, _) = encode_entry(list.arena.as_ref(), 6, ValueType::Value, b"k1", b"");
        assert!(!list.contains(probe));
    }

    #[test]
    fn test_seek_positions_at_or_after() {
        let list = new_list(1024);
        for (key, seq) in [(b"a", 1u64), (b"c", 2), (b"e", 3)] {
            insert(&list, key, seq, b"v");
        }
        let (target, _) = encode_entry(list.arena.as_ref(), u64::MAX >> 8, ValueType::Value, b"b", b"");
        let mut iter = SkipListIterator::new(&list);
        iter.seek(target);
        assert!(iter.valid());
        assert_eq!(ParsedEntry::decode(iter.key()).user_key, b"c");

        let (target, _) = encode_entry(list.arena.as_ref(), u64::MAX >> 8, ValueType::Value, b"f", b"");
        iter.seek(target);
        assert!(!iter.valid());
    }

    #[test]
    fn test_prev_and_seek_to_last() {
        let list = new_list(1024);
        for (key, seq) in [(b"a", 1u64), (b"b", 2), (b"c", 3)] {
            insert(&list, key, seq, b"v");
        }
        let mut iter = SkipListIterator::new(&list);
        iter.seek_to_last();
        assert!(iter.valid());
        assert_eq!(ParsedEntry::decode(iter.key()).user_key, b"c");
        iter.prev();
        assert_eq!(ParsedEntry::decode(iter.key()).user_key, b"b");
        iter.prev();
        assert_eq!(ParsedEntry::decode(iter.key()).user_key, b"a");
        iter.prev();
        assert!(!iter.valid());
    }

    #[test]
    fn test_seek_to_next_key_skips_versions() {
        let list = new_list(1024);
        insert(&list, b"a", 1, b"v1");
        insert(&list, b"a", 2, b"v2");
        insert(&list, b"a", 3, b"v3");
        insert(&list, b"b", 4, b"v4");

        let mut iter = SkipListIterator::new(&list);
        iter.seek_to_first();
        assert_eq!(ParsedEntry::decode(iter.key()).sequence, 3);
        iter.seek_to_next_key();
        assert!(iter.valid());
        let e = ParsedEntry::decode(iter.key());
        assert_eq!(e.user_key, b"b");
        iter.seek_to_next_key();
        assert!(!iter.valid());
    }

    #[test]
    fn test_many_inserts_stay_sorted() {
        let list = new_list(usize::MAX);
        // Insertion order deliberately scrambled.
        let mut seq = 0u64;
        for i in (0..200).rev().chain(200..400) {
            seq += 1;
            insert(&list, format!("key{:06}", i).as_bytes(), seq, b"v");
        }
        let keys = collect_keys(&list);
        assert_eq!(keys.len(), 400);
        for pair in keys.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
    }
}
