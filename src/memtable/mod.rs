//! # MemTable - hot/cold separating write buffer
//!
//! The MemTable holds recent writes in a sorted in-memory structure. Two
//! link structures run through the same arena-allocated nodes:
//!
//! - a concurrent skiplist ordered by internal key (user key ascending,
//!   sequence descending), serving point lookups and ordered scans, and
//! - a FIFO insertion chain partitioned into a *cold* zone (oldest), a
//!   *hot* zone (newest, capped at a byte budget) and an *obsolete* list
//!   of superseded versions.
//!
//! At flush time [`MemTable::separate`] narrows the skiplist to the cold
//! zone; the hot entries are pulled out with [`MemTable::extract_hot`]
//! and re-added to a successor MemTable, so frequently re-written keys
//! never reach disk.
//!
//! ## Thread safety
//!
//! Mutating operations (`add`, `separate`) must be serialized by the
//! caller, typically under the engine's write mutex; this contract is not
//! enforced here. Readers are lock-free: a reference holder may run
//! `get` and ordered iteration concurrently with a writer. FIFO iteration
//! and `extract_hot` are writer-side operations for the non-concurrent
//! flush phases.

mod arena;
mod fifo;
mod format;
mod skiplist;

pub use format::{
    extract_user_key, pack_tag, unpack_tag, InternalKeyComparator, LookupKey, SequenceNumber,
    ValueType, INTERNAL_KEY_TAIL, MAX_SEQUENCE_NUMBER,
};

use std::cmp::Ordering;
use std::sync::atomic::{AtomicI32, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use log::debug;

use crate::coding::put_length_prefixed_slice;
use crate::config::Options;
use crate::error::{Error, Result};
use arena::Arena;
use fifo::FifoIterator as ChainIterator;
use format::{compare_sequence, encode_entry, EntryComparator, ParsedEntry};
use skiplist::{SkipList, SkipListIterator};

/// One hot entry pulled out of a MemTable by [`MemTable::extract_hot`],
/// ready to be re-added to a successor table.
#[derive(Debug, Clone)]
pub struct HotEntry {
    /// The user key.
    pub key: Bytes,
    /// The write's sequence number.
    pub sequence: SequenceNumber,
    /// Put or tombstone.
    pub value_type: ValueType,
    /// The value bytes (empty for tombstones).
    pub value: Bytes,
}

/// In-memory write buffer with hot/cold separation.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use embertable::{BytewiseComparator, InternalKeyComparator, LookupKey, MemTable, ValueType};
///
/// let cmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
/// let table = MemTable::new(cmp, 1024);
/// table.add(1, ValueType::Value, b"k", b"v");
/// let value = table.get(&LookupKey::new(b"k", 10)).unwrap().unwrap();
/// assert_eq!(&value[..], b"v");
/// ```
pub struct MemTable {
    comparator: InternalKeyComparator,
    arena: Arc<Arena>,
    table: SkipList,
    refs: AtomicI32,
}

impl MemTable {
    /// Creates an empty MemTable ordering entries with `comparator` and
    /// budgeting its hot zone at `hot_threshold_bytes`.
    ///
    /// A threshold of 0 classifies all data as cold.
    pub fn new(comparator: InternalKeyComparator, hot_threshold_bytes: usize) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(
            EntryComparator::new(comparator.clone()),
            Arc::clone(&arena),
            hot_threshold_bytes,
        );
        Self { comparator, arena, table, refs: AtomicI32::new(0) }
    }

    /// Creates an empty MemTable from validated [`Options`].
    pub fn with_options(comparator: InternalKeyComparator, options: &Options) -> Result<Self> {
        options.validate()?;
        let arena = Arc::new(Arena::with_block_size(options.arena_block_size));
        let table = SkipList::new(
            EntryComparator::new(comparator.clone()),
            Arc::clone(&arena),
            options.hot_threshold_bytes,
        );
        Ok(Self { comparator, arena, table, refs: AtomicI32::new(0) })
    }

    /// Takes a reference on the table.
    pub fn acquire(&self) {
        self.refs.fetch_add(1, AtomicOrdering::Relaxed);
    }

    /// Drops a reference. Returns `true` when the count reaches zero and
    /// the caller is expected to destroy the table.
    ///
    /// # Panics
    ///
    /// Panics if called without a matching [`acquire`](Self::acquire).
    pub fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, AtomicOrdering::AcqRel);
        if prev <= 0 {
            // Restore the count so the drop-time check reports the real
            // defect instead of aborting mid-unwind.
            self.refs.fetch_add(1, AtomicOrdering::Relaxed);
            panic!("MemTable released below zero references");
        }
        prev == 1
    }

    /// Adds an entry that maps `key` to `value` at `sequence`, or marks
    /// `key` deleted if `value_type` is [`ValueType::Deletion`].
    ///
    /// If an older version of the same user key is live, its node is
    /// thawed out of the FIFO chain onto the obsolete list, so the chain
    /// carries at most one node per user key.
    ///
    /// Writers must be externally serialized; this is a contract of the
    /// surrounding database, not enforced here.
    pub fn add(&self, sequence: SequenceNumber, value_type: ValueType, key: &[u8], value: &[u8]) {
        let (entry, encoded_len) = encode_entry(&self.arena, sequence, value_type, key, value);
        debug_assert!(!self.table.contains(entry), "duplicate (key, sequence, type) write");
        self.table.insert(entry, encoded_len);

        // Duplicate detection: the entry just inserted is the newest
        // version of its user key, so an older version, if live, is its
        // immediate successor in internal key order.
        let mut iter = SkipListIterator::new(&self.table);
        iter.seek(entry);
        debug_assert!(iter.valid());
        iter.next();
        if !iter.valid() {
            return;
        }
        let dup = ParsedEntry::decode(iter.key());
        if self.comparator.user_comparator().compare(dup.user_key, key) != Ordering::Equal {
            return;
        }

        let normal = self.table.fifo().normal_head();
        let r = if normal.is_null() {
            // No hot zone: the superseded node can only be cold.
            Ordering::Greater
        } else {
            compare_sequence(iter.key(), unsafe { (*normal).entry() })
        };
        self.table.thaw(iter.node(), r);
    }

    /// Looks up the newest version of the key visible at the lookup key's
    /// sequence horizon.
    ///
    /// Returns `Some(Ok(value))` for a live value, `Some(Err(NotFound))`
    /// when the visible version is a tombstone, and `None` when the table
    /// holds no version of the key at or below the horizon.
    pub fn get(&self, key: &LookupKey) -> Option<Result<Bytes>> {
        let mut iter = SkipListIterator::new(&self.table);
        iter.seek(key.memtable_key().as_ptr());
        if !iter.valid() {
            return None;
        }
        // The seek skipped every entry with a too-new sequence; only the
        // user key needs checking.
        let entry = ParsedEntry::decode(iter.key());
        if self.comparator.user_comparator().compare(entry.user_key, key.user_key())
            != Ordering::Equal
        {
            return None;
        }
        match entry.value_type {
            ValueType::Value => Some(Ok(Bytes::copy_from_slice(entry.value))),
            ValueType::Deletion => {
                Some(Err(Error::not_found(String::from_utf8_lossy(key.user_key()))))
            }
        }
    }

    /// Returns an iterator over live entries in internal key order.
    pub fn iter(&self) -> MemTableIterator<'_> {
        MemTableIterator { iter: SkipListIterator::new(&self.table), tmp: Vec::new() }
    }

    /// Returns an iterator over the FIFO chain in insertion order.
    pub fn fifo_iter(&self) -> MemTableFifoIterator<'_> {
        MemTableFifoIterator { iter: ChainIterator::new(self.table.fifo()) }
    }

    /// Appends every hot entry, oldest first, to `out`.
    ///
    /// Each user key appears at most once and the version emitted is its
    /// newest. The driver re-adds these tuples to the successor MemTable
    /// after [`separate`](Self::separate).
    pub fn extract_hot(&self, out: &mut Vec<HotEntry>) {
        let mut iter = ChainIterator::new(self.table.fifo());
        iter.seek_to_normal();
        while iter.valid() {
            let e = ParsedEntry::decode(iter.key());
            out.push(HotEntry {
                key: Bytes::copy_from_slice(e.user_key),
                sequence: e.sequence,
                value_type: e.value_type,
                value: Bytes::copy_from_slice(e.value),
            });
            iter.next();
        }
    }

    /// Narrows the skiplist to the cold zone in preparation for a flush.
    ///
    /// Obsolete and hot nodes are unlinked from the level-0 chain; what
    /// remains is exactly the data destined for disk, in internal key
    /// order. Returns `false` if there is nothing cold to flush (the
    /// table is left untouched).
    ///
    /// Afterwards the table supports forward level-0 iteration only; the
    /// FIFO chain is unchanged, so `extract_hot` still works. Writers
    /// must be externally serialized.
    ///
    /// # Panics
    ///
    /// Panics if the table is empty.
    pub fn separate(&self) -> bool {
        assert!(!self.table.fifo().head().is_null(), "separate on an empty MemTable");
        let normal = self.table.fifo().normal_head();
        if normal.is_null() {
            // Only cold data; the rewrite just drops obsolete nodes.
            debug!("separate with empty hot zone, flushing everything");
            return self.table.separate(None);
        }
        self.table.separate(Some(unsafe { (*normal).entry() }))
    }

    /// Approximate bytes of memory held by this table.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// The hot zone byte budget this table was created with.
    pub fn hot_threshold(&self) -> usize {
        self.table.fifo().threshold()
    }

    /// Bytes currently accounted to the hot zone.
    pub fn hot_memory_usage(&self) -> usize {
        self.table.fifo().hot_bytes()
    }

    /// Bytes currently accounted to the cold zone.
    pub fn cold_memory_usage(&self) -> usize {
        self.table.fifo().cold_bytes()
    }

    /// Number of live entries (distinct user keys since the last flush).
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the table holds no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The comparator ordering this table.
    pub fn comparator(&self) -> &InternalKeyComparator {
        &self.comparator
    }
}

impl Drop for MemTable {
    fn drop(&mut self) {
        // Dropping with live references would free the arena under
        // readers still borrowing from it.
        assert_eq!(
            self.refs.load(AtomicOrdering::Acquire),
            0,
            "MemTable dropped with live references"
        );
    }
}

/// Ordered iterator over the live entries of a MemTable.
///
/// Keys and values are borrowed length-prefixed slices into the table's
/// arena, valid for the iterator's lifetime.
pub struct MemTableIterator<'a> {
    iter: SkipListIterator<'a>,
    /// Scratch for encoding seek targets into entry form.
    tmp: Vec<u8>,
}

impl<'a> MemTableIterator<'a> {
    /// Returns `true` if the iterator is positioned at an entry.
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Positions at the first entry whose internal key is at or after
    /// `internal_key`.
    pub fn seek(&mut self, internal_key: &[u8]) {
        self.tmp.clear();
        put_length_prefixed_slice(&mut self.tmp, internal_key);
        self.iter.seek(self.tmp.as_ptr());
    }

    /// Positions at the first entry.
    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    /// Positions at the last entry.
    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Advances to the next entry. Requires `valid()`.
    pub fn next(&mut self) {
        self.iter.next();
    }

    /// Steps back to the previous entry. Requires `valid()`.
    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// Advances past every remaining version of the current user key to
    /// the next distinct key. Requires `valid()`.
    pub fn seek_to_next_key(&mut self) {
        self.iter.seek_to_next_key();
    }

    /// The internal key at the current position. Requires `valid()`.
    pub fn key(&self) -> &'a [u8] {
        let e = unsafe { crate::coding::get_length_prefixed_slice_raw(self.iter.key()) };
        e.0
    }

    /// The value at the current position. Requires `valid()`.
    pub fn value(&self) -> &'a [u8] {
        ParsedEntry::decode(self.iter.key()).value
    }

    /// The user key at the current position. Requires `valid()`.
    pub fn user_key(&self) -> &'a [u8] {
        ParsedEntry::decode(self.iter.key()).user_key
    }

    /// The sequence number at the current position. Requires `valid()`.
    pub fn sequence(&self) -> SequenceNumber {
        ParsedEntry::decode(self.iter.key()).sequence
    }

    /// The value type at the current position. Requires `valid()`.
    pub fn value_type(&self) -> ValueType {
        ParsedEntry::decode(self.iter.key()).value_type
    }
}

/// Iterator over a MemTable's FIFO chain in insertion order.
///
/// Used by the flush path (and its tests); not meant for concurrent
/// readers.
pub struct MemTableFifoIterator<'a> {
    iter: ChainIterator<'a>,
}

impl<'a> MemTableFifoIterator<'a> {
    /// Returns `true` if the iterator is positioned at a node.
    pub fn valid(&self) -> bool {
        self.iter.valid()
    }

    /// Positions at the oldest live node.
    pub fn seek_to_first(&mut self) {
        self.iter.seek_to_first();
    }

    /// Positions at the oldest hot node; not valid if the hot zone is
    /// empty.
    pub fn seek_to_normal(&mut self) {
        self.iter.seek_to_normal();
    }

    /// Positions at the newest live node.
    pub fn seek_to_last(&mut self) {
        self.iter.seek_to_last();
    }

    /// Advances toward the newest node. Requires `valid()`.
    pub fn next(&mut self) {
        self.iter.next();
    }

    /// Steps back toward the oldest node. Requires `valid()`.
    pub fn prev(&mut self) {
        self.iter.prev();
    }

    /// The internal key at the current position. Requires `valid()`.
    pub fn key(&self) -> &'a [u8] {
        let e = unsafe { crate::coding::get_length_prefixed_slice_raw(self.iter.key()) };
        e.0
    }

    /// The value at the current position. Requires `valid()`.
    pub fn value(&self) -> &'a [u8] {
        ParsedEntry::decode(self.iter.key()).value
    }

    /// The user key at the current position. Requires `valid()`.
    pub fn user_key(&self) -> &'a [u8] {
        ParsedEntry::decode(self.iter.key()).user_key
    }

    /// The sequence number at the current position. Requires `valid()`.
    pub fn sequence(&self) -> SequenceNumber {
        ParsedEntry::decode(self.iter.key()).sequence
    }

    /// Accounting bytes of the current node (node memory plus encoded
    /// entry), the unit the hot/cold budget is tracked in. Requires
    /// `valid()`.
    pub fn byte_size(&self) -> usize {
        self.iter.byte_size()
    }
}
