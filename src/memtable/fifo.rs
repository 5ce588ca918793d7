//! Insertion-order chain with hot/cold separation.
//!
//! A doubly-linked list threaded through the skiplist nodes in insertion
//! order, partitioned into three zones:
//!
//! ```text
//!   head                     normal_head                tail
//!    │                           │                        │
//!    ▼                           ▼                        ▼
//!   [cold ... cold]  ──────►  [hot ... hot ... hot(newest)]
//!
//!   obsolete ──► [superseded nodes, singly linked]
//! ```
//!
//! - The *hot* zone holds the newest entries, capped at `threshold`
//!   bytes. At flush time it is recycled into the successor MemTable.
//! - The *cold* zone holds everything frozen out of the hot budget; it is
//!   what spills to disk.
//! - The *obsolete* list collects nodes whose user key was re-written.
//!   They stay arena-resident (the arena is all-or-nothing) but leave the
//!   live chain, reusing `fifo_next` as the obsolete link.
//!
//! All chain state is written only by the externally serialized writer;
//! readers of the MemTable never traverse these pointers. The pointer
//! cells are atomics with relaxed ordering purely so mutation can go
//! through `&self`; the byte counters may be read concurrently.
//!
//! Invariants, holding whenever no chain operation is in flight:
//!
//! 1. `hot_bytes <= threshold`, except that a single entry larger than
//!    the whole budget is classified cold immediately.
//! 2. Sequence numbers strictly increase along `fifo_next`.
//! 3. The cold zone is exactly `[head, normal_head)`; the hot zone is
//!    exactly `[normal_head, tail]`.
//! 4. Each user key has at most one node on the chain; older versions
//!    live on the obsolete list.
//! 5. `cold_head != null` iff `cold_bytes > 0`, and likewise for
//!    `normal_head` / `hot_bytes`.

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering as AtomicOrdering};

use log::trace;

use super::skiplist::Node;

/// The FIFO chain state. Owned by the skiplist whose nodes it threads.
pub(crate) struct Fifo {
    /// Oldest live node; equals `cold_head` when a cold zone exists,
    /// otherwise `normal_head`.
    head: AtomicPtr<Node>,
    /// Oldest cold node, null if the cold zone is empty.
    cold_head: AtomicPtr<Node>,
    /// Oldest hot node, null if the hot zone is empty.
    normal_head: AtomicPtr<Node>,
    /// Newest live node.
    tail: AtomicPtr<Node>,
    /// Anchor of the obsolete list.
    obsolete: AtomicPtr<Node>,
    hot_bytes: AtomicUsize,
    cold_bytes: AtomicUsize,
    threshold: usize,
}

impl Fifo {
    pub(crate) fn new(threshold: usize) -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            cold_head: AtomicPtr::new(ptr::null_mut()),
            normal_head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            obsolete: AtomicPtr::new(ptr::null_mut()),
            hot_bytes: AtomicUsize::new(0),
            cold_bytes: AtomicUsize::new(0),
            threshold,
        }
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold
    }

    pub(crate) fn head(&self) -> *mut Node {
        self.head.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn cold_head(&self) -> *mut Node {
        self.cold_head.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn normal_head(&self) -> *mut Node {
        self.normal_head.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn tail(&self) -> *mut Node {
        self.tail.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn obsolete(&self) -> *mut Node {
        self.obsolete.load(AtomicOrdering::Relaxed)
    }

    /// Bytes currently accounted to the hot zone.
    pub(crate) fn hot_bytes(&self) -> usize {
        self.hot_bytes.load(AtomicOrdering::Acquire)
    }

    /// Bytes currently accounted to the cold zone.
    pub(crate) fn cold_bytes(&self) -> usize {
        self.cold_bytes.load(AtomicOrdering::Acquire)
    }

    /// Appends a freshly allocated node to the chain.
    ///
    /// Runs before the node is published into the ordered index, after
    /// its byte size is set. Requires external writer serialization.
    pub(crate) fn insert(&self, x: *mut Node) {
        let size = unsafe { (*x).byte_size() };

        // Freeze pass: make room in the hot budget before admitting x.
        let hot = self.hot_bytes();
        if !self.normal_head().is_null() && hot + size > self.threshold {
            self.freeze(hot + size - self.threshold);
        }

        let head = self.head();
        if head.is_null() {
            // First node of the chain.
            unsafe {
                (*x).no_barrier_set_fifo_prev(ptr::null_mut());
                (*x).no_barrier_set_fifo_next(ptr::null_mut());
            }
            self.head.store(x, AtomicOrdering::Relaxed);
            self.tail.store(x, AtomicOrdering::Relaxed);
            if size <= self.threshold {
                self.normal_head.store(x, AtomicOrdering::Relaxed);
                self.hot_bytes.store(size, AtomicOrdering::Release);
            } else {
                self.cold_head.store(x, AtomicOrdering::Relaxed);
                self.cold_bytes.store(size, AtomicOrdering::Release);
            }
            return;
        }

        if self.normal_head().is_null() {
            // The freeze pass (or a run of thaws) left no hot zone.
            if size <= self.threshold {
                self.normal_head.store(x, AtomicOrdering::Relaxed);
                self.hot_bytes.fetch_add(size, AtomicOrdering::Release);
            } else {
                // A single entry above the whole budget goes straight to
                // the cold zone.
                self.cold_bytes.fetch_add(size, AtomicOrdering::Release);
                if self.cold_head().is_null() {
                    self.cold_head.store(self.head(), AtomicOrdering::Relaxed);
                }
            }
        } else {
            self.hot_bytes.fetch_add(size, AtomicOrdering::Release);
        }

        let tail = self.tail();
        unsafe {
            (*x).no_barrier_set_fifo_prev(tail);
            (*x).no_barrier_set_fifo_next(ptr::null_mut());
            (*tail).set_fifo_next(x);
        }
        self.tail.store(x, AtomicOrdering::Relaxed);
    }

    /// Migrates nodes from the front of the hot zone into the cold zone
    /// until at least `excess` bytes have moved.
    ///
    /// The last migrated node may overshoot the excess; the budget only
    /// bounds what remains hot.
    fn freeze(&self, excess: usize) {
        let mut moved = 0usize;
        let mut n = self.normal_head();
        let cold_was_empty = self.cold_head().is_null();
        while !n.is_null() && moved < excess {
            moved += unsafe { (*n).byte_size() };
            n = unsafe { (*n).no_barrier_fifo_next() };
        }
        if cold_was_empty {
            // The previously-oldest node is the first newly-cold one.
            self.cold_head.store(self.head(), AtomicOrdering::Relaxed);
        }
        self.normal_head.store(n, AtomicOrdering::Relaxed);
        self.hot_bytes.fetch_sub(moved, AtomicOrdering::Release);
        self.cold_bytes.fetch_add(moved, AtomicOrdering::Release);
        trace!(
            "freeze moved {} bytes to cold (excess {}), hot zone {}",
            moved,
            excess,
            if n.is_null() { "emptied" } else { "trimmed" }
        );
    }

    /// Unlinks the superseded node `y` from the live chain and pushes it
    /// onto the obsolete list.
    ///
    /// `r` orders `y` against the hot/cold boundary (`Greater` = `y` is
    /// older than `normal_head`, i.e. cold) and decides which byte
    /// counter it leaves. Requires external writer serialization.
    pub(crate) fn thaw(&self, y: *mut Node, r: Ordering) {
        let size = unsafe { (*y).byte_size() };
        if r == Ordering::Greater {
            self.cold_bytes.fetch_sub(size, AtomicOrdering::Release);
        } else {
            self.hot_bytes.fetch_sub(size, AtomicOrdering::Release);
        }

        let y_next = unsafe { (*y).no_barrier_fifo_next() };
        let y_prev = unsafe { (*y).fifo_prev() };
        // The superseding node was appended before this call, so y is
        // never the tail.
        debug_assert!(!y_next.is_null());
        debug_assert!(y != self.tail());

        if y == self.head() {
            self.head.store(y_next, AtomicOrdering::Relaxed);
            unsafe { (*y_next).no_barrier_set_fifo_prev(ptr::null_mut()) };
            if y == self.cold_head() {
                // If y was the only cold node its successor is already
                // the hot boundary; the cold zone is then empty.
                let next_cold =
                    if y_next == self.normal_head() { ptr::null_mut() } else { y_next };
                self.cold_head.store(next_cold, AtomicOrdering::Relaxed);
            } else if y == self.normal_head() {
                self.normal_head.store(y_next, AtomicOrdering::Relaxed);
            }
        } else if y == self.normal_head() {
            self.normal_head.store(y_next, AtomicOrdering::Relaxed);
            unsafe {
                (*y_prev).set_fifo_next(y_next);
                (*y_next).no_barrier_set_fifo_prev(y_prev);
            }
        } else {
            unsafe {
                (*y_prev).set_fifo_next(y_next);
                (*y_next).no_barrier_set_fifo_prev(y_prev);
            }
        }

        // Head-insert into the obsolete list. The anchor node stays put;
        // later arrivals splice in behind it through fifo_next, which from
        // here on serves as the obsolete link.
        let obsolete = self.obsolete();
        unsafe {
            if obsolete.is_null() {
                (*y).no_barrier_set_fifo_next(ptr::null_mut());
                (*y).no_barrier_set_fifo_prev(ptr::null_mut());
                self.obsolete.store(y, AtomicOrdering::Relaxed);
            } else {
                (*y).no_barrier_set_fifo_next((*obsolete).no_barrier_fifo_next());
                (*obsolete).set_fifo_next(y);
            }
        }
        trace!(
            "thawed a {} byte node out of the {} zone",
            size,
            if r == Ordering::Greater { "cold" } else { "hot" }
        );
    }
}

/// Iterator over the live FIFO chain, oldest to newest.
pub(crate) struct FifoIterator<'a> {
    fifo: &'a Fifo,
    node: *mut Node,
}

impl<'a> FifoIterator<'a> {
    /// Returns an iterator over `fifo`. Initially not valid.
    pub(crate) fn new(fifo: &'a Fifo) -> Self {
        Self { fifo, node: ptr::null_mut() }
    }

    pub(crate) fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// Entry pointer at the current position. Requires `valid()`.
    pub(crate) fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).entry() }
    }

    /// Accounting bytes of the current node. Requires `valid()`.
    pub(crate) fn byte_size(&self) -> usize {
        debug_assert!(self.valid());
        unsafe { (*self.node).byte_size() }
    }

    pub(crate) fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).fifo_next() };
    }

    pub(crate) fn prev(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { (*self.node).fifo_prev() };
    }

    /// Positions at the oldest live node.
    pub(crate) fn seek_to_first(&mut self) {
        self.node = self.fifo.head();
    }

    /// Positions at the oldest hot node (null if the hot zone is empty).
    pub(crate) fn seek_to_normal(&mut self) {
        self.node = self.fifo.normal_head();
    }

    /// Positions at the newest live node.
    pub(crate) fn seek_to_last(&mut self) {
        self.node = self.fifo.tail();
    }
}
