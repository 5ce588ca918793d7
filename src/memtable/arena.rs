//! Bump allocator backing the MemTable.
//!
//! All entries and skiplist nodes live in one arena. Nothing is ever freed
//! individually; the whole arena is released when the MemTable is dropped.
//! Allocation state sits behind a mutex so `allocate` can take `&self`
//! (writers are externally serialized, readers never allocate); the usage
//! counter is atomic so it can be read concurrently.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::config::DEFAULT_ARENA_BLOCK_SIZE;

struct ArenaState {
    /// Boxed slices so the backing storage never moves when the vector
    /// grows; word-backed so every block starts 8-byte aligned.
    blocks: Vec<Box<[u64]>>,
    alloc_ptr: *mut u8,
    alloc_remaining: usize,
}

// The raw cursor is only touched under the mutex.
unsafe impl Send for ArenaState {}

/// Block-based bump allocator.
pub(crate) struct Arena {
    block_size: usize,
    state: Mutex<ArenaState>,
    memory_usage: AtomicUsize,
}

impl Arena {
    pub(crate) fn new() -> Self {
        Self::with_block_size(DEFAULT_ARENA_BLOCK_SIZE)
    }

    pub(crate) fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "arena block size must be > 0");
        Self {
            block_size,
            state: Mutex::new(ArenaState {
                blocks: Vec::new(),
                alloc_ptr: std::ptr::null_mut(),
                alloc_remaining: 0,
            }),
            memory_usage: AtomicUsize::new(0),
        }
    }

    /// Returns a pointer to `bytes` fresh bytes.
    ///
    /// The returned memory is zero-initialized, valid until the arena is
    /// dropped, and exclusively the caller's until it publishes a pointer
    /// into it.
    pub(crate) fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0);
        let mut state = self.state.lock();
        if bytes <= state.alloc_remaining {
            let result = state.alloc_ptr;
            state.alloc_ptr = unsafe { state.alloc_ptr.add(bytes) };
            state.alloc_remaining -= bytes;
            return result;
        }
        self.allocate_fallback(&mut state, bytes)
    }

    /// Like [`allocate`](Self::allocate) with the result aligned to
    /// `max(pointer size, 8)` bytes. Node headers are placed this way.
    pub(crate) fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        const ALIGN: usize = if std::mem::size_of::<*mut u8>() > 8 {
            std::mem::size_of::<*mut u8>()
        } else {
            8
        };

        let mut state = self.state.lock();
        let slop = {
            let current_mod = state.alloc_ptr as usize & (ALIGN - 1);
            if current_mod == 0 {
                0
            } else {
                ALIGN - current_mod
            }
        };
        let needed = bytes + slop;
        if needed <= state.alloc_remaining {
            let result = unsafe { state.alloc_ptr.add(slop) };
            state.alloc_ptr = unsafe { state.alloc_ptr.add(needed) };
            state.alloc_remaining -= needed;
            result
        } else {
            // Fresh blocks come from the global allocator and are always
            // at least pointer-aligned.
            self.allocate_fallback(&mut state, bytes)
        }
    }

    /// Total bytes reserved by the arena. Monotone non-decreasing until
    /// destruction.
    pub(crate) fn memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&self, state: &mut ArenaState, bytes: usize) -> *mut u8 {
        if bytes > self.block_size / 4 {
            // Oversize requests get their own block so the remainder of
            // the current block is not wasted.
            return self.new_block(state, bytes);
        }

        let ptr = self.new_block(state, self.block_size);
        state.alloc_ptr = unsafe { ptr.add(bytes) };
        state.alloc_remaining = self.block_size - bytes;
        ptr
    }

    fn new_block(&self, state: &mut ArenaState, block_bytes: usize) -> *mut u8 {
        let words = (block_bytes + 7) / 8;
        let mut block = vec![0u64; words].into_boxed_slice();
        let ptr = block.as_mut_ptr() as *mut u8;
        state.blocks.push(block);
        self.memory_usage
            .fetch_add(words * 8 + std::mem::size_of::<usize>(), Ordering::Relaxed);
        ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_arena() {
        let arena = Arena::new();
        assert_eq!(arena.memory_usage(), 0);
    }

    #[test]
    fn test_allocate_within_block() {
        let arena = Arena::new();
        let a = arena.allocate(16);
        let b = arena.allocate(16);
        assert!(!a.is_null());
        // Both served from the same block, back to back.
        assert_eq!(b as usize, a as usize + 16);
        assert_eq!(arena.memory_usage(), DEFAULT_ARENA_BLOCK_SIZE + std::mem::size_of::<usize>());
    }

    #[test]
    fn test_allocate_aligned() {
        let arena = Arena::new();
        arena.allocate(3);
        let p = arena.allocate_aligned(64);
        assert_eq!(p as usize % 8, 0);
    }

    #[test]
    fn test_oversize_allocation_gets_own_block() {
        let arena = Arena::with_block_size(1024);
        arena.allocate(100);
        let usage_before = arena.memory_usage();

        // Larger than block_size / 4: dedicated block, current block kept.
        arena.allocate(512);
        let usage_after = arena.memory_usage();
        assert_eq!(usage_after, usage_before + 512 + std::mem::size_of::<usize>());

        // The original block still serves small requests contiguously.
        let a = arena.allocate(8);
        let b = arena.allocate(8);
        assert_eq!(b as usize, a as usize + 8);
    }

    #[test]
    fn test_memory_usage_monotonic() {
        let arena = Arena::with_block_size(256);
        let mut last = 0;
        for i in 1..200 {
            arena.allocate(i % 64 + 1);
            let usage = arena.memory_usage();
            assert!(usage >= last);
            last = usage;
        }
    }

    #[test]
    fn test_writes_land_in_arena() {
        let arena = Arena::new();
        let p = arena.allocate(4);
        unsafe {
            std::ptr::copy_nonoverlapping(b"abcd".as_ptr(), p, 4);
            assert_eq!(std::slice::from_raw_parts(p, 4), b"abcd");
        }
    }
}
