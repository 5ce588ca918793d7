//! # embertable - hot/cold separating MemTable
//!
//! embertable is the in-memory write buffer of a log-structured key-value
//! store, extended with hot/cold separation to cut write amplification:
//! when the buffer is flushed, only the *cold* portion spills to on-disk
//! sorted runs, while the *hot* portion (recently re-written keys, capped
//! at a byte budget) is recycled into a freshly allocated buffer.
//!
//! ## Architecture
//!
//! One arena backs everything. Each write is encoded into an arena record
//! and indexed by a node carrying two link structures:
//!
//! - **Skiplist**: a concurrent ordered index keyed by internal key
//!   (user key ascending, sequence descending), lock-free for readers.
//! - **FIFO chain**: the same nodes in insertion order, partitioned into
//!   cold, hot and obsolete zones against the hot byte budget.
//!
//! Durability, batching, on-disk formats and flush scheduling are the
//! surrounding engine's concern; this crate is purely in-memory.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use embertable::{
//!     BytewiseComparator, InternalKeyComparator, LookupKey, MemTable, ValueType,
//! };
//!
//! let cmp = InternalKeyComparator::new(Arc::new(BytewiseComparator));
//! let table = MemTable::new(cmp.clone(), 4096);
//!
//! table.add(1, ValueType::Value, b"k1", b"v1");
//! table.add(2, ValueType::Value, b"k2", b"v2");
//! table.add(3, ValueType::Deletion, b"k1", b"");
//!
//! // k1 is visible at horizon 1 but tombstoned at horizon 3.
//! assert!(table.get(&LookupKey::new(b"k1", 1)).unwrap().is_ok());
//! assert!(table.get(&LookupKey::new(b"k1", 3)).unwrap().is_err());
//!
//! // Flush preparation: keep the cold residue, recycle the hot zone.
//! let mut hot = Vec::new();
//! table.extract_hot(&mut hot);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod coding;
pub mod comparator;
pub mod config;
pub mod error;
pub mod memtable;

pub use comparator::{BytewiseComparator, Comparator};
pub use config::Options;
pub use error::{Error, Result};
pub use memtable::{
    extract_user_key, pack_tag, unpack_tag, HotEntry, InternalKeyComparator, LookupKey, MemTable,
    MemTableFifoIterator, MemTableIterator, SequenceNumber, ValueType, INTERNAL_KEY_TAIL,
    MAX_SEQUENCE_NUMBER,
};
