//! Internal key format shared by the MemTable and its collaborators.
//!
//! ## Layout
//!
//! A user key is extended into an *internal key* by appending a 64-bit tag:
//!
//! ```text
//! internal_key := user_key ∥ fixed64_le((sequence << 8) | type)
//! ```
//!
//! An arena *entry* is the internal key and value, each length-prefixed:
//!
//! ```text
//! entry := varint32(|internal_key|) ∥ internal_key ∥ varint32(|value|) ∥ value
//! ```
//!
//! ## Ordering
//!
//! Internal keys are ordered by:
//! 1. user key (ascending, per the injected comparator)
//! 2. sequence number (descending - newer versions first)
//! 3. value type (descending - Value before Deletion)
//!
//! A forward iteration therefore encounters the newest version of each
//! user key first, which is what makes seek-based visibility work.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::coding::{
    decode_fixed64, encode_varint32, get_length_prefixed_slice_raw, put_fixed64,
};
use crate::comparator::Comparator;

/// A monotonically increasing write identifier. Only the low 56 bits are
/// usable; the top byte of the packed tag holds the value type.
pub type SequenceNumber = u64;

/// The largest sequence number the tag encoding can carry.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Bytes appended to a user key to form an internal key.
pub const INTERNAL_KEY_TAIL: usize = 8;

/// The type of a value in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueType {
    /// A tombstone masking any older Put of the same user key.
    Deletion = 0,

    /// A normal value.
    Value = 1,
}

/// The value type used when building seek targets. `Value` is the highest
/// type code, so for a given (user_key, sequence) the seek target sorts at
/// or before every stored entry with that key and sequence.
pub(crate) const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::Value;

impl ValueType {
    /// Converts a raw tag byte to a ValueType.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ValueType::Deletion),
            1 => Some(ValueType::Value),
            _ => None,
        }
    }

    /// Converts the ValueType to its tag byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Packs a sequence number and value type into a 64-bit tag.
pub fn pack_tag(seq: SequenceNumber, t: ValueType) -> u64 {
    debug_assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | t.as_u8() as u64
}

/// Splits a 64-bit tag into its sequence number and value type.
///
/// # Panics
///
/// Panics on an unknown type code; tags are produced by this process.
pub fn unpack_tag(tag: u64) -> (SequenceNumber, ValueType) {
    let t = ValueType::from_u8((tag & 0xff) as u8).expect("unknown value type in tag");
    (tag >> 8, t)
}

/// Returns the user key portion of an internal key.
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(internal_key.len() >= INTERNAL_KEY_TAIL);
    &internal_key[..internal_key.len() - INTERNAL_KEY_TAIL]
}

/// Returns the tag portion of an internal key.
pub(crate) fn extract_tag(internal_key: &[u8]) -> u64 {
    debug_assert!(internal_key.len() >= INTERNAL_KEY_TAIL);
    decode_fixed64(&internal_key[internal_key.len() - INTERNAL_KEY_TAIL..])
}

/// Orders internal keys by (user key asc, sequence desc, type desc).
#[derive(Clone)]
pub struct InternalKeyComparator {
    user_comparator: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    /// Creates an internal key comparator over the given user comparator.
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self { user_comparator }
    }

    /// The underlying user key comparator.
    pub fn user_comparator(&self) -> &dyn Comparator {
        self.user_comparator.as_ref()
    }

    /// Three-way comparison of two internal keys.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user_comparator.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                // Descending on the tag: the higher (sequence, type) pair
                // sorts first.
                extract_tag(b).cmp(&extract_tag(a))
            }
            ord => ord,
        }
    }
}

/// Compares two arena entries (length-prefixed internal key + value) by
/// internal key order.
#[derive(Clone)]
pub(crate) struct EntryComparator {
    icmp: InternalKeyComparator,
}

impl EntryComparator {
    pub(crate) fn new(icmp: InternalKeyComparator) -> Self {
        Self { icmp }
    }

    /// Three-way comparison of two entry pointers.
    ///
    /// Both pointers must reference well-formed arena entries (or encoded
    /// seek targets) that outlive the call.
    pub(crate) fn compare_entries(&self, a: *const u8, b: *const u8) -> Ordering {
        let (ka, kb) = unsafe {
            let (ka, _) = get_length_prefixed_slice_raw(a);
            let (kb, _) = get_length_prefixed_slice_raw(b);
            (ka, kb)
        };
        self.icmp.compare(ka, kb)
    }

    /// Returns `true` if two entries carry the same user key.
    pub(crate) fn same_user_key(&self, a: *const u8, b: *const u8) -> bool {
        let (ka, kb) = unsafe {
            let (ka, _) = get_length_prefixed_slice_raw(a);
            let (kb, _) = get_length_prefixed_slice_raw(b);
            (ka, kb)
        };
        self.icmp
            .user_comparator()
            .compare(extract_user_key(ka), extract_user_key(kb))
            == Ordering::Equal
    }
}

/// Orders two entries by sequence number alone.
///
/// Returns `Less` if `a` is newer (higher sequence) than `b`, `Greater`
/// if `a` is older, `Equal` otherwise. The FIFO chain uses this to decide
/// on which side of the hot/cold boundary an entry lies.
pub(crate) fn compare_sequence(a: *const u8, b: *const u8) -> Ordering {
    let (ka, kb) = unsafe {
        let (ka, _) = get_length_prefixed_slice_raw(a);
        let (kb, _) = get_length_prefixed_slice_raw(b);
        (ka, kb)
    };
    let anum = extract_tag(ka);
    let bnum = extract_tag(kb);
    bnum.cmp(&anum)
}

/// A parsed view of an arena entry.
///
/// Borrows the key and value bytes in place; valid while the backing
/// arena is alive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ParsedEntry<'a> {
    pub user_key: &'a [u8],
    pub sequence: SequenceNumber,
    pub value_type: ValueType,
    pub value: &'a [u8],
}

impl<'a> ParsedEntry<'a> {
    /// Decodes the entry record starting at `p`.
    ///
    /// `p` must point at a well-formed arena entry that outlives `'a`.
    pub(crate) fn decode(p: *const u8) -> ParsedEntry<'a> {
        let (internal_key, value) = unsafe {
            let (internal_key, rest) = get_length_prefixed_slice_raw(p);
            let (value, _) = get_length_prefixed_slice_raw(rest);
            (internal_key, value)
        };
        let (sequence, value_type) = unpack_tag(extract_tag(internal_key));
        ParsedEntry { user_key: extract_user_key(internal_key), sequence, value_type, value }
    }
}

/// Encodes an entry record into `arena` and returns its pointer and
/// encoded length.
///
/// Layout: `varint32(klen) ∥ user_key ∥ tag ∥ varint32(vlen) ∥ value`
/// where `klen = user_key_len + 8` and the tag is `(seq << 8) | type`.
pub(crate) fn encode_entry(
    arena: &super::arena::Arena,
    seq: SequenceNumber,
    t: ValueType,
    key: &[u8],
    value: &[u8],
) -> (*const u8, usize) {
    use crate::coding::{encode_varint32_raw, put_fixed64_raw, varint_length};

    let internal_key_size = key.len() + INTERNAL_KEY_TAIL;
    let encoded_len = varint_length(internal_key_size as u64)
        + internal_key_size
        + varint_length(value.len() as u64)
        + value.len();
    let buf = arena.allocate(encoded_len);
    unsafe {
        let mut p = encode_varint32_raw(buf, internal_key_size as u32);
        std::ptr::copy_nonoverlapping(key.as_ptr(), p, key.len());
        p = p.add(key.len());
        p = put_fixed64_raw(p, pack_tag(seq, t));
        p = encode_varint32_raw(p, value.len() as u32);
        std::ptr::copy_nonoverlapping(value.as_ptr(), p, value.len());
        debug_assert_eq!(p.add(value.len()) as usize, buf as usize + encoded_len);
    }
    (buf as *const u8, encoded_len)
}

/// The probe form used by [`MemTable::get`](crate::MemTable::get).
///
/// Carries a user key and a sequence number marking the visibility
/// horizon, pre-encoded in the three shapes the lookup path needs:
///
/// ```text
/// ┌ memtable_key ──────────────────────────────┐
/// │ varint32(klen + 8) │ user_key │ tag(seq,Value) │
///                      └ internal_key ──────────┘
///                      └ user_key ┘
/// ```
///
/// Seeking the table to `memtable_key` positions at the newest version of
/// `user_key` with sequence ≤ the horizon.
pub struct LookupKey {
    data: Vec<u8>,
    key_start: usize,
}

impl LookupKey {
    /// Builds a lookup key for `user_key` visible at `sequence`.
    pub fn new(user_key: &[u8], sequence: SequenceNumber) -> Self {
        let internal_key_size = user_key.len() + INTERNAL_KEY_TAIL;
        let mut data = Vec::with_capacity(crate::coding::MAX_VARINT32_LENGTH + internal_key_size);
        encode_varint32(&mut data, internal_key_size as u32);
        let key_start = data.len();
        data.extend_from_slice(user_key);
        put_fixed64(&mut data, pack_tag(sequence, VALUE_TYPE_FOR_SEEK));
        Self { data, key_start }
    }

    /// The full length-prefixed form understood by the MemTable seek path.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal key (user key plus tag).
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.key_start..]
    }

    /// The bare user key.
    pub fn user_key(&self) -> &[u8] {
        &self.data[self.key_start..self.data.len() - INTERNAL_KEY_TAIL]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::BytewiseComparator;
    use crate::coding::put_length_prefixed_slice;

    fn icmp() -> InternalKeyComparator {
        InternalKeyComparator::new(Arc::new(BytewiseComparator))
    }

    fn internal_key(user_key: &[u8], seq: SequenceNumber, t: ValueType) -> Vec<u8> {
        let mut buf = user_key.to_vec();
        put_fixed64(&mut buf, pack_tag(seq, t));
        buf
    }

    #[test]
    fn test_tag_roundtrip() {
        for (seq, t) in [
            (0, ValueType::Deletion),
            (1, ValueType::Value),
            (12345, ValueType::Value),
            (MAX_SEQUENCE_NUMBER, ValueType::Deletion),
        ] {
            let (s, ty) = unpack_tag(pack_tag(seq, t));
            assert_eq!(s, seq);
            assert_eq!(ty, t);
        }
    }

    #[test]
    fn test_value_type_codes() {
        assert_eq!(ValueType::Deletion.as_u8(), 0);
        assert_eq!(ValueType::Value.as_u8(), 1);
        assert_eq!(ValueType::from_u8(0), Some(ValueType::Deletion));
        assert_eq!(ValueType::from_u8(1), Some(ValueType::Value));
        assert_eq!(ValueType::from_u8(2), None);
    }

    #[test]
    fn test_extract_user_key() {
        let ikey = internal_key(b"user", 42, ValueType::Value);
        assert_eq!(extract_user_key(&ikey), b"user");
        assert_eq!(extract_tag(&ikey), pack_tag(42, ValueType::Value));
    }

    #[test]
    fn test_internal_key_ordering() {
        let cmp = icmp();

        // User key ascending.
        let a = internal_key(b"a", 100, ValueType::Value);
        let b = internal_key(b"b", 100, ValueType::Value);
        assert_eq!(cmp.compare(&a, &b), Ordering::Less);

        // Same user key: sequence descending (newer first).
        let new = internal_key(b"k", 200, ValueType::Value);
        let old = internal_key(b"k", 100, ValueType::Value);
        assert_eq!(cmp.compare(&new, &old), Ordering::Less);

        // Same user key and sequence: type descending (Value first).
        let put = internal_key(b"k", 100, ValueType::Value);
        let del = internal_key(b"k", 100, ValueType::Deletion);
        assert_eq!(cmp.compare(&put, &del), Ordering::Less);
    }

    #[test]
    fn test_internal_key_sort_grid() {
        let cmp = icmp();
        let mut keys = vec![
            internal_key(b"k2", 100, ValueType::Value),
            internal_key(b"k1", 50, ValueType::Value),
            internal_key(b"k1", 100, ValueType::Deletion),
            internal_key(b"k1", 100, ValueType::Value),
            internal_key(b"k1", 150, ValueType::Value),
        ];
        keys.sort_by(|a, b| cmp.compare(a, b));

        assert_eq!(extract_user_key(&keys[0]), b"k1");
        assert_eq!(unpack_tag(extract_tag(&keys[0])), (150, ValueType::Value));
        assert_eq!(unpack_tag(extract_tag(&keys[1])), (100, ValueType::Value));
        assert_eq!(unpack_tag(extract_tag(&keys[2])), (100, ValueType::Deletion));
        assert_eq!(unpack_tag(extract_tag(&keys[3])), (50, ValueType::Value));
        assert_eq!(extract_user_key(&keys[4]), b"k2");
    }

    #[test]
    fn test_lookup_key_layout() {
        let lkey = LookupKey::new(b"mykey", 7);
        assert_eq!(lkey.user_key(), b"mykey");
        assert_eq!(lkey.internal_key().len(), 5 + INTERNAL_KEY_TAIL);
        assert_eq!(extract_user_key(lkey.internal_key()), b"mykey");
        assert_eq!(extract_tag(lkey.internal_key()), pack_tag(7, ValueType::Value));

        // memtable_key is the internal key with its varint32 prefix.
        let mk = lkey.memtable_key();
        assert_eq!(mk[0] as usize, lkey.internal_key().len());
        assert_eq!(&mk[1..], lkey.internal_key());
    }

    #[test]
    fn test_compare_sequence() {
        // Entry form: length-prefixed internal key followed by a
        // length-prefixed value.
        let entry = |seq| {
            let mut buf = Vec::new();
            put_length_prefixed_slice(&mut buf, &internal_key(b"k", seq, ValueType::Value));
            put_length_prefixed_slice(&mut buf, b"v");
            buf
        };
        let newer = entry(20);
        let older = entry(10);
        assert_eq!(compare_sequence(newer.as_ptr(), older.as_ptr()), Ordering::Less);
        assert_eq!(compare_sequence(older.as_ptr(), newer.as_ptr()), Ordering::Greater);
        assert_eq!(compare_sequence(newer.as_ptr(), newer.as_ptr()), Ordering::Equal);
    }

    #[test]
    fn test_parsed_entry_decode() {
        let mut buf = Vec::new();
        put_length_prefixed_slice(&mut buf, &internal_key(b"k1", 9, ValueType::Value));
        put_length_prefixed_slice(&mut buf, b"payload");

        let parsed = ParsedEntry::decode(buf.as_ptr());
        assert_eq!(parsed.user_key, b"k1");
        assert_eq!(parsed.sequence, 9);
        assert_eq!(parsed.value_type, ValueType::Value);
        assert_eq!(parsed.value, b"payload");
    }
}
