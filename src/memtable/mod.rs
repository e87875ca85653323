//! The mutable in-memory table that absorbs committed batches until it is
//! flushed into an sstable.

use std::cmp::Ordering;

use crate::db::format::{
    extract_user_key, pack_sequence_and_type, InternalKeyComparator, LookupKey, ValueType,
    INTERNAL_KEY_TAIL,
};
use crate::error::Error;
use crate::iterator::Iter;
use crate::memtable::skiplist::{Skiplist, SkiplistIterator};
use crate::util::coding::{decode_fixed_64, put_fixed_64, VarintU32};
use crate::util::comparator::Comparator;
use crate::IResult;

pub mod arena;
pub mod skiplist;

/// Every memtable entry is one contiguous arena buffer:
///
/// ```text
///   [varint32 internal_key_len][user key][tag][varint32 value_len][value]
/// ```
///
/// The prefix up to the tag is exactly a lookup key's memtable view, so a
/// `get` seeks with `LookupKey::memtable_key` directly.
fn decode_entry(entry: &[u8]) -> (&[u8], &[u8]) {
    let mut s = entry;
    let internal_key = VarintU32::get_varint_prefixed_slice(&mut s)
        .expect("[memtable] corrupted entry: bad internal key length");
    let value = VarintU32::get_varint_prefixed_slice(&mut s)
        .expect("[memtable] corrupted entry: bad value length");
    (internal_key, value)
}

/// Orders memtable entries by their internal-key portion.
#[derive(Clone)]
pub struct KeyComparator<C: Comparator> {
    icmp: InternalKeyComparator<C>,
}

impl<C: Comparator> Comparator for KeyComparator<C> {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let (a_key, _) = split_internal_key(a);
        let (b_key, _) = split_internal_key(b);
        self.icmp.compare(a_key, b_key)
    }

    fn name(&self) -> &str {
        "siltdb.MemTableKeyComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        let (start_key, _) = split_internal_key(start);
        let (limit_key, _) = split_internal_key(limit);
        self.icmp.find_shortest_separator(start_key, limit_key)
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let (internal_key, _) = split_internal_key(key);
        self.icmp.find_short_successor(internal_key)
    }
}

/// Slices the internal key out of an encoded entry (or an entry prefix,
/// like a lookup key's memtable view).
fn split_internal_key(entry: &[u8]) -> (&[u8], &[u8]) {
    let mut s = entry;
    let internal_key = VarintU32::get_varint_prefixed_slice(&mut s)
        .expect("[memtable] corrupted entry: bad internal key length");
    (internal_key, s)
}

pub struct MemTable<C: Comparator> {
    user_comparator: C,
    table: Skiplist<KeyComparator<C>>,
}

impl<C: Comparator> MemTable<C> {
    pub fn new(icmp: InternalKeyComparator<C>) -> Self {
        let user_comparator = icmp.user_comparator.clone();
        MemTable {
            user_comparator,
            table: Skiplist::new(KeyComparator { icmp }),
        }
    }

    /// An estimate of the bytes this table holds, used to decide when to
    /// rotate and flush it.
    pub fn approximate_memory_usage(&self) -> usize {
        self.table.memory_usage()
    }

    /// Adds an entry for `key -> value` at `seq`. A deletion is an entry
    /// whose tag carries the deletion type and whose value is empty.
    pub fn add(&self, seq: u64, t: ValueType, key: &[u8], value: &[u8]) {
        let internal_key_len = key.len() + INTERNAL_KEY_TAIL;
        let mut buf = Vec::with_capacity(
            VarintU32::common_length(internal_key_len as u32)
                + internal_key_len
                + VarintU32::common_length(value.len() as u32)
                + value.len(),
        );
        VarintU32::put_varint(&mut buf, internal_key_len as u32);
        buf.extend_from_slice(key);
        put_fixed_64(&mut buf, pack_sequence_and_type(seq, t));
        VarintU32::put_varint(&mut buf, value.len() as u32);
        buf.extend_from_slice(value);
        self.table.insert(&buf);
    }

    /// Looks up the newest entry for `key` visible at its sequence.
    /// Returns the value, `Err(NotFound)` when the newest entry is a
    /// deletion, or `None` when the table holds nothing for the key.
    pub fn get(&self, key: &LookupKey) -> Option<IResult<Vec<u8>>> {
        let mut iter = self.table.iter();
        iter.seek(key.memtable_key());
        if !iter.valid() {
            return None;
        }
        let (internal_key, value) = decode_entry(iter.key());
        // The seek landed at the first entry at or after (user_key, seq);
        // it only answers this lookup if the user key actually matches.
        if self
            .user_comparator
            .compare(extract_user_key(internal_key), key.user_key())
            != Ordering::Equal
        {
            return None;
        }
        let tag = decode_fixed_64(&internal_key[internal_key.len() - INTERNAL_KEY_TAIL..]);
        match ValueType::from(tag & 0xff) {
            ValueType::KTypeValue => Some(Ok(value.to_vec())),
            ValueType::KTypeDeletion => Some(Err(Error::NotFound)),
            ValueType::UnKnown => Some(Err(Error::Corruption("unknown value type in memtable"))),
        }
    }

    /// Iterates entries in internal-key order: ascending user key, then
    /// descending sequence.
    pub fn iter(&self) -> MemTableIterator<'_, C> {
        MemTableIterator {
            inner: self.table.iter(),
        }
    }
}

pub struct MemTableIterator<'a, C: Comparator> {
    inner: SkiplistIterator<'a, KeyComparator<C>>,
}

impl<'a, C: Comparator> Iter for MemTableIterator<'a, C> {
    fn valid(&self) -> bool {
        self.inner.valid()
    }

    fn seek_to_first(&mut self) {
        self.inner.seek_to_first()
    }

    fn seek_to_last(&mut self) {
        self.inner.seek_to_last()
    }

    /// `target` must be an internal key; it is wrapped in the entry
    /// framing the skiplist comparator expects.
    fn seek(&mut self, target: &[u8]) {
        let mut scratch = Vec::with_capacity(target.len() + 5);
        VarintU32::put_varint_prefixed_slice(&mut scratch, target);
        self.inner.seek(&scratch);
    }

    fn next(&mut self) {
        self.inner.next()
    }

    fn prev(&mut self) {
        self.inner.prev()
    }

    fn key(&self) -> &[u8] {
        let (internal_key, _) = split_internal_key(self.inner.key());
        internal_key
    }

    fn value(&self) -> &[u8] {
        let (_, rest) = split_internal_key(self.inner.key());
        let mut s = rest;
        VarintU32::get_varint_prefixed_slice(&mut s)
            .expect("[memtable] corrupted entry: bad value length")
    }

    fn status(&mut self) -> IResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format::{ParsedInternalKey, MAX_SEQUENCE_NUMBER};
    use crate::util::comparator::BytewiseComparator;

    fn new_mem() -> MemTable<BytewiseComparator> {
        MemTable::new(InternalKeyComparator::new(BytewiseComparator::default()))
    }

    #[test]
    fn test_get_returns_newest_visible() {
        let mem = new_mem();
        mem.add(1, ValueType::KTypeValue, b"k", b"v1");
        mem.add(2, ValueType::KTypeValue, b"k", b"v2");
        mem.add(3, ValueType::KTypeDeletion, b"k", b"");

        // Latest state: deleted.
        match mem.get(&LookupKey::new(b"k", MAX_SEQUENCE_NUMBER)) {
            Some(Err(Error::NotFound)) => {}
            other => panic!("expected deletion, got {:?}", other.map(|r| r.is_ok())),
        }
        // As of sequence 2 the value was v2.
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 2)).unwrap().unwrap(),
            b"v2".to_vec()
        );
        // As of sequence 1 the value was v1.
        assert_eq!(
            mem.get(&LookupKey::new(b"k", 1)).unwrap().unwrap(),
            b"v1".to_vec()
        );
        // Unknown key.
        assert!(mem.get(&LookupKey::new(b"other", 10)).is_none());
    }

    #[test]
    fn test_iteration_order() {
        let mem = new_mem();
        mem.add(100, ValueType::KTypeValue, b"a", b"va");
        mem.add(50, ValueType::KTypeValue, b"a", b"old");
        mem.add(75, ValueType::KTypeValue, b"b", b"vb");

        let mut iter = mem.iter();
        iter.seek_to_first();
        let mut seen = vec![];
        while iter.valid() {
            let parsed = ParsedInternalKey::parse_internal_key(iter.key()).unwrap();
            seen.push((
                parsed.user_key.to_vec(),
                parsed.sequence_number,
                iter.value().to_vec(),
            ));
            iter.next();
        }
        // Ascending user key, descending sequence within a key.
        assert_eq!(
            seen,
            vec![
                (b"a".to_vec(), 100, b"va".to_vec()),
                (b"a".to_vec(), 50, b"old".to_vec()),
                (b"b".to_vec(), 75, b"vb".to_vec()),
            ]
        );
    }

    #[test]
    fn test_iterator_seek_on_internal_key() {
        let mem = new_mem();
        for i in 0..100u32 {
            mem.add(
                u64::from(i) + 1,
                ValueType::KTypeValue,
                format!("key{:03}", i).as_bytes(),
                b"v",
            );
        }
        let mut iter = mem.iter();
        iter.seek(LookupKey::new(b"key050", MAX_SEQUENCE_NUMBER).internal_key());
        assert!(iter.valid());
        let parsed = ParsedInternalKey::parse_internal_key(iter.key()).unwrap();
        assert_eq!(parsed.user_key, b"key050");
    }

    #[test]
    fn test_memory_usage_reflects_adds() {
        let mem = new_mem();
        let before = mem.approximate_memory_usage();
        for i in 0..100u32 {
            mem.add(
                u64::from(i) + 1,
                ValueType::KTypeValue,
                format!("key{:03}", i).as_bytes(),
                &[b'x'; 100],
            );
        }
        assert!(mem.approximate_memory_usage() > before + 100 * 100);
    }
}
