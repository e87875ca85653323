use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::util::coding::{decode_fixed_64, put_fixed_64, VarintU32};
use crate::util::comparator::Comparator;

/// The tail bytes length of an internal key:
/// 7 bytes sequence number + 1 byte type number packed into a u64 tag.
pub const INTERNAL_KEY_TAIL: usize = 8;

/// We leave eight bits empty at the bottom of the tag so a type and
/// sequence# can be packed together into 64 bits.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << 56) - 1;

/// `VALUE_TYPE_FOR_SEEK` defines the `ValueType` that should be passed
/// when constructing an internal key for seeking to a particular sequence
/// number. Since tags sort in decreasing order among equal user keys and
/// the type occupies the low 8 bits, this is the highest-numbered type.
pub const VALUE_TYPE_FOR_SEEK: ValueType = ValueType::KTypeValue;

/// Value types encoded as the last component of internal keys.
/// DO NOT CHANGE THESE ENUM VALUES: they are embedded in the on-disk
/// data structures.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ValueType {
    KTypeDeletion = 0x0,
    KTypeValue = 0x1,
    UnKnown,
}

impl From<u64> for ValueType {
    fn from(v: u64) -> Self {
        match v {
            0x0 => ValueType::KTypeDeletion,
            0x1 => ValueType::KTypeValue,
            _ => ValueType::UnKnown,
        }
    }
}

/// Packs a sequence number and a value type into a tag.
#[inline]
pub fn pack_sequence_and_type(seq: u64, t: ValueType) -> u64 {
    assert!(
        seq <= MAX_SEQUENCE_NUMBER,
        "sequence number {} overflows 56 bits",
        seq
    );
    (seq << 8) | t as u64
}

/// Appends `user_key` followed by the packed tag to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: u64, t: ValueType) {
    dst.extend_from_slice(user_key);
    put_fixed_64(dst, pack_sequence_and_type(seq, t));
}

/// Returns the user key portion of an internal key.
#[inline]
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    debug_assert!(
        internal_key.len() >= INTERNAL_KEY_TAIL,
        "internal key is shorter than its tag: {}",
        internal_key.len()
    );
    &internal_key[..internal_key.len() - INTERNAL_KEY_TAIL]
}

/// An internal key split into its three components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedInternalKey<'a> {
    pub user_key: &'a [u8],
    pub sequence_number: u64,
    pub value_type: ValueType,
}

impl<'a> ParsedInternalKey<'a> {
    /// Decodes `internal_key`, or returns `None` if it is shorter than a
    /// tag or carries an unknown value type.
    pub fn parse_internal_key(internal_key: &'a [u8]) -> Option<Self> {
        let n = internal_key.len();
        if n < INTERNAL_KEY_TAIL {
            return None;
        }
        let tag = decode_fixed_64(&internal_key[n - INTERNAL_KEY_TAIL..]);
        let value_type = ValueType::from(tag & 0xff);
        if value_type == ValueType::UnKnown {
            return None;
        }
        Some(ParsedInternalKey {
            user_key: &internal_key[..n - INTERNAL_KEY_TAIL],
            sequence_number: tag >> 8,
            value_type,
        })
    }

    pub fn extract_user_key_str(&self) -> &str {
        std::str::from_utf8(self.user_key).unwrap_or("<invalid utf8>")
    }
}

/// An owned internal key. Modules in this crate keep internal keys wrapped
/// in this type instead of plain byte vectors so that a bytewise
/// comparison is never used where an `InternalKeyComparator` is required.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternalKey {
    rep: Vec<u8>,
}

impl InternalKey {
    pub fn new(user_key: &[u8], seq: u64, t: ValueType) -> Self {
        let mut rep = Vec::with_capacity(user_key.len() + INTERNAL_KEY_TAIL);
        append_internal_key(&mut rep, user_key, seq, t);
        InternalKey { rep }
    }

    pub fn decoded_from(src: &[u8]) -> Self {
        InternalKey { rep: src.to_vec() }
    }

    /// An empty `rep` marks the key as invalid.
    pub fn is_empty(&self) -> bool {
        self.rep.is_empty()
    }

    pub fn encoded(&self) -> &[u8] {
        &self.rep
    }

    pub fn user_key(&self) -> &[u8] {
        extract_user_key(&self.rep)
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match ParsedInternalKey::parse_internal_key(&self.rep) {
            Some(parsed) => write!(
                f,
                "'{}' @ {} : {:?}",
                parsed.extract_user_key_str(),
                parsed.sequence_number,
                parsed.value_type
            ),
            None => write!(f, "(bad){:?}", self.rep),
        }
    }
}

/// A comparator for internal keys that uses a supplied comparator for the
/// user key portion and breaks ties by decreasing sequence number, so the
/// newest entry for a user key sorts first.
#[derive(Clone)]
pub struct InternalKeyComparator<C: Comparator> {
    pub user_comparator: C,
}

impl<C: Comparator> InternalKeyComparator<C> {
    pub fn new(user_comparator: C) -> Self {
        InternalKeyComparator { user_comparator }
    }
}

impl<C: Comparator> Comparator for InternalKeyComparator<C> {
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        // Order by:
        //    increasing user key (according to the user-supplied comparator)
        //    decreasing sequence number
        //    decreasing type (though sequence# should be enough to disambiguate)
        match self
            .user_comparator
            .compare(extract_user_key(a), extract_user_key(b))
        {
            Ordering::Equal => {
                let a_tag = decode_fixed_64(&a[a.len() - INTERNAL_KEY_TAIL..]);
                let b_tag = decode_fixed_64(&b[b.len() - INTERNAL_KEY_TAIL..]);
                b_tag.cmp(&a_tag)
            }
            ord => ord,
        }
    }

    fn name(&self) -> &str {
        "siltdb.InternalKeyComparator"
    }

    fn find_shortest_separator(&self, start: &[u8], limit: &[u8]) -> Vec<u8> {
        // Attempt to shorten the user portion of the key.
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = self
            .user_comparator
            .find_shortest_separator(user_start, user_limit);
        if tmp.len() < user_start.len()
            && self.user_comparator.compare(user_start, &tmp) == Ordering::Less
        {
            // User key has become shorter physically, but larger logically.
            // Tack on the earliest possible number to the shortened user key.
            put_fixed_64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            return tmp;
        }
        start.to_owned()
    }

    fn find_short_successor(&self, key: &[u8]) -> Vec<u8> {
        let user_key = extract_user_key(key);
        let mut tmp = self.user_comparator.find_short_successor(user_key);
        if tmp.len() < user_key.len()
            && self.user_comparator.compare(user_key, &tmp) == Ordering::Less
        {
            put_fixed_64(
                &mut tmp,
                pack_sequence_and_type(MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            );
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            return tmp;
        }
        key.to_owned()
    }
}

/// Filter policy wrapper that converts from internal keys to user keys,
/// so filters built while streaming internal keys into a table match the
/// user keys probed at read time.
pub struct InternalFilterPolicy {
    user_policy: Arc<dyn FilterPolicy>,
}

impl InternalFilterPolicy {
    pub fn new(user_policy: Arc<dyn FilterPolicy>) -> Self {
        InternalFilterPolicy { user_policy }
    }
}

impl FilterPolicy for InternalFilterPolicy {
    fn name(&self) -> &str {
        self.user_policy.name()
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        let user_keys: Vec<Vec<u8>> = keys.iter().map(|k| extract_user_key(k).to_vec()).collect();
        self.user_policy.create_filter(&user_keys)
    }

    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool {
        self.user_policy.key_may_match(filter, extract_user_key(key))
    }
}

const LOOKUP_KEY_INLINE_LEN: usize = 200;

enum LookupKeyData {
    Inline([u8; LOOKUP_KEY_INLINE_LEN]),
    Heap(Vec<u8>),
}

/// A `LookupKey` represents a `get` request for a user key as of a
/// specific sequence number. It is a single buffer with three views:
///
/// ```text
///   +---------------------------------+
///   | varint32 of internal key length |
///   +---------------------------------+ ---------------- user key start
///   | user key bytes                  |
///   +---------------------------------+    internal key
///   | sequence (7)         | type (1) |
///   +---------------------------------+ ----------------
/// ```
///
/// Short keys live in an inline buffer; longer keys allocate once.
pub struct LookupKey {
    data: LookupKeyData,
    // Offset of the user key within the buffer.
    kstart: usize,
    len: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], sequence: u64) -> Self {
        let klen = user_key.len() + INTERNAL_KEY_TAIL;
        let kstart = VarintU32::common_length(klen as u32);
        let needed = kstart + klen;

        let mut scratch = Vec::with_capacity(needed);
        VarintU32::put_varint(&mut scratch, klen as u32);
        scratch.extend_from_slice(user_key);
        put_fixed_64(
            &mut scratch,
            pack_sequence_and_type(sequence, VALUE_TYPE_FOR_SEEK),
        );
        debug_assert_eq!(scratch.len(), needed);

        let data = if needed <= LOOKUP_KEY_INLINE_LEN {
            let mut space = [0u8; LOOKUP_KEY_INLINE_LEN];
            space[..needed].copy_from_slice(&scratch);
            LookupKeyData::Inline(space)
        } else {
            LookupKeyData::Heap(scratch)
        };
        LookupKey {
            data,
            kstart,
            len: needed,
        }
    }

    fn buf(&self) -> &[u8] {
        match &self.data {
            LookupKeyData::Inline(space) => &space[..self.len],
            LookupKeyData::Heap(v) => v,
        }
    }

    /// Returns a key suitable for lookup in a memtable.
    pub fn memtable_key(&self) -> &[u8] {
        self.buf()
    }

    /// Returns an internal key (suitable for passing to an internal
    /// iterator).
    pub fn internal_key(&self) -> &[u8] {
        &self.buf()[self.kstart..]
    }

    /// Returns the user key.
    pub fn user_key(&self) -> &[u8] {
        let buf = self.buf();
        &buf[self.kstart..buf.len() - INTERNAL_KEY_TAIL]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::comparator::BytewiseComparator;

    fn ikey(user_key: &[u8], seq: u64, t: ValueType) -> Vec<u8> {
        let mut v = vec![];
        append_internal_key(&mut v, user_key, seq, t);
        v
    }

    fn shorten<C: Comparator>(c: &C, s: &[u8], l: &[u8]) -> Vec<u8> {
        c.find_shortest_separator(s, l)
    }

    #[test]
    fn test_internal_key_encode_decode() {
        let keys: Vec<&[u8]> = vec![b"", b"k", b"hello", b"longggggggggggggggggggggg"];
        let seqs = [
            1,
            2,
            3,
            (1u64 << 8) - 1,
            1 << 8,
            (1 << 8) + 1,
            (1u64 << 16) - 1,
            1 << 16,
            (1 << 16) + 1,
            (1u64 << 32) - 1,
            1 << 32,
            (1 << 32) + 1,
            MAX_SEQUENCE_NUMBER,
        ];
        for &key in &keys {
            for &seq in &seqs {
                for t in [ValueType::KTypeValue, ValueType::KTypeDeletion] {
                    let encoded = ikey(key, seq, t);
                    let parsed = ParsedInternalKey::parse_internal_key(&encoded).unwrap();
                    assert_eq!(parsed.user_key, key);
                    assert_eq!(parsed.sequence_number, seq);
                    assert_eq!(parsed.value_type, t);
                    assert_eq!(extract_user_key(&encoded), key);
                }
            }
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(ParsedInternalKey::parse_internal_key(b"").is_none());
        assert!(ParsedInternalKey::parse_internal_key(b"short").is_none());
        // Unknown value type.
        let mut bad = vec![];
        bad.extend_from_slice(b"key");
        put_fixed_64(&mut bad, (5 << 8) | 0x7f);
        assert!(ParsedInternalKey::parse_internal_key(&bad).is_none());
    }

    #[test]
    fn test_internal_key_ordering() {
        // For user keys "a" < "b" with sequences (100, value) and
        // (50, value): (a,100) < (a,50) < (b,100) < (b,50).
        let icmp = InternalKeyComparator::new(BytewiseComparator::default());
        let a100 = ikey(b"a", 100, ValueType::KTypeValue);
        let a50 = ikey(b"a", 50, ValueType::KTypeValue);
        let b100 = ikey(b"b", 100, ValueType::KTypeValue);
        let b50 = ikey(b"b", 50, ValueType::KTypeValue);
        assert_eq!(icmp.compare(&a100, &a50), Ordering::Less);
        assert_eq!(icmp.compare(&a50, &b100), Ordering::Less);
        assert_eq!(icmp.compare(&b100, &b50), Ordering::Less);
        assert_eq!(icmp.compare(&a100, &a100), Ordering::Equal);
        assert_eq!(icmp.compare(&b50, &a100), Ordering::Greater);
    }

    #[test]
    fn test_internal_key_short_separator() {
        let icmp = InternalKeyComparator::new(BytewiseComparator::default());
        // When user keys are same, do not shorten.
        assert_eq!(
            ikey(b"foo", 100, ValueType::KTypeValue),
            shorten(
                &icmp,
                &ikey(b"foo", 100, ValueType::KTypeValue),
                &ikey(b"foo", 99, ValueType::KTypeValue)
            )
        );
        // When user keys are misordered, do not shorten.
        assert_eq!(
            ikey(b"foo", 100, ValueType::KTypeValue),
            shorten(
                &icmp,
                &ikey(b"foo", 100, ValueType::KTypeValue),
                &ikey(b"bar", 99, ValueType::KTypeValue)
            )
        );
        // When user keys are different, but correctly ordered.
        assert_eq!(
            ikey(b"g", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            shorten(
                &icmp,
                &ikey(b"foo", 100, ValueType::KTypeValue),
                &ikey(b"hello", 200, ValueType::KTypeValue)
            )
        );
        // When start user key is a prefix of limit user key.
        assert_eq!(
            ikey(b"foo", 100, ValueType::KTypeValue),
            shorten(
                &icmp,
                &ikey(b"foo", 100, ValueType::KTypeValue),
                &ikey(b"foobar", 200, ValueType::KTypeValue)
            )
        );
    }

    #[test]
    fn test_internal_key_shortest_successor() {
        let icmp = InternalKeyComparator::new(BytewiseComparator::default());
        assert_eq!(
            ikey(b"g", MAX_SEQUENCE_NUMBER, VALUE_TYPE_FOR_SEEK),
            icmp.find_short_successor(&ikey(b"foo", 100, ValueType::KTypeValue))
        );
        assert_eq!(
            ikey(&[0xff, 0xff], 100, ValueType::KTypeValue),
            icmp.find_short_successor(&ikey(&[0xff, 0xff], 100, ValueType::KTypeValue))
        );
    }

    #[test]
    fn test_internal_filter_policy_strips_tags() {
        use crate::filter::bloom::BloomFilter;

        let policy = InternalFilterPolicy::new(Arc::new(BloomFilter::new(10)));
        let keys: Vec<Vec<u8>> = (0..100u64)
            .map(|i| ikey(format!("key{:03}", i).as_bytes(), i + 1, ValueType::KTypeValue))
            .collect();
        let filter = policy.create_filter(&keys);
        // Probing with a different sequence number still matches, since
        // the filter works on user keys.
        for i in 0..100u64 {
            let probe = ikey(
                format!("key{:03}", i).as_bytes(),
                MAX_SEQUENCE_NUMBER,
                VALUE_TYPE_FOR_SEEK,
            );
            assert!(policy.key_may_match(&filter, &probe));
        }
    }

    #[test]
    fn test_lookup_key_views() {
        for (user_key, seq) in [
            (b"".to_vec(), 0u64),
            (b"foo".to_vec(), 42),
            (vec![b'x'; 150], 7),
            (vec![b'y'; 500], MAX_SEQUENCE_NUMBER),
        ] {
            let lk = LookupKey::new(&user_key, seq);
            assert_eq!(lk.user_key(), user_key.as_slice());
            let internal = lk.internal_key();
            let parsed = ParsedInternalKey::parse_internal_key(internal).unwrap();
            assert_eq!(parsed.user_key, user_key.as_slice());
            assert_eq!(parsed.sequence_number, seq);
            assert_eq!(parsed.value_type, VALUE_TYPE_FOR_SEEK);

            // The memtable view is the varint length prefix plus the
            // internal key.
            let mut mem = lk.memtable_key();
            let decoded = VarintU32::get_varint_prefixed_slice(&mut mem).unwrap();
            assert_eq!(decoded, internal);
            assert!(mem.is_empty());
        }
    }
}
