use crate::db::format::ValueType;
use crate::error::Error;
use crate::memtable::MemTable;
use crate::util::coding::{decode_fixed_32, decode_fixed_64, encode_fixed_32, encode_fixed_64, VarintU32};
use crate::util::comparator::Comparator;
use crate::IResult;

pub const HEADER_SIZE: usize = 12;

/// Visitor for the records of a `WriteBatch`, in insertion order.
pub trait Handler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// `WriteBatch` holds a collection of updates to apply atomically to a `DB`.
///
/// ```text
/// The contents structure.
///
///  +---------------------+
///  | sequence number (8) |  the starting seq number
///  +---------------------+
///  | data count (4)      |
///  +---------------------+
///  | data record         |
///  +---------------------+
///
/// The format of data record:
///
///  +----------+--------------+----------+----------------+------------+
///  | key type | key len(var) | key data | value len(var) | value data |
///  +----------+--------------+----------+----------------+------------+
///
/// ```
/// The updates are applied in the order in which they are added to the
/// `WriteBatch`, and a batch consumes one contiguous range of sequence
/// numbers equal to its record count.
///
/// The same buffer doubles as the durable log payload for a commit and as
/// the input replayed into the memtable.
#[derive(Clone)]
pub struct WriteBatch {
    contents: Vec<u8>,
}

impl Default for WriteBatch {
    fn default() -> Self {
        let contents = vec![0; HEADER_SIZE];
        Self { contents }
    }
}

impl WriteBatch {
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.contents.as_slice()
    }

    /// Stores the mapping "key -> value" in the database.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.get_count() + 1);
        self.contents.push(ValueType::KTypeValue as u8);
        VarintU32::put_varint_prefixed_slice(&mut self.contents, key);
        VarintU32::put_varint_prefixed_slice(&mut self.contents, value);
    }

    /// If the database contains a mapping for "key", erase it. Else do nothing.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.get_count() + 1);
        self.contents.push(ValueType::KTypeDeletion as u8);
        VarintU32::put_varint_prefixed_slice(&mut self.contents, key);
    }

    /// Copies the operations in `src` to this batch. The destination keeps
    /// its own starting sequence number.
    pub fn append(&mut self, src: WriteBatch) {
        assert!(
            src.contents.len() >= HEADER_SIZE,
            "[batch] malformed WriteBatch (too small) to append"
        );
        self.set_count(self.get_count() + src.get_count());
        self.contents.extend_from_slice(&src.contents[HEADER_SIZE..]);
    }

    /// Walks the records in insertion order, invoking `handler` for each.
    /// Fails with `Corruption` if the header is short, a tag is unknown, a
    /// length prefix is malformed, or the record count disagrees with the
    /// header.
    pub fn iterate(&self, handler: &mut dyn Handler) -> IResult<()> {
        if self.contents.len() < HEADER_SIZE {
            return Err(Error::Corruption("malformed WriteBatch (too small)"));
        }
        let mut s = &self.contents[HEADER_SIZE..];
        let mut found = 0;
        while !s.is_empty() {
            found += 1;
            let tag = s[0];
            s = &s[1..];
            match ValueType::from(u64::from(tag)) {
                ValueType::KTypeValue => {
                    match (
                        VarintU32::get_varint_prefixed_slice(&mut s),
                        VarintU32::get_varint_prefixed_slice(&mut s),
                    ) {
                        (Some(key), Some(value)) => handler.put(key, value),
                        _ => return Err(Error::Corruption("bad WriteBatch put")),
                    }
                }
                ValueType::KTypeDeletion => match VarintU32::get_varint_prefixed_slice(&mut s) {
                    Some(key) => handler.delete(key),
                    None => return Err(Error::Corruption("bad WriteBatch delete")),
                },
                ValueType::UnKnown => {
                    return Err(Error::Corruption("unknown WriteBatch value type"));
                }
            }
        }
        if found != self.get_count() {
            return Err(Error::Corruption("WriteBatch has wrong count"));
        }
        Ok(())
    }

    /// Inserts all the records in the batch into the given `MemTable`,
    /// assigning the batch's sequence numbers in order.
    pub fn insert_into<C: Comparator>(&self, mem: &MemTable<C>) -> IResult<()> {
        let mut inserter = MemTableInserter {
            sequence: self.get_sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }

    /// Clears all updates buffered in this batch.
    #[inline]
    pub fn clear(&mut self) {
        self.contents.clear();
        self.contents.resize(HEADER_SIZE, 0);
    }

    /// The size of the database changes caused by this batch.
    #[inline]
    pub fn approximate_size(&self) -> usize {
        self.contents.len()
    }

    /// Replaces the contents of this batch with `src`, which must carry at
    /// least a full header (used when replaying a log record).
    #[inline]
    pub fn set_contents(&mut self, src: &mut Vec<u8>) {
        assert!(
            src.len() >= HEADER_SIZE,
            "[batch] malformed WriteBatch contents (too small)"
        );
        self.contents.clear();
        self.contents.append(src);
    }

    /// Returns the number of entries included in this batch.
    #[inline]
    pub fn get_count(&self) -> u32 {
        decode_fixed_32(&self.contents[8..])
    }

    #[inline]
    pub(crate) fn set_count(&mut self, count: u32) {
        encode_fixed_32(&mut self.contents[8..], count)
    }

    #[inline]
    pub fn set_sequence(&mut self, seq: u64) {
        encode_fixed_64(&mut self.contents, seq)
    }

    /// Returns the seq number of this batch.
    #[inline]
    pub fn get_sequence(&self) -> u64 {
        decode_fixed_64(&self.contents)
    }

    /// Returns true when this batch contains no entries to be written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.get_count() == 0
    }
}

struct MemTableInserter<'a, C: Comparator> {
    sequence: u64,
    mem: &'a MemTable<C>,
}

impl<'a, C: Comparator> Handler for MemTableInserter<'a, C> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.sequence, ValueType::KTypeValue, key, value);
        self.sequence += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.sequence, ValueType::KTypeDeletion, key, b"");
        self.sequence += 1;
    }
}
