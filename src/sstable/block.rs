use std::cmp::{min, Ordering};
use std::mem::size_of;

use bytes::Bytes;

use crate::error::Error;
use crate::iterator::Iter;
use crate::opt::Options;
use crate::util::coding::{decode_fixed_32, put_fixed_32, VarintU32};
use crate::util::comparator::Comparator;
use crate::IResult;

const U32_LEN: usize = size_of::<u32>();

/// `BlockBuilder` generates blocks where keys are prefix-compressed:
///
/// When we store a key, we drop the prefix shared with the previous
/// string. This helps reduce the space requirement significantly.
/// Furthermore, once every K keys, we do not apply the prefix
/// compression and store the entire key. We call this a "restart point".
/// The tail end of the block stores the offsets of all the restart points,
/// and can be used to do a binary search when looking for a particular
/// key. Values are stored as-is (without compression) immediately
/// following the corresponding key.
///
/// An entry for a particular key-value pair has the form:
///     shared_bytes: varint32
///     unshared_bytes: varint32
///     value_length: varint32
///     key_delta: u8[unshared_bytes]
///     value: u8[value_length]
/// shared_bytes == 0 for restart points.
///
/// The trailer of the block has the form:
///     restarts: u32[num_restarts]
///     num_restarts: u32
/// restarts[i] contains the offset within the block of the ith restart
/// point.
#[derive(Debug)]
pub struct BlockBuilder<C: Comparator> {
    c: C,
    block_restart_interval: u32,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    counter: u32,
    finished: bool,
    last_key: Vec<u8>,
}

impl<C: Comparator> BlockBuilder<C> {
    pub fn new(options: &Options, c: C) -> Self {
        assert!(
            options.block_restart_interval >= 1,
            "[block builder] block restart interval must be at least 1, but got {}",
            options.block_restart_interval
        );
        BlockBuilder {
            c,
            block_restart_interval: options.block_restart_interval,
            buffer: vec![],
            restarts: vec![0], // First restart point is at offset 0.
            counter: 0,
            finished: false,
            last_key: vec![],
        }
    }

    /// Resets the contents as if the `BlockBuilder` was just constructed.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.restarts.clear();
        self.restarts.push(0); // First restart point is at offset 0.
        self.counter = 0;
        self.finished = false;
        self.last_key.clear();
    }

    /// Appends an entry.
    ///
    /// # Panics
    ///
    /// * `finish()` has been called since the last `reset()`.
    /// * `key` is not larger than any previously added key.
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        assert!(
            !self.finished,
            "[block builder] add called on a finished block"
        );
        assert!(
            self.counter <= self.block_restart_interval,
            "[block builder] the entry counter overran the restart interval {}",
            self.block_restart_interval
        );
        assert!(
            self.empty() || self.c.compare(key, self.last_key.as_slice()) == Ordering::Greater,
            "[block builder] the given key must be greater than the last key {:?}",
            self.last_key
        );

        let mut shared = 0;
        if self.counter < self.block_restart_interval {
            // See how much sharing to do with the previous key.
            let min_length = min(self.last_key.len(), key.len());
            while shared < min_length && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            // Restart compression.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }

        let non_shared = key.len() - shared;

        // Add "<shared><non_shared><value_size>" to the buffer.
        VarintU32::put_varint(&mut self.buffer, shared as u32);
        VarintU32::put_varint(&mut self.buffer, non_shared as u32);
        VarintU32::put_varint(&mut self.buffer, value.len() as u32);

        // Add the key delta to the buffer followed by the value.
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Finishes building the block and returns a slice that refers to the
    /// block contents. The returned slice remains valid for the lifetime
    /// of this builder or until `reset()` is called.
    pub fn finish(&mut self) -> &[u8] {
        // Append the restart array.
        for i in 0..self.restarts.len() {
            put_fixed_32(&mut self.buffer, self.restarts[i]);
        }
        put_fixed_32(&mut self.buffer, self.restarts.len() as u32);
        self.finished = true;
        self.buffer.as_slice()
    }

    /// Returns an estimate of the current (uncompressed) size of the block
    /// we are building.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len()    // Raw data buffer.
            + self.restarts.len() * U32_LEN // Restart array.
            + U32_LEN // Restart array length.
    }

    /// Returns true iff no entries have been added since the last
    /// `reset()`.
    pub fn empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// An immutable, parsed block. Cheap to share: iterators hold a reference
/// to the same underlying bytes.
#[derive(Debug)]
pub struct Block {
    data: Bytes,
    // Offset in data of the restart array.
    restart_offset: u32,
    num_restarts: u32,
}

impl Block {
    /// Takes ownership of the decoded block payload and validates its
    /// restart trailer.
    pub fn new(data: Vec<u8>) -> IResult<Self> {
        let size = data.len();
        if size < U32_LEN {
            return Err(Error::Corruption("bad block contents"));
        }
        let num_restarts = decode_fixed_32(&data[size - U32_LEN..]);
        let max_restarts_allowed = (size - U32_LEN) / U32_LEN;
        if num_restarts == 0 || num_restarts as usize > max_restarts_allowed {
            // The size is too small to hold num_restarts entries.
            return Err(Error::Corruption("bad block contents"));
        }
        let restart_offset = (size - (1 + num_restarts as usize) * U32_LEN) as u32;
        Ok(Block {
            data: Bytes::from(data),
            restart_offset,
            num_restarts,
        })
    }

    pub fn iter<C: Comparator>(&self, c: C) -> BlockIterator<C> {
        BlockIterator::new(c, self.data.clone(), self.restart_offset, self.num_restarts)
    }

    /// The in-memory footprint of the block, used as its cache charge.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Decodes the entry header starting at `offset`, bounded by `limit`.
/// Returns `(shared, non_shared, value_len, header_len)`, or `None` if
/// the header is malformed or the entry body overruns the limit.
fn decode_entry(data: &[u8], offset: usize, limit: usize) -> Option<(usize, usize, usize, usize)> {
    let mut s = data.get(offset..limit)?;
    let before = s.len();
    let shared = VarintU32::drain_read(&mut s)? as usize;
    let non_shared = VarintU32::drain_read(&mut s)? as usize;
    let value_len = VarintU32::drain_read(&mut s)? as usize;
    let header_len = before - s.len();
    if offset + header_len + non_shared + value_len > limit {
        return None;
    }
    Some((shared, non_shared, value_len, header_len))
}

/// Walks a block's entries, reconstructing prefix-compressed keys and
/// binary-searching the restart array on `seek`. Corruption is sticky:
/// the iterator becomes invalid and `status()` reports the error.
pub struct BlockIterator<C: Comparator> {
    c: C,
    data: Bytes,
    // Offset of the restart array (list of fixed32) in data.
    restarts: u32,
    num_restarts: u32,
    // Offset of the current entry in data; >= restarts when invalid.
    current: u32,
    // Index of the restart block in which current falls.
    restart_index: u32,
    key: Vec<u8>,
    value_offset: u32,
    value_len: u32,
    err: Option<Error>,
}

impl<C: Comparator> BlockIterator<C> {
    fn new(c: C, data: Bytes, restarts: u32, num_restarts: u32) -> Self {
        assert!(
            num_restarts > 0,
            "[block iterator] a block must have at least one restart point"
        );
        BlockIterator {
            c,
            data,
            restarts,
            num_restarts,
            current: restarts,
            restart_index: num_restarts,
            key: vec![],
            value_offset: restarts,
            value_len: 0,
            err: None,
        }
    }

    #[inline]
    fn restart_point(&self, index: u32) -> u32 {
        decode_fixed_32(&self.data[self.restarts as usize + U32_LEN * index as usize..])
    }

    /// The offset just past the end of the current entry.
    #[inline]
    fn next_entry_offset(&self) -> u32 {
        self.value_offset + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: u32) {
        self.key.clear();
        self.restart_index = index;
        self.current = self.restart_point(index);
        // parse_next_key picks up from next_entry_offset.
        self.value_offset = self.current;
        self.value_len = 0;
    }

    fn corruption_error(&mut self, reason: &'static str) {
        if self.err.is_none() {
            self.err = Some(Error::Corruption(reason));
        }
        self.current = self.restarts;
        self.restart_index = self.num_restarts;
        self.key.clear();
        self.value_offset = self.restarts;
        self.value_len = 0;
    }

    /// Decodes the entry at `next_entry_offset`, making it current.
    /// Returns false at the end of the block or on corruption.
    fn parse_next_key(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.restarts {
            // No more entries, mark as invalid.
            self.current = self.restarts;
            self.restart_index = self.num_restarts;
            return false;
        }
        match decode_entry(&self.data, self.current as usize, self.restarts as usize) {
            Some((shared, non_shared, value_len, header_len)) => {
                if self.key.len() < shared {
                    self.corruption_error("corrupted shared key prefix in block");
                    return false;
                }
                let delta_start = self.current as usize + header_len;
                self.key.truncate(shared);
                self.key
                    .extend_from_slice(&self.data[delta_start..delta_start + non_shared]);
                self.value_offset = (delta_start + non_shared) as u32;
                self.value_len = value_len as u32;
                while self.restart_index + 1 < self.num_restarts
                    && self.restart_point(self.restart_index + 1) < self.current
                {
                    self.restart_index += 1;
                }
                true
            }
            None => {
                self.corruption_error("bad entry in block");
                false
            }
        }
    }
}

impl<C: Comparator> Iter for BlockIterator<C> {
    fn valid(&self) -> bool {
        self.err.is_none() && self.current < self.restarts
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart_point(0);
        self.parse_next_key();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart_point(self.num_restarts - 1);
        // Keep parsing until we hit the restart array.
        while self.parse_next_key() && self.next_entry_offset() < self.restarts {}
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search in the restart array to find the last restart
        // point with a key < target.
        let mut left = 0u32;
        let mut right = self.num_restarts - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let region_offset = self.restart_point(mid) as usize;
            match decode_entry(&self.data, region_offset, self.restarts as usize) {
                Some((shared, non_shared, _, header_len)) => {
                    if shared != 0 {
                        // A restart key never shares a prefix.
                        self.corruption_error("corrupted restart key in block");
                        return;
                    }
                    let key_start = region_offset + header_len;
                    let mid_key = &self.data[key_start..key_start + non_shared];
                    if self.c.compare(mid_key, target) == Ordering::Less {
                        // Key at mid is smaller than target; therefore all
                        // keys before mid are uninteresting.
                        left = mid;
                    } else {
                        // Key at mid is >= target; therefore all keys at or
                        // after mid are uninteresting.
                        right = mid - 1;
                    }
                }
                None => {
                    self.corruption_error("bad entry in block");
                    return;
                }
            }
        }

        // Linear scan within the restart block for the first key >= target.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_key() {
                return;
            }
            if self.c.compare(&self.key, target) != Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        assert!(
            self.valid(),
            "[block iterator] `next` called on an invalid iterator"
        );
        self.parse_next_key();
    }

    fn prev(&mut self) {
        assert!(
            self.valid(),
            "[block iterator] `prev` called on an invalid iterator"
        );
        // Scan backwards to a restart point before current.
        let original = self.current;
        while self.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                // No more entries.
                self.current = self.restarts;
                self.restart_index = self.num_restarts;
                self.key.clear();
                self.value_offset = self.restarts;
                self.value_len = 0;
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        // Parse entries until the end of one touches the start of the
        // original entry; that one is the predecessor.
        while self.parse_next_key() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        assert!(
            self.valid(),
            "[block iterator] `key` called on an invalid iterator"
        );
        &self.key
    }

    fn value(&self) -> &[u8] {
        assert!(
            self.valid(),
            "[block iterator] `value` called on an invalid iterator"
        );
        &self.data[self.value_offset as usize..(self.value_offset + self.value_len) as usize]
    }

    fn status(&mut self) -> IResult<()> {
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
