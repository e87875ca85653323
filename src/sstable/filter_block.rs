use std::sync::Arc;

use crate::filter::FilterPolicy;
use crate::util::coding::{decode_fixed_32, put_fixed_32};

/// Generate a new filter for every 2 KiB of data-file offset range.
const FILTER_BASE_LG: usize = 11;
const FILTER_BASE: usize = 1 << FILTER_BASE_LG;

/// `FilterBlockBuilder` constructs the filter block of a table. One filter
/// is kept per 2 KiB range of the data file, so a reader can map a data
/// block's offset straight to the filter that summarizes its keys.
///
/// Filter block layout:
///
/// ```text
///      + offset 1      + offset 2      + offset n      + trailer offset
///     /               /               /               /
///    +---------------+---------------+---------------+----------------------------------+
///    | filter data 1 |      ...      | filter data n | offsets * n | len | base lg (=11) |
///    +---------------+---------------+---------------+----------------------------------+
/// ```
///
/// The filter block is stored uncompressed.
pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    // Keys waiting to be folded into the next generated filter.
    keys: Vec<Vec<u8>>,
    result: Vec<u8>,
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: vec![],
            result: vec![],
            filter_offsets: vec![],
        }
    }

    /// Tells the builder that a new data block begins at `block_offset`.
    /// Generates filters until the offset array covers that offset.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset as usize / FILTER_BASE;
        assert!(
            filter_index >= self.filter_offsets.len(),
            "[filter block builder] data blocks must start at increasing offsets"
        );
        while filter_index > self.filter_offsets.len() {
            self.generate_filter();
        }
    }

    /// Records a key for the filter covering the current block span.
    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Finishes the block and returns its encoded contents.
    pub fn finish(&mut self) -> &[u8] {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        // Append the per-filter offsets and the trailer.
        let array_offset = self.result.len() as u32;
        for i in 0..self.filter_offsets.len() {
            let offset = self.filter_offsets[i];
            put_fixed_32(&mut self.result, offset);
        }
        put_fixed_32(&mut self.result, array_offset);
        self.result.push(FILTER_BASE_LG as u8);
        self.result.as_slice()
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Fast path if there are no keys for this filter.
            return;
        }
        let filter = self.policy.create_filter(&self.keys);
        self.result.extend_from_slice(&filter);
        self.keys.clear();
    }
}

/// Reads the filter block written by `FilterBlockBuilder`. A malformed
/// trailer yields a reader that matches everything, since a broken filter
/// must never hide real keys.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    data: Vec<u8>,
    // Offset of the filter-offset array within data.
    offset: usize,
    num_filters: usize,
    base_lg: usize,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Vec<u8>) -> Self {
        let mut r = FilterBlockReader {
            policy,
            data: vec![],
            offset: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = contents.len();
        if n < 5 {
            // 1 byte for base_lg and 4 for the array offset.
            return r;
        }
        r.base_lg = contents[n - 1] as usize;
        let array_offset = decode_fixed_32(&contents[n - 5..]) as usize;
        if array_offset > n - 5 {
            return r;
        }
        r.num_filters = (n - 5 - array_offset) / 4;
        r.offset = array_offset;
        r.data = contents;
        r
    }

    /// Returns true if the key may be present in the data block starting
    /// at `block_offset`.
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = block_offset as usize >> self.base_lg;
        if index < self.num_filters {
            let start = decode_fixed_32(&self.data[self.offset + index * 4..]) as usize;
            let limit = decode_fixed_32(&self.data[self.offset + (index + 1) * 4..]) as usize;
            if start <= limit && limit <= self.offset {
                let filter = &self.data[start..limit];
                return self.policy.key_may_match(filter, key);
            } else if start == limit {
                // Empty filters do not match any keys.
                return false;
            }
        }
        // Errors are treated as potential matches.
        true
    }
}
