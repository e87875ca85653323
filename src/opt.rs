use std::sync::Arc;

use crate::cache::ShardedLRUCache;
use crate::filter::FilterPolicy;
use crate::sstable::block::Block;

/// How a stored block's payload is encoded. The discriminants are written
/// into the one-byte block trailer; anything else surfaces as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    KNoCompression = 1,
    KSnappyCompression = 2,
    Unknown,
}

impl From<u8> for CompressionType {
    fn from(v: u8) -> Self {
        match v {
            1 => CompressionType::KNoCompression,
            2 => CompressionType::KSnappyCompression,
            _ => CompressionType::Unknown,
        }
    }
}

/// Knobs controlling table building and reading. Comparators are passed
/// separately so the same `Options` can serve both user-key and
/// internal-key layers.
#[derive(Clone)]
pub struct Options {
    /// Approximate size of user data packed per block. The on-disk size
    /// may differ because of compression and the block trailer.
    pub block_size: usize,

    /// Number of keys between restart points for prefix compression.
    pub block_restart_interval: u32,

    /// Compression applied to data blocks (filter and meta blocks are
    /// always stored raw).
    pub compression: CompressionType,

    /// If set, every table gets a filter block for cheap negative lookups.
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,

    /// If set, verify checksums aggressively on every internal read.
    pub paranoid_checks: bool,

    /// Shared cache of decoded data blocks, keyed by (file number, offset).
    pub block_cache: Option<Arc<ShardedLRUCache<Arc<Block>>>>,

    /// Number of open tables the table cache retains.
    pub max_open_files: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            block_size: 4096,
            block_restart_interval: 16,
            compression: CompressionType::KSnappyCompression,
            filter_policy: None,
            paranoid_checks: false,
            block_cache: None,
            max_open_files: 1000,
        }
    }
}

/// Options for read operations.
#[derive(Clone, Copy)]
pub struct ReadOptions {
    /// Verify block checksums on every read.
    pub verify_checksums: bool,
    /// Populate the block cache with blocks read on behalf of this
    /// operation.
    pub fill_cache: bool,
    /// Read as of this sequence number instead of the latest state.
    pub snapshot: Option<u64>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            verify_checksums: false,
            fill_cache: true,
            snapshot: None,
        }
    }
}

/// Options for write operations.
#[derive(Clone, Copy, Default)]
pub struct WriteOptions {
    /// fsync the log before acknowledging the write.
    pub sync: bool,
}
