//! Write-ahead log framing.
//!
//! A log file is a sequence of 32 KiB blocks. Each block holds zero or
//! more records framed as `[masked crc32c: 4][length: 2 LE][type: 1]` plus
//! payload; a record never spans a block, so payloads larger than one
//! block are written as FIRST/MIDDLE.../LAST fragments and reassembled by
//! the reader. A block tail of fewer than seven bytes is zero-filled.

pub mod reader;
pub mod writer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    // Zero is reserved for preallocated files.
    KZeroType = 0,
    KFullType = 1,

    // For fragments.
    KFirstType = 2,
    KMiddleType = 3,
    KLastType = 4,
}

impl From<usize> for RecordType {
    fn from(v: usize) -> Self {
        match v {
            0 => RecordType::KZeroType,
            1 => RecordType::KFullType,
            2 => RecordType::KFirstType,
            3 => RecordType::KMiddleType,
            4 => RecordType::KLastType,
            _ => panic!("[wal] non corresponding record type {}", v),
        }
    }
}

pub const MAX_RECORD_TYPE: RecordType = RecordType::KLastType;

pub const BLOCK_SIZE: usize = 32768;

/// Header is checksum (4 bytes) + length (2 bytes) + type (1 byte).
pub const HEADER_SIZE: usize = 4 + 2 + 1;
