use crate::storage::File;
use crate::util::coding::encode_fixed_32;
use crate::util::crc32;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};
use crate::IResult;

/// Appends framed records to a log file. Flush and sync decisions are up
/// to the caller; `add_record` only guarantees that every fragment of the
/// payload has been handed to the underlying file.
pub struct Writer<F: File> {
    dest: F,
    /// Current offset in the block.
    block_offset: usize,

    /// crc32c values for all supported record types. These are
    /// pre-computed to reduce the overhead of computing the crc of the
    /// record type stored in the header.
    type_crc: [u32; MAX_RECORD_TYPE as usize + 1],
}

impl<F: File> Writer<F> {
    pub fn new(dest: F) -> Self {
        Self::with_initial_offset(dest, 0)
    }

    /// Creates a writer that resumes appending to a log whose current
    /// length is `dest_length`.
    pub fn with_initial_offset(dest: F, dest_length: u64) -> Self {
        let mut type_crc = [0; MAX_RECORD_TYPE as usize + 1];
        for (t, crc) in type_crc.iter_mut().enumerate() {
            *crc = crc32::hash(&[t as u8]);
        }
        Writer {
            dest,
            block_offset: dest_length as usize % BLOCK_SIZE,
            type_crc,
        }
    }

    /// Appends a payload to the underlying log file, fragmenting as
    /// needed. Note that an empty payload still emits a single
    /// zero-length FULL record.
    pub fn add_record(&mut self, s: &[u8]) -> IResult<()> {
        let mut left = s.len();
        let mut begin = true;
        while {
            // Remaining capacity of the current block.
            let left_over = BLOCK_SIZE - self.block_offset;

            if left_over < HEADER_SIZE {
                // Switch to a new block: the remaining space cannot hold a
                // record header.
                if left_over > 0 {
                    // Fill the trailer (literal below relies on HEADER_SIZE
                    // being 7).
                    self.dest.write(&[0u8; 6][..left_over])?;
                }
                self.block_offset = 0;
            }

            // Invariant: we never leave less than HEADER_SIZE bytes in a
            // block.
            assert!(
                BLOCK_SIZE - self.block_offset >= HEADER_SIZE,
                "[wal writer] the left space of block {} is less than header size {}",
                BLOCK_SIZE - self.block_offset,
                HEADER_SIZE
            );

            // The capacity of the current block, excluding the header.
            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = if left < avail { left } else { avail };
            let end = left == fragment_length;
            let record_type = if begin && end {
                RecordType::KFullType
            } else if begin {
                RecordType::KFirstType
            } else if end {
                RecordType::KLastType
            } else {
                RecordType::KMiddleType
            };

            let start = s.len() - left;
            self.emit_physical_record(record_type, &s[start..start + fragment_length])?;
            left -= fragment_length;
            begin = false;

            // Loop again only while payload remains; the do-while shape
            // makes the empty payload emit exactly one record.
            left > 0
        } {}
        Ok(())
    }

    fn emit_physical_record(&mut self, t: RecordType, data: &[u8]) -> IResult<()> {
        let length = data.len();
        assert!(
            length <= 0xffff,
            "[wal writer] the data length in a record must fit 2 bytes but got {}",
            length
        );

        // Format the header.
        let mut buf: [u8; HEADER_SIZE] = [0; HEADER_SIZE];
        buf[4] = (length & 0xff) as u8;
        buf[5] = (length >> 8) as u8;
        buf[6] = t as u8;

        // The crc covers the record type and the payload.
        let crc = crc32::mask(crc32::extend(self.type_crc[t as usize], data));
        encode_fixed_32(&mut buf, crc);

        self.dest.write(&buf)?;
        self.dest.write(data)?;
        self.block_offset += HEADER_SIZE + length;
        Ok(())
    }

    /// Flushes buffered bytes to the operating system.
    #[inline]
    pub fn flush(&mut self) -> IResult<()> {
        self.dest.flush()
    }

    /// Forces the log contents to stable storage.
    #[inline]
    pub fn sync(&mut self) -> IResult<()> {
        self.dest.sync()
    }

    /// Delivers the file's ownership.
    #[inline]
    pub fn into_file(self) -> F {
        self.dest
    }
}
