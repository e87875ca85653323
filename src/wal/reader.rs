use std::io::SeekFrom;

use tracing::warn;

use crate::storage::File;
use crate::util::coding::decode_fixed_32;
use crate::util::crc32;
use crate::wal::{RecordType, BLOCK_SIZE, HEADER_SIZE, MAX_RECORD_TYPE};
use crate::IResult;

enum ReportError {
    Eof,
    BadRecord,
}

struct Record {
    t: RecordType,
    data: Vec<u8>,
}

pub trait Reporter {
    /// Some corruption was detected. `bytes` is the approximate number
    /// of bytes dropped due to the corruption.
    fn corruption(&mut self, bytes: u64, reason: &str) -> IResult<()>;
}

/// Reassembles logical records from a framed log file.
///
/// Corruption is reported through the `Reporter` only when the failing
/// bytes lie at or after `initial_offset`; a truncated header or payload
/// at the end of the file is treated as a clean EOF because a writer
/// crash mid-record is not an error.
pub struct Reader<F: File> {
    file: F,
    reporter: Option<Box<dyn Reporter>>,
    // Whether to verify the per-record checksum.
    checksum: bool,
    buffer: Vec<u8>,
    // The valid data length in buffer.
    buffer_length: usize,
    // Last `read` indicated EOF by returning < BLOCK_SIZE.
    eof: bool,
    // Offset of the last record returned by `read_record`.
    last_record_offset: u64,
    // Offset of the first location past the end of buffer.
    end_of_buffer_offset: u64,
    // Offset at which to start looking for the first record to return.
    initial_offset: u64,
    // True if we are resynchronizing after a seek (initial_offset > 0). In
    // particular, a run of KMiddleType and KLastType records can be
    // silently skipped in this mode.
    resyncing: bool,
}

impl<F: File> Reader<F> {
    pub fn new(
        file: F,
        reporter: Option<Box<dyn Reporter>>,
        checksum: bool,
        initial_offset: u64,
    ) -> Self {
        Reader {
            file,
            reporter,
            checksum,
            buffer: vec![],
            buffer_length: 0,
            eof: false,
            last_record_offset: 0,
            end_of_buffer_offset: 0,
            initial_offset,
            resyncing: initial_offset > 0,
        }
    }

    /// Reads the next logical record into `buf`. Returns false at a clean
    /// EOF. The previous contents of `buf` are discarded.
    pub fn read_record(&mut self, buf: &mut Vec<u8>) -> bool {
        if self.last_record_offset < self.initial_offset && !self.skip_to_initial_block() {
            return false;
        }
        buf.clear();
        let mut in_fragmented_record = false;
        // Record offset of the logical record that we're reading.
        let mut prospective_record_offset = 0;

        loop {
            match self.read_physical_record() {
                Ok(mut record) => {
                    if self.resyncing {
                        match record.t {
                            RecordType::KMiddleType => continue,
                            RecordType::KLastType => {
                                self.resyncing = false;
                                continue;
                            }
                            _ => self.resyncing = false,
                        }
                    }

                    let physical_record_offset = self.end_of_buffer_offset
                        - self.buffer_length as u64
                        - HEADER_SIZE as u64
                        - record.data.len() as u64;

                    match record.t {
                        RecordType::KFullType => {
                            if in_fragmented_record {
                                self.report_drop(buf.len() as u64, "partial record without end(1)");
                            }
                            prospective_record_offset = physical_record_offset;
                            buf.clear();
                            buf.append(&mut record.data);
                            self.last_record_offset = prospective_record_offset;
                            return true;
                        }
                        RecordType::KFirstType => {
                            if in_fragmented_record {
                                self.report_drop(buf.len() as u64, "partial record without end(2)");
                            }
                            prospective_record_offset = physical_record_offset;
                            buf.clear();
                            buf.append(&mut record.data);
                            in_fragmented_record = true;
                        }
                        RecordType::KMiddleType => {
                            if !in_fragmented_record {
                                self.report_drop(
                                    record.data.len() as u64,
                                    "missing start of fragmented record(1)",
                                );
                                // Keep reading until we find a new FIRST or
                                // FULL record.
                            } else {
                                buf.append(&mut record.data);
                            }
                        }
                        RecordType::KLastType => {
                            if !in_fragmented_record {
                                self.report_drop(
                                    record.data.len() as u64,
                                    "missing start of fragmented record(2)",
                                );
                            } else {
                                buf.append(&mut record.data);
                                // The logical record is attributed to the
                                // offset of its FIRST fragment.
                                self.last_record_offset = prospective_record_offset;
                                return true;
                            }
                        }
                        RecordType::KZeroType => {}
                    }
                }
                Err(ReportError::Eof) => {
                    if in_fragmented_record {
                        // This can be caused by the writer dying
                        // immediately after writing a physical record but
                        // before completing the next one; don't treat it as
                        // a corruption, just ignore the entire record.
                        buf.clear();
                    }
                    return false;
                }
                Err(ReportError::BadRecord) => {
                    if in_fragmented_record {
                        self.report_drop(buf.len() as u64, "error in middle of record");
                        in_fragmented_record = false;
                        buf.clear();
                    }
                }
            }
        }
    }

    /// Returns the physical offset of the record most recently returned by
    /// `read_record`.
    pub fn last_record_offset(&self) -> u64 {
        self.last_record_offset
    }

    fn read_physical_record(&mut self) -> Result<Record, ReportError> {
        loop {
            // We've reached the end of a block and do not have a valid
            // header.
            if self.buffer_length < HEADER_SIZE {
                self.buffer = vec![0; BLOCK_SIZE];
                self.buffer_length = 0;
                if !self.eof {
                    match self.file.read(&mut self.buffer) {
                        Ok(read_len) => {
                            self.end_of_buffer_offset += read_len as u64;
                            self.buffer_length = read_len;
                            if read_len < BLOCK_SIZE {
                                self.eof = true;
                            }
                        }
                        Err(e) => {
                            self.report_drop(BLOCK_SIZE as u64, &e.to_string());
                            self.eof = true;
                            return Err(ReportError::Eof);
                        }
                    }
                    continue;
                } else {
                    // Note that if the buffer is non-empty we have a
                    // truncated header at the end of the file, which can be
                    // caused by the writer crashing in the middle of
                    // writing the header. Instead of considering this an
                    // error, just report EOF.
                    return Err(ReportError::Eof);
                }
            }

            // Parse the header.
            let header = &self.buffer[..HEADER_SIZE];
            let a = header[4] as usize & 0xff;
            let b = header[5] as usize & 0xff;
            let raw_type = header[6];
            let length = a | (b << 8);

            // A record never spans blocks.
            if HEADER_SIZE + length > self.buffer_length {
                let drop_size = self.buffer_length;
                self.buffer = vec![];
                self.buffer_length = 0;
                if !self.eof {
                    self.report_drop(drop_size as u64, "bad record length");
                    return Err(ReportError::BadRecord);
                }
                // If the end of the file has been reached without reading
                // `length` bytes of payload, assume the writer died in the
                // middle of writing the record. Don't report a corruption.
                return Err(ReportError::Eof);
            }

            // Zero-type records come from zero-filled regions of
            // preallocated or mmap-extended files. Skip them without
            // reporting; the writer never emits them.
            if raw_type == RecordType::KZeroType as u8 && length == 0 {
                self.buffer = vec![];
                self.buffer_length = 0;
                return Err(ReportError::BadRecord);
            }

            if raw_type > MAX_RECORD_TYPE as u8 {
                let drop_size = self.buffer_length;
                self.buffer = vec![];
                self.buffer_length = 0;
                warn!(record_type = raw_type, "unknown record type in log");
                self.report_drop(drop_size as u64, "unknown record type");
                return Err(ReportError::BadRecord);
            }

            // Check crc.
            if self.checksum {
                let expected_crc = crc32::unmask(decode_fixed_32(header));
                let actual_crc = crc32::hash(&self.buffer[HEADER_SIZE - 1..HEADER_SIZE + length]);
                if actual_crc != expected_crc {
                    // Drop the rest of the buffer since `length` itself may
                    // have been corrupted and if we trust it, we could find
                    // some fragment of a real log record that just happens
                    // to look like a valid log record.
                    let drop_size = self.buffer_length;
                    self.buffer = vec![];
                    self.buffer_length = 0;
                    self.report_drop(drop_size as u64, "checksum mismatch");
                    return Err(ReportError::BadRecord);
                }
            }

            // Consume the header and payload.
            let mut data = self
                .buffer
                .drain(..HEADER_SIZE + length)
                .collect::<Vec<u8>>();
            self.buffer_length -= data.len();

            // Skip physical records that started before initial_offset.
            if (self.end_of_buffer_offset
                - self.buffer_length as u64
                - HEADER_SIZE as u64
                - length as u64)
                < self.initial_offset
            {
                return Err(ReportError::BadRecord);
            }

            data.drain(..HEADER_SIZE);

            return Ok(Record {
                t: RecordType::from(raw_type as usize),
                data,
            });
        }
    }

    /// Skips all blocks that end before `initial_offset`. Returns true on
    /// success. Handles reporting.
    fn skip_to_initial_block(&mut self) -> bool {
        let offset_in_block = self.initial_offset % BLOCK_SIZE as u64;
        let mut block_start_location = self.initial_offset - offset_in_block;

        // Don't search a block if we'd be in the trailer.
        if offset_in_block > (BLOCK_SIZE - 6) as u64 {
            block_start_location += BLOCK_SIZE as u64;
        }

        self.end_of_buffer_offset = block_start_location;

        // Skip to the start of the first block that can contain the initial
        // record.
        if block_start_location > 0 {
            if let Err(e) = self.file.seek(SeekFrom::Start(block_start_location)) {
                self.report_drop(block_start_location, &e.to_string());
                return false;
            }
        }
        true
    }

    /// Reports dropped bytes to the reporter, provided the drop happened
    /// at or after the requested initial offset.
    fn report_drop(&mut self, bytes: u64, reason: &str) {
        if let Some(reporter) = self.reporter.as_mut() {
            if self.end_of_buffer_offset == 0
                || self.end_of_buffer_offset - bytes >= self.initial_offset
            {
                let _ = reporter.corruption(bytes, reason);
            }
        }
    }

    /// Delivers the file's ownership.
    #[inline]
    pub fn into_file(self) -> F {
        self.file
    }
}
