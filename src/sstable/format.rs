use crate::error::Error;
use crate::opt::CompressionType;
use crate::storage::File;
use crate::util::coding::{decode_fixed_32, decode_fixed_64, put_fixed_64, VarintU64};
use crate::util::crc32::{extend, hash, unmask};
use crate::IResult;

/// Maximum encoding length of a `BlockHandle`.
const K_MAX_ENCODED_LENGTH: usize = 10 + 10;

/// Encoded length of a `Footer`. Note that the serialization of a
/// `Footer` will always occupy exactly this many bytes. It consists
/// of two block handles padded to fixed width and a magic number.
pub const K_ENCODED_LENGTH: usize = 2 * K_MAX_ENCODED_LENGTH + 8;

/// Magic footer number of an sstable.
const K_TABLE_MAGIC_NUMBER: u64 = 0xdb47_7524_8b80_fb57;

/// 1-byte compression type + 32-bit crc.
pub const K_BLOCK_TRAILER_SIZE: usize = 5;

/// `BlockHandle` is a pointer to the extent of a file that stores a data
/// block or a meta block: the block's starting offset and its payload
/// size, both excluding the 5-byte trailer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    pub fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    #[inline]
    pub fn encoded(&self) -> Vec<u8> {
        let mut v = vec![];
        self.encode_to(&mut v);
        v
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        VarintU64::put_varint(dst, self.offset);
        VarintU64::put_varint(dst, self.size);
    }

    /// Decodes a handle from the head of `src`, returning it and the
    /// number of bytes consumed.
    pub fn decode_from(src: &[u8]) -> IResult<(Self, usize)> {
        if let Some((offset, n)) = VarintU64::read(src) {
            if let Some((size, m)) = VarintU64::read(&src[n..]) {
                return Ok((Self::new(offset, size), n + m));
            }
        }
        Err(Error::Corruption("bad block handle"))
    }
}

/// `Footer` encapsulates the fixed information stored at the tail end of
/// every table file: the meta-index handle, the data-index handle, and
/// the table magic.
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn new(metaindex_handle: BlockHandle, index_handle: BlockHandle) -> Self {
        Footer {
            metaindex_handle,
            index_handle,
        }
    }

    /// Encodes the footer into exactly `K_ENCODED_LENGTH` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut v = vec![];
        self.metaindex_handle.encode_to(&mut v);
        self.index_handle.encode_to(&mut v);
        v.resize(2 * K_MAX_ENCODED_LENGTH, 0);
        put_fixed_64(&mut v, K_TABLE_MAGIC_NUMBER);
        assert_eq!(
            v.len(),
            K_ENCODED_LENGTH,
            "[footer] the length of encoded footer is {}, expect {}",
            v.len(),
            K_ENCODED_LENGTH,
        );
        v
    }

    pub fn decode_from(src: &[u8]) -> IResult<Self> {
        if src.len() < K_ENCODED_LENGTH {
            return Err(Error::Corruption("file is too short to be an sstable"));
        }
        let magic = decode_fixed_64(&src[K_ENCODED_LENGTH - 8..]);
        if magic != K_TABLE_MAGIC_NUMBER {
            return Err(Error::Corruption("not an sstable (bad magic number)"));
        }
        let (metaindex_handle, n) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[n..])?;
        Ok(Footer::new(metaindex_handle, index_handle))
    }
}

/// Reads the block identified by `handle` from `file`, verifying the
/// trailer checksum when asked and undoing compression. The returned
/// bytes are the block payload only.
pub fn read_block<F: File>(
    file: &F,
    verify_checksums: bool,
    handle: &BlockHandle,
) -> IResult<Vec<u8>> {
    // Read the block contents as well as the type/crc trailer. See
    // `TableBuilder` for the code that built this structure.
    let n = handle.size as usize;
    let mut buf = vec![0; n + K_BLOCK_TRAILER_SIZE];
    file.read_exact_at(buf.as_mut_slice(), handle.offset)?;

    if verify_checksums {
        let crc = unmask(decode_fixed_32(&buf[n + 1..]));
        // The stored crc covers the payload and the type byte.
        let actual = extend(hash(&buf[..n]), &buf[n..=n]);
        if crc != actual {
            return Err(Error::Corruption("block checksum mismatch"));
        }
    }

    match CompressionType::from(buf[n]) {
        CompressionType::KNoCompression => {
            buf.truncate(n);
            Ok(buf)
        }
        CompressionType::KSnappyCompression => {
            let decompressed_len = snap::raw::decompress_len(&buf[..n])?;
            let mut decompressed = vec![0u8; decompressed_len];
            let mut dec = snap::raw::Decoder::new();
            dec.decompress(&buf[..n], decompressed.as_mut_slice())?;
            Ok(decompressed)
        }
        CompressionType::Unknown => Err(Error::Corruption("bad block compression type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_handle_round_trip() {
        for (offset, size) in [(0u64, 0u64), (1, 2), (300, 70_000), (u64::MAX, u64::MAX)] {
            let handle = BlockHandle::new(offset, size);
            let encoded = handle.encoded();
            let (decoded, consumed) = BlockHandle::decode_from(&encoded).unwrap();
            assert_eq!(decoded, handle);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn test_block_handle_rejects_truncation() {
        let handle = BlockHandle::new(1 << 40, 1 << 30);
        let encoded = handle.encoded();
        assert!(BlockHandle::decode_from(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_footer_round_trip() {
        let footer = Footer::new(BlockHandle::new(4096, 128), BlockHandle::new(8192, 2048));
        let encoded = footer.encode();
        assert_eq!(encoded.len(), K_ENCODED_LENGTH);
        // The last eight bytes are the little-endian magic.
        assert_eq!(
            decode_fixed_64(&encoded[K_ENCODED_LENGTH - 8..]),
            0xdb47_7524_8b80_fb57
        );
        let decoded = Footer::decode_from(&encoded).unwrap();
        assert_eq!(decoded.metaindex_handle, footer.metaindex_handle);
        assert_eq!(decoded.index_handle, footer.index_handle);
    }

    #[test]
    fn test_footer_rejects_bad_magic() {
        let footer = Footer::new(BlockHandle::new(0, 0), BlockHandle::new(0, 0));
        let mut encoded = footer.encode();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(Footer::decode_from(&encoded).is_err());
    }
}
