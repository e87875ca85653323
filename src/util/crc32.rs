//! CRC32C (Castagnoli) helpers plus the storage mask.
//!
//! CRCs that guard data which itself embeds CRCs (a log record carrying a
//! table block, say) are stored masked so the nested values cannot collide.

const MASK_DELTA: u32 = 0xa282_ead8;

/// Returns the crc32c of `data`.
#[inline]
pub fn hash(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Returns the crc32c of the concatenation of the bytes that produced
/// `init` and `data`.
#[inline]
pub fn extend(init: u32, data: &[u8]) -> u32 {
    crc32c::crc32c_append(init, data)
}

/// Returns a masked representation of `crc` suitable for storage.
#[inline]
pub fn mask(crc: u32) -> u32 {
    crc.rotate_right(15).wrapping_add(MASK_DELTA)
}

/// Inverse of `mask`.
#[inline]
pub fn unmask(masked: u32) -> u32 {
    masked.wrapping_sub(MASK_DELTA).rotate_left(15)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_results() {
        // Reference values from the crc32c specification.
        let buf = [0u8; 32];
        assert_eq!(0x8a91_36aa, hash(&buf));

        let buf = [0xffu8; 32];
        assert_eq!(0x62a8_ab43, hash(&buf));

        let mut buf = [0u8; 32];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(0x46dd_794e, hash(&buf));

        for (i, b) in buf.iter_mut().enumerate() {
            *b = 31 - i as u8;
        }
        assert_eq!(0x113f_db5c, hash(&buf));

        let data = [
            0x01, 0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x14, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x14,
            0x00, 0x00, 0x00, 0x18, 0x28, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        assert_eq!(0xd994_8264, hash(&data));
    }

    #[test]
    fn test_values_differ() {
        assert_ne!(hash(b"a"), hash(b"foo"));
    }

    #[test]
    fn test_extend_matches_concatenation() {
        assert_eq!(hash(b"hello world"), extend(hash(b"hello "), b"world"));
    }

    #[test]
    fn test_mask_round_trip() {
        let crc = hash(b"foo");
        assert_ne!(crc, mask(crc));
        assert_ne!(crc, mask(mask(crc)));
        assert_eq!(crc, unmask(mask(crc)));
        assert_eq!(crc, unmask(unmask(mask(mask(crc)))));
    }
}
