use crate::filter::FilterPolicy;
use crate::util::hash::hash;

fn bloom_hash(key: &[u8]) -> u32 {
    hash(key, 0xbc9f_1d34)
}

/// Standard bloom filter with double hashing. The number of probes `k` is
/// derived from `bits_per_key` and stored in the filter's final byte so
/// readers stay compatible if the parameter changes.
pub struct BloomFilter {
    pub bits_per_key: usize,
    pub k: usize,
}

impl BloomFilter {
    pub fn new(bits_per_key: usize) -> Self {
        // We intentionally round down to reduce probing cost a little bit.
        let mut k = bits_per_key as f32 * 0.69; // 0.69 =~ ln(2)
        if k < 1f32 {
            k = 1f32;
        } else if k > 30f32 {
            k = 30f32;
        }
        BloomFilter {
            bits_per_key,
            k: k as usize,
        }
    }
}

impl FilterPolicy for BloomFilter {
    fn name(&self) -> &str {
        "siltdb.BuiltinBloomFilter"
    }

    fn create_filter(&self, keys: &[Vec<u8>]) -> Vec<u8> {
        // Compute bloom filter size (in both bits and bytes).
        let mut bits = keys.len() * self.bits_per_key;
        // For small n, we can see a very high false positive rate.
        // Fix it by enforcing a minimum bloom filter length.
        if bits < 64 {
            bits = 64;
        }
        let bytes = (bits + 7) / 8;
        bits = bytes * 8;

        let mut filter = vec![0u8; bytes + 1];
        // Remember # of probes in filter.
        filter[bytes] = self.k as u8;
        for key in keys {
            // Use double-hashing to generate a sequence of hash values.
            let mut h = bloom_hash(key);
            let delta = h.rotate_right(17);
            for _ in 0..self.k {
                let bit_pos = (h % bits as u32) as usize;
                filter[bit_pos / 8] |= 1 << (bit_pos % 8);
                h = h.wrapping_add(delta);
            }
        }
        filter
    }

    fn key_may_match(&self, filter: &[u8], key: &[u8]) -> bool {
        let len = filter.len();
        if len < 2 {
            return false;
        }
        let bits = ((len - 1) * 8) as u32;

        // Use the encoded k so that we can read filters generated by
        // bloom filters created using different parameters.
        let k = filter[len - 1];
        if k > 30 {
            // Reserved for potentially new encodings for short bloom
            // filters. Consider it a match.
            return true;
        }

        let mut h = bloom_hash(key);
        let delta = h.rotate_right(17);
        for _ in 0..k {
            let bit_pos = h % bits;
            if filter[(bit_pos / 8) as usize] & (1 << (bit_pos % 8)) == 0 {
                return false;
            }
            h = h.wrapping_add(delta);
        }
        true
    }
}
