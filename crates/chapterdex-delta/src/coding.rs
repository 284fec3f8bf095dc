//! Huffman-style delta coding parameters.
//!
//! A delta below `min_keys` takes `min_bits` bits. Larger deltas take the
//! `min_bits` remainder followed by a unary quotient terminated by a one bit,
//! each quotient step covering `incr_keys` keys. `incr_keys` approximates
//! `ln 2 * mean_delta`, which makes the code near-optimal for exponentially
//! distributed gaps.

use chapterdex_error::{IndexError, Result};
use chapterdex_types::bits_per;

/// Largest `min_bits` the decoder's 32-bit loads can serve after an
/// intra-byte shift of up to seven bits.
pub const MAX_MIN_BITS: u32 = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaCoding {
    pub min_bits: u32,
    pub min_keys: u32,
    pub incr_keys: u32,
}

impl DeltaCoding {
    pub fn new(mean_delta: u32) -> Result<Self> {
        if mean_delta == 0 {
            return Err(IndexError::invalid_argument("mean delta must be nonzero"));
        }
        let incr_keys = ((836_158u64 * u64::from(mean_delta) + 603_160) / 1_206_321) as u32;
        let incr_keys = incr_keys.max(1);
        let min_bits = bits_per(u64::from(incr_keys));
        if min_bits > MAX_MIN_BITS {
            return Err(IndexError::invalid_argument(format!(
                "mean delta {mean_delta} needs {min_bits} minimum bits, more than {MAX_MIN_BITS}"
            )));
        }
        let min_keys = (1u32 << min_bits) - incr_keys;
        Ok(Self {
            min_bits,
            min_keys,
            incr_keys,
        })
    }

    /// Bits needed to encode `delta`.
    #[inline]
    pub const fn key_bits(&self, delta: u32) -> u32 {
        let quotient = (self.incr_keys - self.min_keys) as u64 + delta as u64;
        self.min_bits + (quotient / self.incr_keys as u64) as u32
    }
}

/// Expected bit footprint of `entries` entries coded with `mean_delta`.
///
/// Each delta averages about `min_bits + 1.5` bits.
pub fn delta_memory_size(entries: u64, mean_delta: u32, payload_bits: u32) -> Result<u64> {
    let coding = DeltaCoding::new(mean_delta)?;
    Ok(entries * u64::from(payload_bits + coding.min_bits + 1) + entries / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_for_common_means() {
        let coding = DeltaCoding::new(4096).expect("coding");
        assert_eq!(coding.incr_keys, 2839);
        assert_eq!(coding.min_bits, 12);
        assert_eq!(coding.min_keys, 4096 - 2839);

        let coding = DeltaCoding::new(1024).expect("coding");
        assert_eq!(coding.incr_keys, 710);
        assert_eq!(coding.min_bits, 10);
        assert_eq!(coding.min_keys, 314);
    }

    #[test]
    fn test_key_bits_steps_by_incr() {
        let coding = DeltaCoding::new(1024).expect("coding");
        assert_eq!(coding.key_bits(0), 10);
        assert_eq!(coding.key_bits(313), 10);
        assert_eq!(coding.key_bits(314), 11);
        assert_eq!(coding.key_bits(314 + 709), 11);
        assert_eq!(coding.key_bits(314 + 710), 12);
    }

    #[test]
    fn test_tiny_mean_is_usable() {
        let coding = DeltaCoding::new(1).expect("coding");
        assert_eq!(coding.incr_keys, 1);
        assert_eq!(coding.min_bits, 1);
        assert_eq!(coding.min_keys, 1);
        assert_eq!(coding.key_bits(0), 1);
        assert_eq!(coding.key_bits(3), 4);
    }

    #[test]
    fn test_rejects_degenerate_means() {
        assert!(DeltaCoding::new(0).is_err());
        assert!(DeltaCoding::new(u32::MAX).is_err());
    }

    #[test]
    fn test_memory_size_estimate() {
        let bits = delta_memory_size(1000, 1024, 8).expect("size");
        assert_eq!(bits, 1000 * 19 + 500);
    }
}
