pub mod config;
pub mod record_name;
pub mod stream;

pub use config::{
    DEFAULT_MIN_DELTA_LISTS, DEFAULT_VOLUME_INDEX_MEAN_DELTA, Geometry, IndexConfig, MAX_ZONES,
};
pub use record_name::{RECORD_NAME_SIZE, RecordName};

/// Number of bits needed to represent `value` (zero needs zero bits).
#[must_use]
pub const fn bits_per(value: u64) -> u32 {
    u64::BITS - value.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::bits_per;

    #[test]
    fn test_bits_per() {
        assert_eq!(bits_per(0), 0);
        assert_eq!(bits_per(1), 1);
        assert_eq!(bits_per(9), 4);
        assert_eq!(bits_per(1023), 10);
        assert_eq!(bits_per(1024), 11);
        assert_eq!(bits_per(4096 * 256 - 1), 20);
    }
}
