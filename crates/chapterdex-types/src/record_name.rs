//! Fixed-size record names and the hash-derived fields the volume index reads.

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_128, xxh3_128_with_seed};

/// Size of a record name in bytes.
pub const RECORD_NAME_SIZE: usize = 32;

/// Offset of the big-endian u64 that supplies the list number and address.
const VOLUME_INDEX_BYTES_OFFSET: usize = 0;
/// Offset of the big-endian u16 used by the sampling predicate.
const SAMPLING_BYTES_OFFSET: usize = 14;

/// Opaque 256-bit content hash identifying one data block.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordName([u8; RECORD_NAME_SIZE]);

impl RecordName {
    #[must_use]
    pub const fn new(bytes: [u8; RECORD_NAME_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary block content into a record name.
    ///
    /// The two halves come from independently seeded xxh3-128 passes so the
    /// address bytes and the sampling bytes are uncorrelated.
    #[must_use]
    pub fn from_data(data: &[u8]) -> Self {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[..16].copy_from_slice(&xxh3_128(data).to_be_bytes());
        let upper = xxh3_128_with_seed(data, 0x9E37_79B9_7F4A_7C15);
        bytes[16..].copy_from_slice(&upper.to_be_bytes());
        Self(bytes)
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; RECORD_NAME_SIZE] {
        &self.0
    }

    /// The bytes the volume index splits into a list number and an address.
    #[must_use]
    pub fn volume_index_bytes(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.0[VOLUME_INDEX_BYTES_OFFSET..VOLUME_INDEX_BYTES_OFFSET + 8]);
        u64::from_be_bytes(raw)
    }

    pub fn set_volume_index_bytes(&mut self, value: u64) {
        self.0[VOLUME_INDEX_BYTES_OFFSET..VOLUME_INDEX_BYTES_OFFSET + 8]
            .copy_from_slice(&value.to_be_bytes());
    }

    /// The bytes the sampling predicate is evaluated on.
    #[must_use]
    pub fn sampling_bytes(&self) -> u16 {
        u16::from_be_bytes([
            self.0[SAMPLING_BYTES_OFFSET],
            self.0[SAMPLING_BYTES_OFFSET + 1],
        ])
    }

    pub fn set_sampling_bytes(&mut self, value: u16) {
        self.0[SAMPLING_BYTES_OFFSET..SAMPLING_BYTES_OFFSET + 2]
            .copy_from_slice(&value.to_be_bytes());
    }
}

impl From<[u8; RECORD_NAME_SIZE]> for RecordName {
    fn from(bytes: [u8; RECORD_NAME_SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RecordName {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordName(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}
