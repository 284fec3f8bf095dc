//! Sizing of a volume sub-index from the index configuration.
//!
//! The delta list count is fixed by the geometry so that a given record name
//! always lands in the same list. Memory is sized for the retained chapters
//! plus a small allowance of expired entries the lazy flush has not reached
//! yet.

use chapterdex_delta::{compute_save_bytes, delta_memory_size};
use chapterdex_error::{IndexError, Result};
use chapterdex_types::{IndexConfig, MAX_ZONES, bits_per};
use serde::Serialize;

use crate::persist::{SUB_INDEX_HEADER_SIZE, VOLUME_INDEX_HEADER_SIZE};

/// Average number of records a delta list is expected to hold.
pub const DELTA_LIST_SIZE: u64 = 256;

/// Addresses must fit a delta index key.
pub const MAX_ADDRESS_BITS: u32 = 31;

/// Bytes of a saved guard record, counted once per stream.
const GUARD_RECORD_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubIndexParams {
    pub address_bits: u32,
    pub chapter_bits: u32,
    pub mean_delta: u32,
    pub list_count: u32,
    /// Chapters the sub-index retains.
    pub chapter_count: u64,
    pub bits_per_chapter: u64,
    pub memory_size: usize,
    /// Free space the early flush tries to keep in reserve.
    pub target_free_size: usize,
}

impl SubIndexParams {
    pub fn compute(config: &IndexConfig) -> Result<Self> {
        let geometry = &config.geometry;
        let records_per_chapter = geometry.records_per_chapter;
        let chapter_count = geometry.chapters_per_volume;
        if geometry.is_sparse() {
            return Err(IndexError::invalid_argument(format!(
                "cannot size a dense sub-index with {} sparse chapters",
                geometry.sparse_chapters_per_volume
            )));
        }
        if records_per_chapter == 0 {
            return Err(IndexError::invalid_argument(
                "cannot size a volume index with 0 records per chapter",
            ));
        }
        if chapter_count == 0 {
            return Err(IndexError::invalid_argument(
                "cannot size a volume index with 0 chapters per volume",
            ));
        }

        let list_records = records_per_chapter.saturating_mul(chapter_count);
        let list_count = (list_records / DELTA_LIST_SIZE).max(u64::from(config.min_delta_lists));
        let list_count = u32::try_from(list_count).map_err(|_| {
            IndexError::invalid_argument(format!(
                "cannot size a volume index with {list_count} delta lists"
            ))
        })?;
        let address_count = u64::from(config.volume_index_mean_delta) * DELTA_LIST_SIZE;
        let address_bits = bits_per(address_count - 1);
        if address_bits > MAX_ADDRESS_BITS {
            return Err(IndexError::invalid_argument(format!(
                "cannot size a volume index with {address_bits} address bits"
            )));
        }
        let chapter_bits = bits_per(chapter_count - 1);

        // Lists not touched while a chapter is written keep expired entries
        // around; about four chapters per thousand cover them.
        let invalid_chapters = (chapter_count / 256).max(2);
        let indexed_chapters = chapter_count + invalid_chapters;
        let indexed_entries = records_per_chapter.saturating_mul(indexed_chapters);
        let address_span = u64::from(list_count) << address_bits;
        let mean_delta = u32::try_from(address_span / indexed_entries).map_err(|_| {
            IndexError::invalid_argument(format!(
                "{indexed_entries} entries are too sparse for {list_count} delta lists"
            ))
        })?;

        let bits_per_chapter = delta_memory_size(records_per_chapter, mean_delta, chapter_bits)?;
        let expected_size = bits_per_chapter.saturating_mul(indexed_chapters) / 8;
        let memory_size = usize::try_from(expected_size * 106 / 100).map_err(|_| {
            IndexError::invalid_argument(format!(
                "volume index of {expected_size} bytes does not fit in memory"
            ))
        })?;

        Ok(Self {
            address_bits,
            chapter_bits,
            mean_delta,
            list_count,
            chapter_count,
            bits_per_chapter,
            memory_size,
            target_free_size: (expected_size / 20) as usize,
        })
    }

    /// Upper bound on the bytes one zone of this sub-index saves.
    pub fn save_bytes(&self) -> usize {
        SUB_INDEX_HEADER_SIZE
            + self.list_count as usize * std::mem::size_of::<u64>()
            + compute_save_bytes(self.list_count, self.memory_size)
    }
}

/// Configurations of the two sub-indexes of a sparse volume index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitConfig {
    /// Every chapter, sampled names only.
    pub sample: IndexConfig,
    /// Dense chapters only, every other name.
    pub dense: IndexConfig,
}

pub fn split_config(config: &IndexConfig) -> Result<SplitConfig> {
    let geometry = config.geometry;
    if !geometry.is_sparse() {
        return Err(IndexError::invalid_argument(
            "cannot split a volume index with no sparse chapters",
        ));
    }
    if config.sparse_sample_rate == 0 {
        return Err(IndexError::invalid_argument(
            "cannot split a volume index with a sample rate of 0",
        ));
    }
    let sample_records = geometry.records_per_chapter / u64::from(config.sparse_sample_rate);

    let mut sample = *config;
    sample.geometry.records_per_chapter = sample_records;
    sample.geometry.sparse_chapters_per_volume = 0;

    let mut dense = *config;
    dense.geometry.records_per_chapter -= sample_records;
    dense.geometry.sparse_chapters_per_volume = 0;
    dense.geometry.chapters_per_volume = geometry.dense_chapters_per_volume();

    Ok(SplitConfig { sample, dense })
}

/// Upper bound on the bytes one zone of a volume index saves.
pub fn volume_index_save_bytes(config: &IndexConfig) -> Result<usize> {
    if !config.geometry.is_sparse() {
        return Ok(SubIndexParams::compute(config)?.save_bytes());
    }
    let split = split_config(config)?;
    Ok(VOLUME_INDEX_HEADER_SIZE
        + SubIndexParams::compute(&split.sample)?.save_bytes()
        + SubIndexParams::compute(&split.dense)?.save_bytes())
}

/// Blocks of `block_size` bytes to reserve for a saved volume index.
pub fn volume_index_save_blocks(config: &IndexConfig, block_size: usize) -> Result<u64> {
    if block_size == 0 {
        return Err(IndexError::invalid_argument("block size must be nonzero"));
    }
    let bytes = volume_index_save_bytes(config)? + GUARD_RECORD_SIZE;
    Ok(bytes.div_ceil(block_size) as u64 + u64::from(MAX_ZONES))
}
