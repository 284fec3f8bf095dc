//! Index configuration.
//!
//! `IndexConfig` is the only knob set the delta and volume indexes consume.
//! Values are plain data so they can be persisted next to the index or
//! loaded from a config file by the embedding application.

use chapterdex_error::{IndexError, Result};
use serde::{Deserialize, Serialize};

/// Maximum number of concurrency zones.
pub const MAX_ZONES: u32 = 16;

/// Mean gap between adjacent volume-index addresses.
pub const DEFAULT_VOLUME_INDEX_MEAN_DELTA: u32 = 4096;

/// Minimum delta list count, chosen so that no zone can be left without lists.
pub const DEFAULT_MIN_DELTA_LISTS: u32 = MAX_ZONES * MAX_ZONES;

/// Shape of the volume the index covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub records_per_chapter: u64,
    /// Chapters the index remembers before the oldest one expires.
    pub chapters_per_volume: u64,
    /// Chapters (out of `chapters_per_volume`) indexed only through the
    /// sample sub-index.
    pub sparse_chapters_per_volume: u64,
}

impl Geometry {
    /// A dense-only geometry.
    #[must_use]
    pub const fn new(records_per_chapter: u64, chapters_per_volume: u64) -> Self {
        Self {
            records_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume: 0,
        }
    }

    #[must_use]
    pub const fn with_sparse_chapters(mut self, sparse_chapters_per_volume: u64) -> Self {
        self.sparse_chapters_per_volume = sparse_chapters_per_volume;
        self
    }

    #[must_use]
    pub const fn is_sparse(&self) -> bool {
        self.sparse_chapters_per_volume > 0
    }

    /// Chapters whose every record is indexed.
    #[must_use]
    pub const fn dense_chapters_per_volume(&self) -> u64 {
        self.chapters_per_volume
            .saturating_sub(self.sparse_chapters_per_volume)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self::new(65_536, 1024)
    }
}

/// Configuration consumed by `VolumeIndex::new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub geometry: Geometry,
    /// Independent zones, each meant for its own worker thread.
    pub zone_count: u32,
    /// Expected gap between neighbouring addresses in a delta list. Sets the
    /// coding parameters and the list count.
    pub volume_index_mean_delta: u32,
    /// One in `sparse_sample_rate` names goes to the sample sub-index.
    /// Zero disables sampling.
    pub sparse_sample_rate: u32,
    /// Lower bound on delta lists per sub-index.
    pub min_delta_lists: u32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            geometry: Geometry::default(),
            zone_count: 1,
            volume_index_mean_delta: DEFAULT_VOLUME_INDEX_MEAN_DELTA,
            sparse_sample_rate: 0,
            min_delta_lists: DEFAULT_MIN_DELTA_LISTS,
        }
    }
}

impl IndexConfig {
    /// Defaults for everything but the geometry.
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_zone_count(mut self, zone_count: u32) -> Self {
        self.zone_count = zone_count;
        self
    }

    #[must_use]
    pub const fn with_sample_rate(mut self, sparse_sample_rate: u32) -> Self {
        self.sparse_sample_rate = sparse_sample_rate;
        self
    }

    #[must_use]
    pub const fn with_min_delta_lists(mut self, min_delta_lists: u32) -> Self {
        self.min_delta_lists = min_delta_lists;
        self
    }

    #[must_use]
    pub const fn with_mean_delta(mut self, volume_index_mean_delta: u32) -> Self {
        self.volume_index_mean_delta = volume_index_mean_delta;
        self
    }

    /// Reject configurations the indexes cannot be built from.
    pub fn validate(&self) -> Result<()> {
        if self.zone_count == 0 || self.zone_count > MAX_ZONES {
            return Err(IndexError::invalid_argument(format!(
                "zone count {} must be between 1 and {MAX_ZONES}",
                self.zone_count
            )));
        }
        if self.volume_index_mean_delta == 0 {
            return Err(IndexError::invalid_argument(
                "volume index mean delta must be nonzero",
            ));
        }
        if self.min_delta_lists == 0 {
            return Err(IndexError::invalid_argument(
                "minimum delta list count must be nonzero",
            ));
        }
        let geometry = &self.geometry;
        if geometry.is_sparse()
            && geometry.sparse_chapters_per_volume >= geometry.chapters_per_volume
        {
            return Err(IndexError::invalid_argument(format!(
                "{} sparse chapters leave no dense chapters out of {}",
                geometry.sparse_chapters_per_volume, geometry.chapters_per_volume
            )));
        }
        if geometry.is_sparse() && self.sparse_sample_rate == 0 {
            return Err(IndexError::invalid_argument(
                "sparse geometry requires a nonzero sample rate",
            ));
        }
        Ok(())
    }
}
