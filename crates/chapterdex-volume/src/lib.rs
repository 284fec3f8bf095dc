//! Chapter-aware volume index.
//!
//! Maps record names to the virtual chapter that last recorded them,
//! keeping only a sliding window of recent chapters. A sparse volume keeps
//! a small dense sub-index for recent chapters and a sampled sub-index that
//! spans the whole volume; only the sampled one answers [`SampleLookup`]
//! queries from other threads.
//!
//! Zones partition the delta lists. Each zone is driven by one worker
//! through a [`ZoneHandle`]; [`VolumeIndex::split_zones`] hands out one
//! handle per zone.

pub mod params;
pub mod persist;
pub mod record;
pub mod sub_index;
pub mod telemetry;
pub mod volume_index;
pub mod zone_handle;

pub use params::{
    DELTA_LIST_SIZE, SplitConfig, SubIndexParams, split_config, volume_index_save_blocks,
    volume_index_save_bytes,
};
pub use persist::{
    SUB_INDEX_HEADER_SIZE, SUB_INDEX_MAGIC, VOLUME_INDEX_HEADER_SIZE, VOLUME_INDEX_MAGIC,
};
pub use record::VolumeIndexRecord;
pub use sub_index::{SubIndexLayout, VolumeIndexStats, VolumeSubIndex};
pub use telemetry::{
    NoOpVolumeIndexObserver, OVERFLOW_LOG_INTERVAL, SubIndexKind, VolumeEventLog,
    VolumeIndexEvent, VolumeIndexObserver,
};
pub use volume_index::{DENSE_TAG, SAMPLE_TAG, VolumeIndex, derive_nonce};
pub use zone_handle::{SampleLookup, SampleReading, ZoneHandle, ZoneSplit};
