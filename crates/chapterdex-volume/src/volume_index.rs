//! The volume index: a dense sub-index, optionally paired with a sampled
//! sub-index that covers every chapter of the volume.

use std::sync::Arc;

use chapterdex_delta::DEFAULT_TAG;
use chapterdex_error::{IndexError, Result};
use chapterdex_types::{IndexConfig, RecordName};
use tracing::info;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::params::{split_config, volume_index_save_bytes};
use crate::record::VolumeIndexRecord;
use crate::sub_index::{VolumeIndexStats, VolumeSubIndex};
use crate::telemetry::{EventSink, SubIndexKind, VolumeIndexObserver};
use crate::zone_handle::{SampleLookup, SampleZone, ZoneHandle, ZoneSplit};

/// Tag of the dense sub-index when a sample sub-index exists.
pub const DENSE_TAG: u8 = b'd';
/// Tag of the sample sub-index.
pub const SAMPLE_TAG: u8 = b's';

const NONCE_SEED: u64 = 0x6368_6170_7465_7264;

/// Derive a volume nonce from caller-supplied bytes. Never returns zero,
/// which `load` treats as "adopt the saved nonce".
pub fn derive_nonce(seed: &[u8]) -> u64 {
    xxh3_64_with_seed(seed, NONCE_SEED).max(1)
}

#[inline]
pub(crate) fn is_sample_name(sample_rate: u32, name: &RecordName) -> bool {
    sample_rate > 0 && u32::from(name.sampling_bytes()) % sample_rate == 0
}

pub struct VolumeIndex {
    pub(crate) sample_rate: u32,
    pub(crate) dense: VolumeSubIndex,
    pub(crate) sample: Option<VolumeSubIndex>,
    pub(crate) sink: EventSink,
}

impl std::fmt::Debug for VolumeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeIndex")
            .field("sample_rate", &self.sample_rate)
            .field("zone_count", &self.zone_count())
            .field("dense", self.dense.layout())
            .field("sample", &self.sample.as_ref().map(VolumeSubIndex::layout))
            .finish_non_exhaustive()
    }
}

impl VolumeIndex {
    pub fn new(config: &IndexConfig, nonce: u64) -> Result<Self> {
        config.validate()?;
        let (dense, sample, sample_rate) = if config.geometry.is_sparse() {
            let split = split_config(config)?;
            let dense = VolumeSubIndex::new(&split.dense, nonce, SubIndexKind::Dense, DENSE_TAG)?;
            let sample =
                VolumeSubIndex::new(&split.sample, nonce, SubIndexKind::Sample, SAMPLE_TAG)?;
            (dense, Some(sample), config.sparse_sample_rate)
        } else {
            let dense = VolumeSubIndex::new(config, nonce, SubIndexKind::Dense, DEFAULT_TAG)?;
            (dense, None, 0)
        };
        info!(
            zones = config.zone_count,
            sample_rate,
            dense_lists = dense.layout().routing.list_count,
            sample_lists = sample.as_ref().map_or(0, |sub| sub.layout().routing.list_count),
            "created volume index"
        );
        Ok(Self {
            sample_rate,
            dense,
            sample,
            sink: EventSink::default(),
        })
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn VolumeIndexObserver>) -> Self {
        self.sink.set_observer(observer);
        self
    }

    /// Upper bound on the bytes one zone's saved stream can take.
    pub fn compute_save_bytes(config: &IndexConfig) -> Result<usize> {
        volume_index_save_bytes(config)
    }

    pub fn zone_count(&self) -> u32 {
        self.dense.zone_count()
    }

    /// Zero when the index has no sample sub-index.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn nonce(&self) -> u64 {
        self.dense.nonce()
    }

    pub fn dense(&self) -> &VolumeSubIndex {
        &self.dense
    }

    pub fn sample(&self) -> Option<&VolumeSubIndex> {
        self.sample.as_ref()
    }

    pub fn is_sample(&self, name: &RecordName) -> bool {
        is_sample_name(self.sample_rate, name)
    }

    /// The zone whose worker must handle `name`.
    pub fn zone_for_name(&self, name: &RecordName) -> u32 {
        match &self.sample {
            Some(sample) if self.is_sample(name) => sample.layout().zone_for_name(name),
            _ => self.dense.layout().zone_for_name(name),
        }
    }

    /// Exclusive access to one zone.
    pub fn zone_handle(&mut self, zone: u32) -> Result<ZoneHandle<'_>> {
        if zone >= self.zone_count() {
            return Err(IndexError::invalid_argument(format!(
                "zone {zone} out of range for {} zones",
                self.zone_count()
            )));
        }
        let Self {
            sample_rate,
            dense,
            sample,
            sink,
        } = self;
        let sample = sample.as_ref().map(|sub| SampleZone {
            layout: &sub.layout,
            zone: &sub.zones[zone as usize],
        });
        Ok(ZoneHandle {
            zone_number: zone,
            sample_rate: *sample_rate,
            dense_layout: &dense.layout,
            dense: dense.zones[zone as usize].get_mut(),
            sample,
            sink,
        })
    }

    /// One handle per zone, each usable from its own thread, plus a lookup
    /// that may run anywhere.
    pub fn split_zones(&mut self) -> ZoneSplit<'_> {
        let Self {
            sample_rate,
            dense,
            sample,
            sink,
        } = self;
        let sample_rate = *sample_rate;
        let sink: &EventSink = sink;
        let sample = sample.as_ref();
        let dense_layout = &dense.layout;
        let zones = dense
            .zones
            .iter_mut()
            .enumerate()
            .map(|(zone, dense_zone)| ZoneHandle {
                zone_number: zone as u32,
                sample_rate,
                dense_layout,
                dense: dense_zone.get_mut(),
                sample: sample.map(|sub| SampleZone {
                    layout: &sub.layout,
                    zone: &sub.zones[zone],
                }),
                sink,
            })
            .collect();
        ZoneSplit {
            zones,
            lookup: SampleLookup::new(sample_rate, sample),
        }
    }

    pub fn sample_lookup(&self) -> SampleLookup<'_> {
        SampleLookup::new(self.sample_rate, self.sample.as_ref())
    }

    pub fn get_record(&mut self, name: &RecordName) -> Result<VolumeIndexRecord> {
        let zone = self.zone_for_name(name);
        self.zone_handle(zone)?.get_record(name)
    }

    pub fn put_record(&mut self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        self.zone_handle(record.zone_number())?
            .put_record(record, virtual_chapter)
    }

    pub fn remove_record(&mut self, record: &mut VolumeIndexRecord) -> Result<()> {
        self.zone_handle(record.zone_number())?.remove_record(record)
    }

    pub fn set_record_chapter(
        &mut self,
        record: &mut VolumeIndexRecord,
        virtual_chapter: u64,
    ) -> Result<()> {
        self.zone_handle(record.zone_number())?
            .set_record_chapter(record, virtual_chapter)
    }

    pub fn set_zone_open_chapter(&mut self, zone: u32, virtual_chapter: u64) -> Result<()> {
        self.zone_handle(zone)?.set_open_chapter(virtual_chapter);
        Ok(())
    }

    /// Open `virtual_chapter` in every zone.
    pub fn set_open_chapter(&mut self, virtual_chapter: u64) {
        for mut handle in self.split_zones().zones {
            handle.set_open_chapter(virtual_chapter);
        }
    }

    /// Read-only check of the sample sub-index.
    pub fn lookup_name(&self, name: &RecordName) -> Option<u64> {
        self.sample_lookup().lookup_name(name)
    }

    /// Chapter window of a dense zone.
    pub fn window(&self, zone: u32) -> (u64, u64) {
        self.dense.window(zone)
    }

    /// Dense and sample counters; the sample half is zero without sampling.
    pub fn stats(&self) -> (VolumeIndexStats, VolumeIndexStats) {
        let sample = self
            .sample
            .as_ref()
            .map(VolumeSubIndex::stats)
            .unwrap_or_default();
        (self.dense.stats(), sample)
    }

    pub fn combined_stats(&self) -> VolumeIndexStats {
        let (mut dense, sample) = self.stats();
        dense += sample;
        dense
    }

    pub fn memory_used(&self) -> usize {
        self.dense.memory_used() + self.sample.as_ref().map_or(0, VolumeSubIndex::memory_used)
    }

    /// Inserts dropped for lack of room since creation.
    pub fn overflow_drops(&self) -> u64 {
        self.sink.overflow_drops()
    }

    /// Empty both sub-indexes and reset every chapter window.
    pub fn empty(&mut self) {
        self.dense.reset();
        if let Some(sample) = &mut self.sample {
            sample.reset();
        }
    }
}
