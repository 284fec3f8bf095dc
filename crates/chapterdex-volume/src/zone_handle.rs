//! Per-zone access to a volume index.
//!
//! Each zone is owned by one worker. A [`ZoneHandle`] holds the dense zone
//! exclusively and reaches the sample zone through its mutex, since
//! [`SampleLookup`] may read the sample sub-index from any thread.

use chapterdex_error::{IndexError, Result};
use chapterdex_types::RecordName;
use parking_lot::Mutex;

use crate::record::VolumeIndexRecord;
use crate::sub_index::{EarlyFlush, SubIndexLayout, SubIndexZone, VolumeSubIndex};
use crate::telemetry::{EventSink, SubIndexKind, VolumeIndexEvent};
use crate::volume_index::is_sample_name;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SampleZone<'a> {
    pub(crate) layout: &'a SubIndexLayout,
    pub(crate) zone: &'a Mutex<SubIndexZone>,
}

pub struct ZoneHandle<'a> {
    pub(crate) zone_number: u32,
    pub(crate) sample_rate: u32,
    pub(crate) dense_layout: &'a SubIndexLayout,
    pub(crate) dense: &'a mut SubIndexZone,
    pub(crate) sample: Option<SampleZone<'a>>,
    pub(crate) sink: &'a EventSink,
}

impl std::fmt::Debug for ZoneHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneHandle")
            .field("zone_number", &self.zone_number)
            .field("sample_rate", &self.sample_rate)
            .field("window", &self.dense.window())
            .finish_non_exhaustive()
    }
}

impl ZoneHandle<'_> {
    pub fn zone_number(&self) -> u32 {
        self.zone_number
    }

    /// Chapter window of the dense zone.
    pub fn window(&self) -> (u64, u64) {
        self.dense.window()
    }

    fn check_zone(&self, zone: u32, what: &str) -> Result<()> {
        if zone == self.zone_number {
            Ok(())
        } else {
            Err(IndexError::invalid_argument(format!(
                "{what} belongs to zone {zone}, not zone {}",
                self.zone_number
            )))
        }
    }

    fn sample_zone(&self) -> Result<SampleZone<'_>> {
        self.sample
            .ok_or_else(|| IndexError::bad_state("volume index has no sample sub-index"))
    }

    /// Look up `name`. Entries in lists the window has moved past are
    /// flushed on the way.
    pub fn get_record(&mut self, name: &RecordName) -> Result<VolumeIndexRecord> {
        if is_sample_name(self.sample_rate, name) {
            let sample = self.sample_zone()?;
            self.check_zone(sample.layout.zone_for_name(name), "record name")?;
            sample.zone.lock().get_record(sample.layout, name)
        } else {
            self.check_zone(self.dense_layout.zone_for_name(name), "record name")?;
            self.dense.get_record(self.dense_layout, name)
        }
    }

    /// Store `record` in `virtual_chapter`. Running out of room drops the
    /// entry, which is reported and then returned as `Overflow`.
    pub fn put_record(&mut self, record: &mut VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        self.check_zone(record.zone_number, "record")?;
        let result = match record.sub_index {
            SubIndexKind::Dense => self.dense.put_record(self.dense_layout, record, virtual_chapter),
            SubIndexKind::Sample => {
                let sample = self.sample_zone()?;
                sample.zone.lock().put_record(sample.layout, record, virtual_chapter)
            }
        };
        if let Err(err) = &result {
            if err.is_overflow() {
                self.sink
                    .entry_overflow(record.sub_index, self.zone_number, virtual_chapter);
            }
        }
        result
    }

    pub fn remove_record(&mut self, record: &mut VolumeIndexRecord) -> Result<()> {
        self.check_zone(record.zone_number, "record")?;
        match record.sub_index {
            SubIndexKind::Dense => self.dense.remove_record(record),
            SubIndexKind::Sample => self.sample_zone()?.zone.lock().remove_record(record),
        }
    }

    pub fn set_record_chapter(
        &mut self,
        record: &mut VolumeIndexRecord,
        virtual_chapter: u64,
    ) -> Result<()> {
        self.check_zone(record.zone_number, "record")?;
        match record.sub_index {
            SubIndexKind::Dense => {
                self.dense
                    .set_record_chapter(self.dense_layout, record, virtual_chapter)
            }
            SubIndexKind::Sample => {
                let sample = self.sample_zone()?;
                sample
                    .zone
                    .lock()
                    .set_record_chapter(sample.layout, record, virtual_chapter)
            }
        }
    }

    /// Make `virtual_chapter` the newest chapter of this zone in both
    /// sub-indexes.
    pub fn set_open_chapter(&mut self, virtual_chapter: u64) {
        let flush = self.dense.set_open_chapter(self.dense_layout, virtual_chapter);
        self.report_flush(SubIndexKind::Dense, virtual_chapter, flush);
        if let Some(sample) = self.sample {
            let flush = sample
                .zone
                .lock()
                .set_open_chapter(sample.layout, virtual_chapter);
            self.report_flush(SubIndexKind::Sample, virtual_chapter, flush);
        }
    }

    fn report_flush(&self, sub_index: SubIndexKind, chapter: u64, flush: Option<EarlyFlush>) {
        if let Some(flush) = flush {
            self.sink.emit(&VolumeIndexEvent::EarlyFlush {
                sub_index,
                zone: self.zone_number,
                chapter,
                first_expired: flush.first_expired,
                last_expired: flush.last_expired,
            });
        }
    }
}

/// Read-only queries against the sample sub-index. Safe to share across
/// threads while zone handles are in use.
#[derive(Debug, Clone, Copy)]
pub struct SampleLookup<'a> {
    sample_rate: u32,
    sample: Option<&'a VolumeSubIndex>,
}

impl<'a> SampleLookup<'a> {
    pub(crate) fn new(sample_rate: u32, sample: Option<&'a VolumeSubIndex>) -> Self {
        Self {
            sample_rate,
            sample,
        }
    }

    /// Chapter of `name` if it is a sampled name present in the index.
    /// Answers may be stale by the time the caller acts on them.
    pub fn lookup_name(&self, name: &RecordName) -> Option<u64> {
        self.lookup_with_window(name)
            .and_then(|reading| reading.chapter)
    }

    /// Like `lookup_name`, but also returns the window of the name's zone
    /// as it stood when the chapter was checked. `None` if the name is not
    /// sampled or the index has no sample sub-index.
    pub fn lookup_with_window(&self, name: &RecordName) -> Option<SampleReading> {
        if !is_sample_name(self.sample_rate, name) {
            return None;
        }
        let sample = self.sample?;
        let layout = sample.layout();
        let zone = layout.zone_for_name(name);
        let mut guard = sample.zones[zone as usize].lock();
        Some(SampleReading {
            zone,
            chapter: guard.lookup(layout, name),
            window: guard.window(),
        })
    }

    /// Chapter window of a sample zone.
    pub fn window(&self, zone: u32) -> Option<(u64, u64)> {
        let sample = self.sample?;
        sample
            .zones
            .get(zone as usize)
            .map(|zone| zone.lock().window())
    }
}

/// One sample lookup and the window it was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleReading {
    pub zone: u32,
    /// Always inside `window` when present.
    pub chapter: Option<u64>,
    pub window: (u64, u64),
}

/// Every zone of a volume index, split for concurrent use.
#[derive(Debug)]
pub struct ZoneSplit<'a> {
    pub zones: Vec<ZoneHandle<'a>>,
    pub lookup: SampleLookup<'a>,
}
