//! A delta index whose payload is a chapter number.
//!
//! Entries store the index chapter (the virtual chapter masked to
//! `chapter_bits`). Each zone keeps the window `[low, high]` of virtual
//! chapters it currently indexes, and each list remembers the oldest
//! chapter that may still have stale entries in it. Stale entries are
//! removed the next time a lookup walks their list.

use chapterdex_delta::{DeltaIndex, DeltaIndexEntry, DeltaZone, ListRouting};
use chapterdex_error::{IndexError, Result};
use chapterdex_types::{IndexConfig, RecordName};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::params::SubIndexParams;
use crate::record::VolumeIndexRecord;
use crate::telemetry::SubIndexKind;

/// Fixed properties of a sub-index, shared by all its zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIndexLayout {
    pub kind: SubIndexKind,
    pub address_bits: u32,
    pub address_mask: u32,
    pub chapter_bits: u32,
    pub chapter_mask: u32,
    /// Length of the chapter window.
    pub chapter_count: u64,
    pub routing: ListRouting,
    /// Expected bits one chapter adds to one zone.
    pub chapter_zone_bits: u64,
    /// Zone size past which chapters are expired early.
    pub max_zone_bits: u64,
    pub tag: u8,
}

impl SubIndexLayout {
    #[inline]
    pub fn address(&self, name: &RecordName) -> u32 {
        (name.volume_index_bytes() & u64::from(self.address_mask)) as u32
    }

    #[inline]
    pub fn list_number(&self, name: &RecordName) -> u32 {
        ((name.volume_index_bytes() >> self.address_bits) % u64::from(self.routing.list_count))
            as u32
    }

    pub fn zone_for_name(&self, name: &RecordName) -> u32 {
        self.routing.zone_for_list(self.list_number(name))
    }

    #[inline]
    pub fn index_chapter(&self, virtual_chapter: u64) -> u32 {
        (virtual_chapter & u64::from(self.chapter_mask)) as u32
    }
}

/// A run of index chapters, possibly wrapping past `chapter_mask`.
#[derive(Debug, Clone, Copy)]
struct ChapterRange {
    start: u32,
    count: u32,
}

/// Expired-early chapters reported by [`SubIndexZone::set_open_chapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EarlyFlush {
    pub first_expired: u64,
    pub last_expired: u64,
}

/// One zone of a sub-index: the delta zone plus its chapter bookkeeping.
#[derive(Debug)]
pub struct SubIndexZone {
    pub(crate) delta: DeltaZone,
    /// Oldest chapter that may still have entries in each list, by
    /// zone-relative list number.
    pub(crate) flush_chapters: Vec<u64>,
    pub(crate) virtual_chapter_low: u64,
    pub(crate) virtual_chapter_high: u64,
    pub(crate) early_flushes: u64,
}

impl SubIndexZone {
    fn new(delta: DeltaZone) -> Self {
        let lists = delta.list_count() as usize;
        Self {
            delta,
            flush_chapters: vec![0; lists],
            virtual_chapter_low: 0,
            virtual_chapter_high: 0,
            early_flushes: 0,
        }
    }

    pub fn window(&self) -> (u64, u64) {
        (self.virtual_chapter_low, self.virtual_chapter_high)
    }

    pub fn early_flushes(&self) -> u64 {
        self.early_flushes
    }

    pub fn bits_used(&self) -> u64 {
        self.delta.bits_used()
    }

    /// Empty the zone and forget its window.
    pub(crate) fn reset(&mut self) {
        self.delta.empty();
        self.flush_chapters.fill(0);
        self.virtual_chapter_low = 0;
        self.virtual_chapter_high = 0;
        self.early_flushes = 0;
    }

    fn is_indexed(&self, virtual_chapter: u64) -> bool {
        (self.virtual_chapter_low..=self.virtual_chapter_high).contains(&virtual_chapter)
    }

    /// Virtual chapter of a stored index chapter, relative to this zone's
    /// window.
    fn to_virtual(&self, layout: &SubIndexLayout, index_chapter: u32) -> u64 {
        let rolling =
            u64::from(index_chapter).wrapping_sub(self.virtual_chapter_low) & u64::from(layout.chapter_mask);
        self.virtual_chapter_low + rolling
    }

    fn local_list(&self, list_number: u32) -> usize {
        (list_number - self.delta.first_list()) as usize
    }

    /// Step to the next entry, removing every entry whose chapter falls in
    /// `range` on the way.
    fn flush_invalid_entries(
        &mut self,
        layout: &SubIndexLayout,
        entry: &mut DeltaIndexEntry,
        range: ChapterRange,
        next_to_invalidate: &mut u32,
    ) -> Result<()> {
        self.delta.next_entry(entry)?;
        while !entry.at_end {
            let index_chapter = self.delta.entry_value(entry);
            let relative = index_chapter.wrapping_sub(range.start) & layout.chapter_mask;
            if relative >= range.count {
                *next_to_invalidate = (*next_to_invalidate).min(relative);
                break;
            }
            self.delta.remove_entry(entry)?;
        }
        Ok(())
    }

    /// Search a list from its start, purging expired entries as it goes.
    /// The whole list is walked so it comes out clean; `range` is updated
    /// to begin at the oldest chapter still present.
    fn search_with_flush(
        &mut self,
        layout: &SubIndexLayout,
        list_number: u32,
        key: u32,
        name: &RecordName,
        range: &mut ChapterRange,
    ) -> Result<DeltaIndexEntry> {
        let mut next_to_invalidate = layout.chapter_mask;
        let mut entry = self.delta.start_search(list_number, 0)?;
        loop {
            self.flush_invalid_entries(layout, &mut entry, *range, &mut next_to_invalidate)?;
            if entry.at_end || key <= entry.key {
                break;
            }
        }
        self.delta.remember_offset(&entry)?;

        let mut other = entry;
        if !other.at_end && key == other.key {
            loop {
                self.flush_invalid_entries(layout, &mut other, *range, &mut next_to_invalidate)?;
                if other.at_end || !other.is_collision {
                    break;
                }
                if self.delta.collision_name(&other)? == *name {
                    entry = other;
                    break;
                }
            }
        }
        while !other.at_end {
            self.flush_invalid_entries(layout, &mut other, *range, &mut next_to_invalidate)?;
        }

        range.start = next_to_invalidate.wrapping_add(range.start) & layout.chapter_mask;
        range.count = 0;
        Ok(entry)
    }

    /// Find the record for `name`, flushing its list first if the window
    /// has moved past the list's oldest chapter.
    pub(crate) fn get_record(
        &mut self,
        layout: &SubIndexLayout,
        name: &RecordName,
    ) -> Result<VolumeIndexRecord> {
        let address = layout.address(name);
        let list_number = layout.list_number(name);
        let local = self.local_list(list_number);
        let flush_chapter = self.flush_chapters[local];

        let entry = if flush_chapter < self.virtual_chapter_low {
            let flush_count = self.virtual_chapter_low - flush_chapter;
            let mut range = ChapterRange {
                start: layout.index_chapter(flush_chapter),
                count: if flush_count > u64::from(layout.chapter_mask) {
                    layout.chapter_mask + 1
                } else {
                    flush_count as u32
                },
            };
            let entry = self.search_with_flush(layout, list_number, address, name, &mut range)?;
            let next_flush = self.to_virtual(layout, range.start);
            self.flush_chapters[local] = next_flush.min(self.virtual_chapter_high);
            entry
        } else {
            self.delta.get_entry(list_number, address, name)?
        };

        let mut record =
            VolumeIndexRecord::new(*name, layout.kind, self.delta.zone_number(), entry);
        record.is_found = !entry.at_end && entry.key == address;
        if record.is_found {
            record.virtual_chapter = self.to_virtual(layout, self.delta.entry_value(&entry));
        }
        record.is_collision = entry.is_collision;
        Ok(record)
    }

    fn check_window(&self, virtual_chapter: u64, action: &str) -> Result<()> {
        if self.is_indexed(virtual_chapter) {
            Ok(())
        } else {
            Err(IndexError::invalid_argument(format!(
                "cannot {action} chapter number {virtual_chapter} that is out of the valid range {} to {}",
                self.virtual_chapter_low, self.virtual_chapter_high
            )))
        }
    }

    /// Store `record` in `virtual_chapter`. A found record gains a
    /// collision entry carrying its full name.
    pub(crate) fn put_record(
        &mut self,
        layout: &SubIndexLayout,
        record: &mut VolumeIndexRecord,
        virtual_chapter: u64,
    ) -> Result<()> {
        record.check_valid()?;
        self.check_window(virtual_chapter, "put record into")?;
        let address = layout.address(&record.name);
        let name = record.is_found.then_some(&record.name);
        self.delta.put_entry(
            &mut record.entry,
            address,
            layout.index_chapter(virtual_chapter),
            name,
        )?;
        record.virtual_chapter = virtual_chapter;
        record.is_collision = record.entry.is_collision;
        record.is_found = true;
        Ok(())
    }

    pub(crate) fn remove_record(&mut self, record: &mut VolumeIndexRecord) -> Result<()> {
        record.check_found()?;
        record.valid = false;
        self.delta.remove_entry(&mut record.entry)
    }

    pub(crate) fn set_record_chapter(
        &mut self,
        layout: &SubIndexLayout,
        record: &mut VolumeIndexRecord,
        virtual_chapter: u64,
    ) -> Result<()> {
        record.check_found()?;
        self.check_window(virtual_chapter, "set")?;
        self.delta
            .set_entry_value(&record.entry, layout.index_chapter(virtual_chapter))?;
        record.virtual_chapter = virtual_chapter;
        Ok(())
    }

    /// Chapter holding `name`, if it is present and inside the window.
    pub(crate) fn lookup(&mut self, layout: &SubIndexLayout, name: &RecordName) -> Option<u64> {
        let address = layout.address(name);
        let entry = self
            .delta
            .get_entry(layout.list_number(name), address, name)
            .ok()?;
        if entry.at_end || entry.key != address {
            return None;
        }
        let virtual_chapter = self.to_virtual(layout, self.delta.entry_value(&entry));
        (virtual_chapter <= self.virtual_chapter_high).then_some(virtual_chapter)
    }

    /// Slide the window so `virtual_chapter` is the newest chapter, then
    /// expire extra chapters if the zone has outgrown its budget.
    pub(crate) fn set_open_chapter(
        &mut self,
        layout: &SubIndexLayout,
        virtual_chapter: u64,
    ) -> Option<EarlyFlush> {
        self.virtual_chapter_low = (virtual_chapter + 1).saturating_sub(layout.chapter_count);
        self.virtual_chapter_high = virtual_chapter;

        let used_bits = self.delta.bits_used();
        if used_bits <= layout.max_zone_bits {
            return None;
        }
        let expire_count =
            1 + (used_bits - layout.max_zone_bits) / layout.chapter_zone_bits.max(1);
        let first_expired = self.virtual_chapter_low;
        let new_low = first_expired
            .saturating_add(expire_count)
            .min(self.virtual_chapter_high);
        if new_low == first_expired {
            return None;
        }
        self.early_flushes += new_low - first_expired;
        self.virtual_chapter_low = new_low;
        let last_expired = new_low - 1;
        if first_expired == last_expired {
            info!(
                zone = self.delta.zone_number(),
                sub_index = layout.kind.as_str(),
                chapter = virtual_chapter,
                expired = first_expired,
                "expiring chapter early"
            );
        } else {
            info!(
                zone = self.delta.zone_number(),
                sub_index = layout.kind.as_str(),
                chapter = virtual_chapter,
                first_expired,
                last_expired,
                "expiring chapters early"
            );
        }
        Some(EarlyFlush {
            first_expired,
            last_expired,
        })
    }
}

/// Counters for one sub-index, summed over its zones. The delta counters
/// mean what they mean in `DeltaIndexStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VolumeIndexStats {
    pub memory_allocated: usize,
    pub rebalance_time_ns: u64,
    pub rebalance_count: u64,
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    /// Inserts dropped for lack of room.
    pub overflow_count: u64,
    pub list_count: u64,
    /// Chapters expired before their time to bring a zone back under budget.
    pub early_flushes: u64,
}

impl std::ops::AddAssign for VolumeIndexStats {
    fn add_assign(&mut self, other: Self) {
        self.memory_allocated += other.memory_allocated;
        self.rebalance_time_ns = self.rebalance_time_ns.saturating_add(other.rebalance_time_ns);
        self.rebalance_count += other.rebalance_count;
        self.record_count = self.record_count.wrapping_add(other.record_count);
        self.collision_count = self.collision_count.wrapping_add(other.collision_count);
        self.discard_count = self.discard_count.wrapping_add(other.discard_count);
        self.overflow_count += other.overflow_count;
        self.list_count += other.list_count;
        self.early_flushes += other.early_flushes;
    }
}

/// A sub-index with each zone behind its own mutex.
///
/// The dense sub-index is only ever reached through `&mut` access or a
/// zone handle that owns its zone, so its mutexes are never contended.
/// The sample sub-index locks them because fast-path lookups come from
/// other threads.
#[derive(Debug)]
pub struct VolumeSubIndex {
    pub(crate) layout: SubIndexLayout,
    pub(crate) zones: Vec<Mutex<SubIndexZone>>,
    pub(crate) nonce: u64,
}

impl VolumeSubIndex {
    pub fn new(config: &IndexConfig, nonce: u64, kind: SubIndexKind, tag: u8) -> Result<Self> {
        let params = SubIndexParams::compute(config)?;
        let zone_count = config.zone_count;
        let mut delta = DeltaIndex::new(
            zone_count,
            params.list_count,
            params.mean_delta,
            params.chapter_bits,
            params.memory_size,
        )?;
        delta.set_tag(tag);
        let max_zone_bits = delta
            .bits_allocated()
            .saturating_sub(params.target_free_size as u64 * 8)
            / u64::from(zone_count);
        let (zones, routing) = delta.into_zones();
        let layout = SubIndexLayout {
            kind,
            address_bits: params.address_bits,
            address_mask: ((1u64 << params.address_bits) - 1) as u32,
            chapter_bits: params.chapter_bits,
            chapter_mask: ((1u64 << params.chapter_bits) - 1) as u32,
            chapter_count: params.chapter_count,
            routing,
            chapter_zone_bits: params.bits_per_chapter / u64::from(zone_count),
            max_zone_bits,
            tag,
        };
        debug!(
            sub_index = kind.as_str(),
            lists = params.list_count,
            mean_delta = params.mean_delta,
            chapter_bits = params.chapter_bits,
            memory = params.memory_size,
            max_zone_bits,
            "initialized volume sub-index"
        );
        Ok(Self {
            layout,
            zones: zones
                .into_iter()
                .map(|zone| Mutex::new(SubIndexZone::new(zone)))
                .collect(),
            nonce,
        })
    }

    pub fn layout(&self) -> &SubIndexLayout {
        &self.layout
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn zone_count(&self) -> u32 {
        self.layout.routing.zone_count
    }

    #[cfg(test)]
    pub(crate) fn zone_mut(&mut self, zone: u32) -> &mut SubIndexZone {
        self.zones[zone as usize].get_mut()
    }

    pub(crate) fn zones_mut(&mut self) -> impl Iterator<Item = &mut SubIndexZone> {
        self.zones.iter_mut().map(Mutex::get_mut)
    }

    pub fn window(&self, zone: u32) -> (u64, u64) {
        self.zones[zone as usize].lock().window()
    }

    pub(crate) fn reset(&mut self) {
        for zone in self.zones_mut() {
            zone.reset();
        }
    }

    pub fn bits_used(&self) -> u64 {
        self.zones.iter().map(|zone| zone.lock().bits_used()).sum()
    }

    pub fn memory_used(&self) -> usize {
        self.bits_used().div_ceil(8) as usize
    }

    pub fn stats(&self) -> VolumeIndexStats {
        let mut stats = VolumeIndexStats::default();
        for zone in &self.zones {
            let zone = zone.lock();
            let delta = chapterdex_delta::DeltaIndexStats::of_zone(&zone.delta);
            stats += VolumeIndexStats {
                memory_allocated: delta.memory_allocated
                    + zone.flush_chapters.len() * std::mem::size_of::<u64>()
                    + 3 * std::mem::size_of::<u64>(),
                rebalance_time_ns: delta.rebalance_time_ns,
                rebalance_count: delta.rebalance_count,
                record_count: delta.record_count,
                collision_count: delta.collision_count,
                discard_count: delta.discard_count,
                overflow_count: delta.overflow_count,
                list_count: delta.list_count,
                early_flushes: zone.early_flushes,
            };
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapterdex_types::{Geometry, RECORD_NAME_SIZE};

    fn sub_index(chapters: u64) -> VolumeSubIndex {
        let config = IndexConfig::new(Geometry::new(1024, chapters)).with_min_delta_lists(16);
        VolumeSubIndex::new(&config, 0, SubIndexKind::Dense, b'm').expect("sub-index")
    }

    /// A name that lands in `list` with the given address.
    fn name_for(layout: &SubIndexLayout, list: u32, address: u32, salt: u8) -> RecordName {
        let mut name = RecordName::new([salt; RECORD_NAME_SIZE]);
        name.set_volume_index_bytes((u64::from(list) << layout.address_bits) | u64::from(address));
        name
    }

    #[test]
    fn test_name_fields() {
        let sub = sub_index(10);
        let layout = sub.layout;
        assert_eq!(layout.address_bits, 20);
        assert_eq!(layout.chapter_mask, 15);
        let name = name_for(&layout, 7, 0x1234, 0);
        assert_eq!(layout.list_number(&name), 7);
        assert_eq!(layout.address(&name), 0x1234);
        let wrapped = name_for(&layout, 40 + 3, 9, 0);
        assert_eq!(layout.list_number(&wrapped), 3);
    }

    #[test]
    fn test_window_tracks_open_chapter() {
        let mut sub = sub_index(10);
        let layout = sub.layout;
        let zone = sub.zone_mut(0);
        assert!(zone.set_open_chapter(&layout, 3).is_none());
        assert_eq!(zone.window(), (0, 3));
        zone.set_open_chapter(&layout, 9);
        assert_eq!(zone.window(), (0, 9));
        zone.set_open_chapter(&layout, 10);
        assert_eq!(zone.window(), (1, 10));
        zone.set_open_chapter(&layout, 100);
        assert_eq!(zone.window(), (91, 100));
    }

    #[test]
    fn test_index_chapter_wraps_back_to_virtual() {
        let mut sub = sub_index(10);
        let layout = sub.layout;
        let zone = sub.zone_mut(0);
        zone.set_open_chapter(&layout, 37);
        assert_eq!(zone.window(), (28, 37));
        for chapter in 28..=37 {
            let index_chapter = layout.index_chapter(chapter);
            assert_eq!(zone.to_virtual(&layout, index_chapter), chapter);
        }
    }

    #[test]
    fn test_put_outside_window_is_invalid() {
        let mut sub = sub_index(10);
        let layout = sub.layout;
        let name = name_for(&layout, 1, 77, 1);
        let zone = sub.zone_mut(0);
        zone.set_open_chapter(&layout, 20);
        let mut record = zone.get_record(&layout, &name).expect("get");
        assert!(!record.is_found());
        for chapter in [10, 21] {
            let err = zone.put_record(&layout, &mut record, chapter).expect_err("outside");
            assert!(matches!(err, IndexError::InvalidArgument { .. }));
        }
        zone.put_record(&layout, &mut record, 15).expect("inside");
        assert_eq!(record.virtual_chapter(), Some(15));
    }

    #[test]
    fn test_removed_record_is_rejected() {
        let mut sub = sub_index(10);
        let layout = sub.layout;
        let name = name_for(&layout, 2, 5, 2);
        let zone = sub.zone_mut(0);
        zone.set_open_chapter(&layout, 0);

        let mut fresh = zone.get_record(&layout, &name).expect("get");
        let err = zone.remove_record(&mut fresh).expect_err("not found");
        assert!(matches!(err, IndexError::BadState { .. }));
        let err = zone.set_record_chapter(&layout, &mut fresh, 0).expect_err("not found");
        assert!(matches!(err, IndexError::BadState { .. }));

        zone.put_record(&layout, &mut fresh, 0).expect("put");
        let mut record = zone.get_record(&layout, &name).expect("get");
        zone.remove_record(&mut record).expect("remove");
        assert!(!record.is_valid());
        for result in [
            zone.put_record(&layout, &mut record, 0),
            zone.remove_record(&mut record),
            zone.set_record_chapter(&layout, &mut record, 0),
        ] {
            assert!(matches!(result, Err(IndexError::BadState { .. })));
        }
    }

    #[test]
    fn test_early_flush_caps_at_open_chapter() {
        let mut sub = sub_index(10);
        let mut layout = sub.layout;
        layout.max_zone_bits = 0;
        layout.chapter_zone_bits = 1;
        let name = name_for(&layout, 0, 1, 3);
        let zone = sub.zone_mut(0);
        zone.set_open_chapter(&layout, 0);
        let mut record = zone.get_record(&layout, &name).expect("get");
        zone.put_record(&layout, &mut record, 0).expect("put");

        let flush = zone.set_open_chapter(&layout, 12).expect("early flush");
        assert_eq!(flush.first_expired, 3);
        assert_eq!(flush.last_expired, 11);
        assert_eq!(zone.window(), (12, 12));
        assert_eq!(zone.early_flushes(), 9);
    }
}
