//! A delta index: delta lists partitioned across independent zones.

use chapterdex_error::{IndexError, Result};
use chapterdex_types::RecordName;
use tracing::debug;

use crate::entry::DeltaIndexEntry;
use crate::stats::DeltaIndexStats;
use crate::zone::{DEFAULT_TAG, DeltaZone};

/// Zone buffers are allocated in multiples of this many bytes.
pub const ZONE_ALLOC_BOUNDARY: usize = 64 * 1024;

/// Bytes given to each zone when `memory_size` is split `zone_count` ways.
pub fn zone_memory_size(zone_count: u32, memory_size: usize) -> usize {
    (memory_size / zone_count as usize).next_multiple_of(ZONE_ALLOC_BOUNDARY)
}

/// How global list numbers map onto zones: contiguous runs of
/// `lists_per_zone`, the last zone taking the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListRouting {
    /// Lists across the whole index.
    pub list_count: u32,
    pub zone_count: u32,
    /// Lists in every zone but the last.
    pub lists_per_zone: u32,
}

impl ListRouting {
    /// Fails unless every zone gets at least one list.
    pub fn new(list_count: u32, zone_count: u32) -> Result<Self> {
        if zone_count == 0 {
            return Err(IndexError::invalid_argument("zone count must be nonzero"));
        }
        let lists_per_zone = list_count.div_ceil(zone_count);
        let last_first = (zone_count - 1) * lists_per_zone;
        if list_count <= last_first {
            return Err(IndexError::invalid_argument(format!(
                "{list_count} delta lists not enough for {zone_count} zones"
            )));
        }
        Ok(Self {
            list_count,
            zone_count,
            lists_per_zone,
        })
    }

    /// Zone owning `list_number`. The number is not range checked.
    #[inline]
    pub fn zone_for_list(&self, list_number: u32) -> u32 {
        list_number / self.lists_per_zone
    }

    /// Global number of the first list in `zone`.
    pub fn first_list(&self, zone: u32) -> u32 {
        zone * self.lists_per_zone
    }

    pub fn lists_in_zone(&self, zone: u32) -> u32 {
        if zone + 1 == self.zone_count {
            self.list_count - self.first_list(zone)
        } else {
            self.lists_per_zone
        }
    }

    /// Zone owning `list_number`, or `InvalidArgument` if the index has no
    /// such list.
    pub fn check_list(&self, list_number: u32) -> Result<u32> {
        if list_number < self.list_count {
            Ok(self.zone_for_list(list_number))
        } else {
            Err(IndexError::invalid_argument(format!(
                "delta list number {list_number} is out of range ({})",
                self.list_count
            )))
        }
    }
}

/// Delta lists spread over zones. Every entry operation is forwarded to the
/// zone that owns the entry's list.
#[derive(Debug)]
pub struct DeltaIndex {
    zones: Vec<DeltaZone>,
    routing: ListRouting,
    mutable: bool,
    tag: u8,
}

impl DeltaIndex {
    /// Create an empty mutable index of `list_count` lists spread over
    /// `zone_count` zones sharing `memory_size` bytes.
    pub fn new(
        zone_count: u32,
        list_count: u32,
        mean_delta: u32,
        value_bits: u32,
        memory_size: usize,
    ) -> Result<Self> {
        let routing = ListRouting::new(list_count, zone_count)?;
        let zone_bytes = zone_memory_size(zone_count, memory_size);
        let zones = (0..zone_count)
            .map(|zone| {
                DeltaZone::new(
                    zone,
                    zone_bytes,
                    routing.first_list(zone),
                    routing.lists_in_zone(zone),
                    mean_delta,
                    value_bits,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        debug!(
            zone_count,
            list_count,
            mean_delta,
            value_bits,
            zone_bytes,
            "initialized delta index"
        );
        Ok(Self {
            zones,
            routing,
            mutable: true,
            tag: DEFAULT_TAG,
        })
    }

    /// Wrap a single immutable zone decoded from a page.
    pub(crate) fn from_immutable_zone(zone: DeltaZone) -> Self {
        let routing = ListRouting {
            list_count: zone.list_count,
            zone_count: 1,
            lists_per_zone: zone.list_count,
        };
        let tag = zone.tag;
        Self {
            zones: vec![zone],
            routing,
            mutable: false,
            tag,
        }
    }

    pub fn routing(&self) -> ListRouting {
        self.routing
    }

    pub fn list_count(&self) -> u32 {
        self.routing.list_count
    }

    pub fn zone_count(&self) -> u32 {
        self.routing.zone_count
    }

    /// False for an index opened from a page.
    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// Label the index and its zones. The tag is written into every saved
    /// list record and checked on restore.
    pub fn set_tag(&mut self, tag: u8) {
        self.tag = tag;
        for zone in &mut self.zones {
            zone.set_tag(tag);
        }
    }

    pub fn zone(&self, zone: u32) -> &DeltaZone {
        &self.zones[zone as usize]
    }

    pub fn zone_mut(&mut self, zone: u32) -> &mut DeltaZone {
        &mut self.zones[zone as usize]
    }

    pub fn zones(&self) -> &[DeltaZone] {
        &self.zones
    }

    pub fn zones_mut(&mut self) -> &mut [DeltaZone] {
        &mut self.zones
    }

    pub fn zone_for_list(&self, list_number: u32) -> u32 {
        self.routing.zone_for_list(list_number)
    }

    /// Hand the zones to an owner that guards each one separately.
    pub fn into_zones(self) -> (Vec<DeltaZone>, ListRouting) {
        (self.zones, self.routing)
    }

    /// Drop every entry, keeping the allocation.
    pub fn empty(&mut self) {
        for zone in &mut self.zones {
            zone.empty();
        }
    }

    pub fn empty_zone(&mut self, zone: u32) {
        self.zones[zone as usize].empty();
    }

    /// Position a cursor in `list_number` at or before the first entry
    /// whose key could be `key`.
    pub fn start_search(&self, list_number: u32, key: u32) -> Result<DeltaIndexEntry> {
        let zone = self.routing.check_list(list_number)?;
        self.zones[zone as usize].start_search(list_number, key)
    }

    pub fn next_entry(&self, entry: &mut DeltaIndexEntry) -> Result<()> {
        self.zones[entry.zone_number as usize].next_entry(entry)
    }

    /// Cache `entry` as the search start for its list.
    pub fn remember_offset(&mut self, entry: &DeltaIndexEntry) -> Result<()> {
        self.zones[entry.zone_number as usize].remember_offset(entry)
    }

    /// Find `key` in `list_number`. With colliding keys the entry whose
    /// stored name is `name` wins; otherwise the cursor rests on the first
    /// entry at or past `key`, where an insert would go.
    pub fn get_entry(
        &mut self,
        list_number: u32,
        key: u32,
        name: &RecordName,
    ) -> Result<DeltaIndexEntry> {
        let zone = self.routing.check_list(list_number)?;
        self.zones[zone as usize].get_entry(list_number, key, name)
    }

    /// Insert before `entry`. Pass `name` only when `key` equals the key at
    /// the cursor, which makes the new entry a collision entry.
    pub fn put_entry(
        &mut self,
        entry: &mut DeltaIndexEntry,
        key: u32,
        value: u32,
        name: Option<&RecordName>,
    ) -> Result<()> {
        self.zones[entry.zone_number as usize].put_entry(entry, key, value, name)
    }

    /// Remove the entry under the cursor; the cursor moves to the next one.
    pub fn remove_entry(&mut self, entry: &mut DeltaIndexEntry) -> Result<()> {
        self.zones[entry.zone_number as usize].remove_entry(entry)
    }

    /// Payload of the entry under the cursor.
    pub fn entry_value(&self, entry: &DeltaIndexEntry) -> u32 {
        self.zones[entry.zone_number as usize].entry_value(entry)
    }

    pub fn set_entry_value(&mut self, entry: &DeltaIndexEntry, value: u32) -> Result<()> {
        self.zones[entry.zone_number as usize].set_entry_value(entry, value)
    }

    pub fn collision_name(&self, entry: &DeltaIndexEntry) -> Result<RecordName> {
        self.zones[entry.zone_number as usize].collision_name(entry)
    }

    /// Bits taken by the lists of `zone`, gaps excluded.
    pub fn zone_bits_used(&self, zone: u32) -> u64 {
        self.zones[zone as usize].bits_used()
    }

    pub fn bits_used(&self) -> u64 {
        self.zones.iter().map(DeltaZone::bits_used).sum()
    }

    pub fn bits_allocated(&self) -> u64 {
        self.zones.iter().map(DeltaZone::bits_allocated).sum()
    }

    pub fn memory_allocated(&self) -> usize {
        self.zones.iter().map(DeltaZone::memory_allocated).sum()
    }

    /// Counters summed over all zones.
    pub fn stats(&self) -> DeltaIndexStats {
        self.zones.iter().sum()
    }

    /// Check that lists are ordered and do not overlap in any zone.
    pub fn verify_layout(&self) -> Result<()> {
        self.zones.iter().try_for_each(DeltaZone::verify_layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapterdex_types::RECORD_NAME_SIZE;

    #[test]
    fn test_zone_memory_rounds_up() {
        assert_eq!(zone_memory_size(1, 1), 64 * 1024);
        assert_eq!(zone_memory_size(2, 1024 * 1024), 512 * 1024);
        assert_eq!(zone_memory_size(3, 1024 * 1024), 384 * 1024);
    }

    #[test]
    fn test_routing_gives_remainder_to_last_zone() {
        let routing = ListRouting::new(10, 3).expect("routing");
        assert_eq!(routing.lists_per_zone, 4);
        assert_eq!(routing.lists_in_zone(0), 4);
        assert_eq!(routing.lists_in_zone(2), 2);
        assert_eq!(routing.zone_for_list(9), 2);
        let err = routing.check_list(10).expect_err("out of range");
        assert!(matches!(err, IndexError::InvalidArgument { .. }));
    }

    #[test]
    fn test_routing_rejects_too_few_lists() {
        // Four lists over three zones leaves the last zone empty.
        assert!(ListRouting::new(4, 3).is_err());
        assert!(ListRouting::new(3, 3).is_ok());
    }

    #[test]
    fn test_entries_route_to_their_zone() {
        let mut index = DeltaIndex::new(4, 64, 256, 8, 1 << 20).expect("index");
        let name = RecordName::new([3; RECORD_NAME_SIZE]);
        for list in [0u32, 17, 33, 63] {
            let mut entry = index.get_entry(list, 100 + list, &name).expect("get");
            assert_eq!(entry.zone_number(), index.zone_for_list(list));
            index.put_entry(&mut entry, 100 + list, list, None).expect("put");
        }
        let stats = index.stats();
        assert_eq!(stats.record_count, 4);
        assert_eq!(stats.list_count, 64);
        for zone in 0..4 {
            assert_eq!(index.zone(zone).record_count(), 1);
        }
        let entry = index.get_entry(33, 133, &name).expect("lookup");
        assert_eq!(index.entry_value(&entry), 33);
        index.verify_layout().expect("layout");
    }

    #[test]
    fn test_list_number_past_end_is_invalid_argument() {
        let mut index = DeltaIndex::new(2, 8, 256, 8, 1 << 17).expect("index");
        let name = RecordName::new([0; RECORD_NAME_SIZE]);
        let err = index.get_entry(8, 1, &name).expect_err("no list 8");
        assert!(matches!(err, IndexError::InvalidArgument { .. }));
        let err = index.start_search(u32::MAX, 1).expect_err("no such list");
        assert!(matches!(err, IndexError::InvalidArgument { .. }));
    }

    #[test]
    fn test_set_tag_reaches_zones() {
        let mut index = DeltaIndex::new(2, 8, 256, 8, 1 << 17).expect("index");
        index.set_tag(b'd');
        assert_eq!(index.tag(), b'd');
        assert!(index.zones().iter().all(|zone| zone.tag() == b'd'));
    }
}
