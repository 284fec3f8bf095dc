//! Restoring delta zones from saved streams.
//!
//! A restore walks `Started -> HeaderRead -> TableRead -> Rebalanced ->
//! ListStream -> Complete`. Any failure moves it to `Aborted`, which empties
//! every target zone. The number of streams may differ from the number of
//! zones: lists are routed to zones by their global number.

use std::io::Read;

use chapterdex_error::{IndexError, Result};
use chapterdex_types::stream::read_block;
use tracing::{debug, warn};

use crate::bits::POST_FIELD_GUARD_BYTES;
use crate::index::ListRouting;
use crate::save::{DELTA_LIST_MAX_BYTE_COUNT, DeltaIndexHeader, ListSaveInfo};
use crate::zone::DeltaZone;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePhase {
    Started,
    HeaderRead,
    TableRead,
    Rebalanced,
    ListStream { stream: usize },
    Complete,
    Aborted,
}

/// Restore in progress over a set of borrowed zones.
pub struct DeltaIndexRestore<'a> {
    zones: Vec<&'a mut DeltaZone>,
    routing: ListRouting,
    tag: u8,
    headers: Vec<DeltaIndexHeader>,
    /// Nonempty lists still to be read, per stream.
    load_lists: Vec<u32>,
    phase: RestorePhase,
}

impl<'a> DeltaIndexRestore<'a> {
    pub fn new(zones: Vec<&'a mut DeltaZone>, routing: ListRouting, tag: u8) -> Result<Self> {
        if zones.len() != routing.zone_count as usize {
            return Err(IndexError::invalid_argument(format!(
                "{} zones supplied for a routing of {}",
                zones.len(),
                routing.zone_count
            )));
        }
        Ok(Self {
            zones,
            routing,
            tag,
            headers: Vec::new(),
            load_lists: Vec::new(),
            phase: RestorePhase::Started,
        })
    }

    pub fn phase(&self) -> RestorePhase {
        self.phase
    }

    fn expect_phase(&self, expected: RestorePhase) -> Result<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(IndexError::bad_state(format!(
                "delta index restore is in phase {:?}, expected {expected:?}",
                self.phase
            )))
        }
    }

    /// Empty every target zone and stop.
    pub fn abort(&mut self) {
        for zone in &mut self.zones {
            zone.empty();
        }
        if self.phase != RestorePhase::Aborted {
            warn!(
                tag = %char::from(self.tag),
                phase = ?self.phase,
                "aborted delta index restore"
            );
        }
        self.phase = RestorePhase::Aborted;
    }

    fn fail<T>(&mut self, err: IndexError) -> Result<T> {
        if err.is_corrupt() {
            warn!(tag = %char::from(self.tag), error = %err, "rejected saved delta index");
        }
        self.abort();
        Err(err)
    }

    /// Read every stream's header and size table, then lay out the zones
    /// to receive the list data.
    pub fn start<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        self.expect_phase(RestorePhase::Started)?;
        if let Err(err) = self.read_headers(readers) {
            return self.fail(err);
        }
        if let Err(err) = self.read_size_tables(readers) {
            return self.fail(err);
        }
        if let Err(err) = self.rebalance() {
            return self.fail(err);
        }
        Ok(())
    }

    fn read_headers<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        let stream_count = readers.len() as u32;
        let mut records = 0u64;
        let mut collisions = 0u64;
        let mut list_next = 0u32;
        let mut headers = Vec::with_capacity(readers.len());
        for (slot, reader) in readers.iter_mut().enumerate() {
            let header = DeltaIndexHeader::read_from(reader)?;
            if header.zone_count != stream_count {
                return Err(IndexError::corrupt(format!(
                    "delta index files contain mismatched zone counts ({stream_count},{})",
                    header.zone_count
                )));
            }
            if header.zone_number != slot as u32 {
                return Err(IndexError::corrupt(format!(
                    "delta index zone {} found in slot {slot}",
                    header.zone_number
                )));
            }
            if header.first_list != list_next {
                return Err(IndexError::corrupt(format!(
                    "delta index file for zone {slot} starts with list {} instead of list {list_next}",
                    header.first_list
                )));
            }
            list_next = list_next.checked_add(header.list_count).ok_or_else(|| {
                IndexError::corrupt("delta index files overflow the list numbering")
            })?;
            records = records.wrapping_add(header.record_count);
            collisions = collisions.wrapping_add(header.collision_count);
            headers.push(header);
        }
        if list_next != self.routing.list_count {
            return Err(IndexError::corrupt(format!(
                "delta index files contain {list_next} delta lists instead of {} delta lists",
                self.routing.list_count
            )));
        }
        if collisions > records {
            return Err(IndexError::corrupt(format!(
                "delta index files contain {collisions} collisions and {records} records"
            )));
        }

        for zone in &mut self.zones {
            zone.empty();
        }
        // Totals are not tracked per list, so zone 0 carries them all.
        self.zones[0].set_totals(records, collisions);
        self.headers = headers;
        self.phase = RestorePhase::HeaderRead;
        debug!(streams = readers.len(), records, collisions, "read delta index headers");
        Ok(())
    }

    fn read_size_tables<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        self.load_lists = vec![0; readers.len()];
        for (stream, reader) in readers.iter_mut().enumerate() {
            let header = self.headers[stream];
            for i in 0..header.list_count {
                let size = u16::from_le_bytes(read_block::<2, _>(reader)?);
                if size > 0 {
                    self.load_lists[stream] += 1;
                }
                let list_number = header.first_list + i;
                let zone = &mut self.zones[self.routing.zone_for_list(list_number) as usize];
                let local = zone.local_list(list_number)?;
                zone.lists[local as usize + 1].size = size;
            }
        }
        self.phase = RestorePhase::TableRead;
        Ok(())
    }

    fn rebalance(&mut self) -> Result<()> {
        for zone in &mut self.zones {
            zone.rebalance_lists()?;
        }
        self.phase = RestorePhase::Rebalanced;
        debug!(
            tag = %char::from(self.tag),
            lists = self.load_lists.iter().sum::<u32>(),
            "prepared delta zones for list data"
        );
        Ok(())
    }

    /// Read the list data of every stream.
    pub fn finish<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        self.expect_phase(RestorePhase::Rebalanced)?;
        if readers.len() != self.load_lists.len() {
            let err = IndexError::invalid_argument(format!(
                "{} streams supplied to finish a restore of {}",
                readers.len(),
                self.load_lists.len()
            ));
            return self.fail(err);
        }
        let mut data = vec![0u8; DELTA_LIST_MAX_BYTE_COUNT + POST_FIELD_GUARD_BYTES];
        for (stream, reader) in readers.iter_mut().enumerate() {
            self.phase = RestorePhase::ListStream { stream };
            while self.load_lists[stream] > 0 {
                if let Err(err) = self.restore_list(stream, reader, &mut data) {
                    return self.fail(err);
                }
            }
        }
        self.phase = RestorePhase::Complete;
        Ok(())
    }

    fn restore_list<R: Read>(&mut self, stream: usize, reader: &mut R, data: &mut [u8]) -> Result<()> {
        let info = ListSaveInfo::read_from(reader)?;
        if info.bit_offset >= 8 || usize::from(info.byte_count) > DELTA_LIST_MAX_BYTE_COUNT {
            return Err(IndexError::corrupt("corrupt delta list data"));
        }
        if info.tag != self.tag {
            return Err(IndexError::corrupt(format!(
                "delta list tagged {:#04x} does not belong to index '{}'",
                info.tag,
                char::from(self.tag)
            )));
        }
        if info.index >= self.routing.list_count {
            return Err(IndexError::corrupt(format!(
                "invalid delta list number {} of {}",
                info.index, self.routing.list_count
            )));
        }
        let byte_count = usize::from(info.byte_count);
        reader.read_exact(&mut data[..byte_count])?;
        self.load_lists[stream] -= 1;
        let zone = self.routing.zone_for_list(info.index) as usize;
        self.zones[zone].restore_list_data(&info, data)
    }
}
