//! Saved stream format of a delta index zone.
//!
//! ```text
//! header     "DI-00002" zone:u32 zone_count:u32 first_list:u32 list_count:u32
//!            records:u64 collisions:u64                         (40 bytes)
//! sizes      list_count x u16 bit size
//! lists      per nonempty list: tag:u8 bit_offset:u8 byte_count:u16 index:u32
//!            followed by byte_count bytes of list data
//! guard      tag 'z', remaining save-info fields zero
//! ```
//!
//! All integers are little-endian. The header and sizes of every zone are
//! written before any list data so a caller can interleave other headers.

use std::io::{Read, Write};

use chapterdex_error::{IndexError, Result};
use chapterdex_types::stream::{
    append_u16_le, append_u32_le, append_u64_le, read_array, read_block, read_u16_le,
    read_u32_le, read_u64_le,
};
use tracing::{info, warn};

use crate::bits::POST_FIELD_GUARD_BYTES;
use crate::index::{DeltaIndex, zone_memory_size};
use crate::restore::DeltaIndexRestore;
use crate::zone::{DELTA_LIST_MAX_BITS, DeltaZone};

pub const DELTA_INDEX_MAGIC: &[u8; 8] = b"DI-00002";
pub const DELTA_INDEX_HEADER_SIZE: usize = 40;
pub const LIST_SAVE_INFO_SIZE: usize = 8;
/// Tag of the record that terminates each saved zone.
pub const GUARD_TAG: u8 = b'z';

/// Most bytes one saved list can occupy: the largest list at the worst
/// starting bit offset, plus room for the bit codec's word loads.
pub const DELTA_LIST_MAX_BYTE_COUNT: usize =
    (DELTA_LIST_MAX_BITS as usize + 8) / 8 + POST_FIELD_GUARD_BYTES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeltaIndexHeader {
    pub zone_number: u32,
    pub zone_count: u32,
    pub first_list: u32,
    pub list_count: u32,
    pub record_count: u64,
    pub collision_count: u64,
}

impl DeltaIndexHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(DELTA_INDEX_HEADER_SIZE);
        buf.extend_from_slice(DELTA_INDEX_MAGIC);
        append_u32_le(&mut buf, self.zone_number);
        append_u32_le(&mut buf, self.zone_count);
        append_u32_le(&mut buf, self.first_list);
        append_u32_le(&mut buf, self.list_count);
        append_u64_le(&mut buf, self.record_count);
        append_u64_le(&mut buf, self.collision_count);
        buf
    }

    pub(crate) fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let raw = read_block::<DELTA_INDEX_HEADER_SIZE, _>(reader)?;
        let mut cursor = 0;
        let magic = read_array::<8>(&raw, &mut cursor, "magic")?;
        if &magic != DELTA_INDEX_MAGIC {
            return Err(IndexError::corrupt("delta index file has bad magic number"));
        }
        Ok(Self {
            zone_number: read_u32_le(&raw, &mut cursor, "zone_number")?,
            zone_count: read_u32_le(&raw, &mut cursor, "zone_count")?,
            first_list: read_u32_le(&raw, &mut cursor, "first_list")?,
            list_count: read_u32_le(&raw, &mut cursor, "list_count")?,
            record_count: read_u64_le(&raw, &mut cursor, "record_count")?,
            collision_count: read_u64_le(&raw, &mut cursor, "collision_count")?,
        })
    }
}

/// Prefix of each saved list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListSaveInfo {
    pub tag: u8,
    pub bit_offset: u8,
    pub byte_count: u16,
    pub index: u32,
}

impl ListSaveInfo {
    fn encode(&self) -> [u8; LIST_SAVE_INFO_SIZE] {
        let mut buf = Vec::with_capacity(LIST_SAVE_INFO_SIZE);
        buf.push(self.tag);
        buf.push(self.bit_offset);
        append_u16_le(&mut buf, self.byte_count);
        append_u32_le(&mut buf, self.index);
        let mut out = [0u8; LIST_SAVE_INFO_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub(crate) fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let raw = read_block::<LIST_SAVE_INFO_SIZE, _>(reader)?;
        let mut cursor = 2;
        Ok(Self {
            tag: raw[0],
            bit_offset: raw[1],
            byte_count: read_u16_le(&raw, &mut cursor, "byte_count")?,
            index: read_u32_le(&raw, &mut cursor, "index")?,
        })
    }
}

impl DeltaZone {
    /// Write the zone header and its list size table.
    pub fn write_header<W: Write + ?Sized>(&self, zone_count: u32, writer: &mut W) -> Result<()> {
        let header = DeltaIndexHeader {
            zone_number: self.zone_number,
            zone_count,
            first_list: self.first_list,
            list_count: self.list_count,
            record_count: self.counters.record_count,
            collision_count: self.counters.collision_count,
        };
        let mut buf = header.encode();
        buf.reserve(self.list_count as usize * 2);
        for list in &self.lists[1..=self.list_count as usize] {
            append_u16_le(&mut buf, list.size);
        }
        writer.write_all(&buf).map_err(|err| {
            warn!(zone = self.zone_number, error = %err, "failed to write delta index header");
            IndexError::from(err)
        })
    }

    /// Write the data of every nonempty list.
    pub fn write_lists<W: Write + ?Sized>(&self, writer: &mut W) -> Result<()> {
        for (local, list) in self.lists[1..=self.list_count as usize].iter().enumerate() {
            if list.size == 0 {
                continue;
            }
            let info = ListSaveInfo {
                tag: self.tag,
                bit_offset: (list.start % 8) as u8,
                byte_count: list.byte_size() as u16,
                index: self.first_list + local as u32,
            };
            let start = list.byte_start();
            let result = writer
                .write_all(&info.encode())
                .and_then(|()| writer.write_all(&self.memory[start..start + list.byte_size()]));
            if let Err(err) = result {
                warn!(
                    zone = self.zone_number,
                    list = info.index,
                    error = %err,
                    "failed to write delta list"
                );
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Copy saved list data into the slot the size table reserved for it.
    pub(crate) fn restore_list_data(&mut self, info: &ListSaveInfo, data: &[u8]) -> Result<()> {
        let local = info
            .index
            .checked_sub(self.first_list)
            .filter(|local| *local < self.list_count)
            .ok_or_else(|| {
                IndexError::corrupt(format!(
                    "invalid delta list number {} not in range [{},{})",
                    info.index,
                    self.first_list,
                    self.first_list + self.list_count
                ))
            })?;
        let list = self.list(local);
        if list.size == 0 {
            return Err(IndexError::corrupt(format!(
                "unexpected delta list number {}",
                info.index
            )));
        }
        let byte_count = (u32::from(info.bit_offset) + u32::from(list.size)).div_ceil(8);
        if u32::from(info.byte_count) != byte_count {
            return Err(IndexError::corrupt(format!(
                "unexpected delta list size {} != {byte_count}",
                info.byte_count
            )));
        }
        crate::bits::move_bits(
            data,
            u64::from(info.bit_offset),
            &mut self.memory,
            list.start,
            u64::from(list.size),
        );
        Ok(())
    }
}

/// Write the record that ends a saved zone.
pub fn write_guard_list<W: Write + ?Sized>(writer: &mut W) -> Result<()> {
    let guard = ListSaveInfo {
        tag: GUARD_TAG,
        bit_offset: 0,
        byte_count: 0,
        index: 0,
    };
    writer.write_all(&guard.encode()).map_err(|err| {
        warn!(error = %err, "failed to write guard delta list");
        IndexError::from(err)
    })
}

/// Consume and verify the guard record of every stream.
pub fn check_guard_lists<R: Read>(readers: &mut [R]) -> Result<()> {
    for (stream, reader) in readers.iter_mut().enumerate() {
        let info = ListSaveInfo::read_from(reader)?;
        if info.tag != GUARD_TAG {
            warn!(stream, tag = info.tag, "delta index stream is missing its guard list");
            return Err(IndexError::corrupt(format!(
                "stream {stream} ends with tag {:#04x} instead of the guard list",
                info.tag
            )));
        }
    }
    Ok(())
}

/// Upper bound on the bytes one zone's save can produce.
pub fn compute_save_bytes(list_count: u32, memory_size: usize) -> usize {
    DELTA_INDEX_HEADER_SIZE
        + list_count as usize * (LIST_SAVE_INFO_SIZE + 1)
        + zone_memory_size(1, memory_size)
}

impl DeltaIndex {
    /// Save zone `zone` as a complete stream: header, sizes, lists, guard.
    pub fn save_zone<W: Write + ?Sized>(&self, zone: u32, writer: &mut W) -> Result<()> {
        let delta_zone = self.zone(zone);
        delta_zone.write_header(self.zone_count(), writer)?;
        delta_zone.write_lists(writer)?;
        write_guard_list(writer)?;
        writer.flush()?;
        Ok(())
    }

    /// Save every zone to its own writer.
    pub fn save<W: Write>(&self, writers: &mut [W]) -> Result<()> {
        if writers.len() != self.zone_count() as usize {
            return Err(IndexError::invalid_argument(format!(
                "{} writers for {} zones",
                writers.len(),
                self.zone_count()
            )));
        }
        for (zone, writer) in writers.iter_mut().enumerate() {
            self.save_zone(zone as u32, writer)?;
        }
        info!(
            tag = %char::from(self.tag()),
            zones = self.zone_count(),
            records = self.stats().record_count,
            "saved delta index"
        );
        Ok(())
    }

    /// Restore from streams written by `save`, possibly by an index with a
    /// different zone count. On failure the index is left empty.
    pub fn load<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        if !self.is_mutable() {
            return Err(IndexError::bad_state("cannot restore an immutable delta index"));
        }
        let routing = self.routing();
        let tag = self.tag();
        let zones: Vec<&mut DeltaZone> = self.zones_mut().iter_mut().collect();
        let mut restore = DeltaIndexRestore::new(zones, routing, tag)?;
        restore.start(readers)?;
        restore.finish(readers)?;
        if let Err(err) = check_guard_lists(readers) {
            restore.abort();
            return Err(err);
        }
        drop(restore);
        info!(
            tag = %char::from(tag),
            streams = readers.len(),
            zones = self.zone_count(),
            records = self.stats().record_count,
            "restored delta index"
        );
        Ok(())
    }
}
