//! Saved stream format of a volume index, one stream per zone.
//!
//! ```text
//! [volume]   "MI6-0001" sample_rate:u32                      (sparse only)
//! dense      "MI5-0005" nonce:u64 low:u64 high:u64 first_list:u32
//!            list_count:u32, list_count x flush chapter:u64,
//!            delta index header and size table
//! [sample]   same layout as dense                            (sparse only)
//! lists      dense delta lists, then sample delta lists
//! guard      delta index guard record
//! ```
//!
//! A restore may read streams written with a different zone count. All
//! streams must agree on the newest chapter; the oldest chapter is the
//! largest one any stream recorded.

use std::io::{Read, Write};

use chapterdex_delta::{DeltaIndexRestore, DeltaZone, check_guard_lists, write_guard_list};
use chapterdex_error::{IndexError, Result};
use chapterdex_types::stream::{
    append_u32_le, append_u64_le, read_array, read_block, read_u32_le, read_u64_le,
    read_u64_les, write_u64_les,
};
use tracing::{debug, info, warn};

use crate::sub_index::{SubIndexLayout, SubIndexZone, VolumeSubIndex};
use crate::telemetry::VolumeIndexEvent;
use crate::volume_index::VolumeIndex;

pub const SUB_INDEX_MAGIC: &[u8; 8] = b"MI5-0005";
pub const SUB_INDEX_HEADER_SIZE: usize = 40;
pub const VOLUME_INDEX_MAGIC: &[u8; 8] = b"MI6-0001";
pub const VOLUME_INDEX_HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubIndexHeader {
    pub nonce: u64,
    pub virtual_chapter_low: u64,
    pub virtual_chapter_high: u64,
    pub first_list: u32,
    pub list_count: u32,
}

impl SubIndexHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SUB_INDEX_HEADER_SIZE);
        buf.extend_from_slice(SUB_INDEX_MAGIC);
        append_u64_le(&mut buf, self.nonce);
        append_u64_le(&mut buf, self.virtual_chapter_low);
        append_u64_le(&mut buf, self.virtual_chapter_high);
        append_u32_le(&mut buf, self.first_list);
        append_u32_le(&mut buf, self.list_count);
        buf
    }

    pub(crate) fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let raw = read_block::<SUB_INDEX_HEADER_SIZE, _>(reader)?;
        let mut cursor = 0;
        let magic = read_array::<8>(&raw, &mut cursor, "magic")?;
        if &magic != SUB_INDEX_MAGIC {
            return Err(IndexError::corrupt("volume index file had bad magic number"));
        }
        Ok(Self {
            nonce: read_u64_le(&raw, &mut cursor, "nonce")?,
            virtual_chapter_low: read_u64_le(&raw, &mut cursor, "virtual_chapter_low")?,
            virtual_chapter_high: read_u64_le(&raw, &mut cursor, "virtual_chapter_high")?,
            first_list: read_u32_le(&raw, &mut cursor, "first_list")?,
            list_count: read_u32_le(&raw, &mut cursor, "list_count")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VolumeIndexHeader {
    pub sample_rate: u32,
}

impl VolumeIndexHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VOLUME_INDEX_HEADER_SIZE);
        buf.extend_from_slice(VOLUME_INDEX_MAGIC);
        append_u32_le(&mut buf, self.sample_rate);
        buf
    }

    pub(crate) fn read_from<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let raw = read_block::<VOLUME_INDEX_HEADER_SIZE, _>(reader)?;
        let mut cursor = 0;
        let magic = read_array::<8>(&raw, &mut cursor, "magic")?;
        if &magic != VOLUME_INDEX_MAGIC {
            return Err(IndexError::corrupt("volume index file had bad magic number"));
        }
        Ok(Self {
            sample_rate: read_u32_le(&raw, &mut cursor, "sample_rate")?,
        })
    }
}

impl SubIndexZone {
    /// Write the chapter header, flush chapters and delta index header of
    /// this zone.
    fn write_header<W: Write + ?Sized>(
        &self,
        nonce: u64,
        zone_count: u32,
        writer: &mut W,
    ) -> Result<()> {
        let header = SubIndexHeader {
            nonce,
            virtual_chapter_low: self.virtual_chapter_low,
            virtual_chapter_high: self.virtual_chapter_high,
            first_list: self.delta.first_list(),
            list_count: self.delta.list_count(),
        };
        writer.write_all(&header.encode()).map_err(|err| {
            warn!(zone = self.delta.zone_number(), error = %err, "failed to write volume index header");
            IndexError::from(err)
        })?;
        write_u64_les(writer, &self.flush_chapters)?;
        self.delta.write_header(zone_count, writer)
    }
}

/// Chapter state gathered from the sub-index headers of every stream.
#[derive(Debug)]
struct SavedChapters {
    virtual_chapter_low: u64,
    virtual_chapter_high: u64,
    /// Indexed by global list number.
    flush_chapters: Vec<u64>,
}

impl SavedChapters {
    fn read<R: Read>(layout: &SubIndexLayout, nonce: &mut u64, readers: &mut [R]) -> Result<Self> {
        let list_count = layout.routing.list_count;
        let mut flush_chapters = vec![0u64; list_count as usize];
        let mut window: Option<(u64, u64)> = None;
        for (stream, reader) in readers.iter_mut().enumerate() {
            let header = SubIndexHeader::read_from(reader)?;
            if *nonce == 0 {
                *nonce = header.nonce;
            } else if header.nonce != *nonce {
                return Err(IndexError::corrupt("volume index volume nonce incorrect"));
            }

            window = Some(match window {
                None => (header.virtual_chapter_low, header.virtual_chapter_high),
                Some((low, high)) if high != header.virtual_chapter_high => {
                    return Err(IndexError::corrupt(format!(
                        "inconsistent volume index zone files: chapter range is [{low},{high}], \
                         chapter range {stream} is [{},{}]",
                        header.virtual_chapter_low, header.virtual_chapter_high
                    )));
                }
                Some((low, high)) => (low.max(header.virtual_chapter_low), high),
            });

            let first = header.first_list as usize;
            let end = header
                .first_list
                .checked_add(header.list_count)
                .filter(|&end| end <= list_count)
                .ok_or_else(|| {
                    IndexError::corrupt(format!(
                        "volume index stream {stream} covers lists {} to {} of {list_count}",
                        header.first_list,
                        u64::from(header.first_list) + u64::from(header.list_count)
                    ))
                })? as usize;
            let chapters = read_u64_les(reader, end - first)?;
            flush_chapters[first..end].copy_from_slice(&chapters);
        }
        let (virtual_chapter_low, virtual_chapter_high) = window
            .ok_or_else(|| IndexError::invalid_argument("no streams to restore from"))?;
        debug!(
            sub_index = layout.kind.as_str(),
            low = virtual_chapter_low,
            high = virtual_chapter_high,
            "read volume sub-index headers"
        );
        Ok(Self {
            virtual_chapter_low,
            virtual_chapter_high,
            flush_chapters,
        })
    }

    fn apply(&self, sub_index: &mut VolumeSubIndex) {
        for zone in sub_index.zones_mut() {
            let first = zone.delta.first_list() as usize;
            let count = zone.flush_chapters.len();
            zone.flush_chapters
                .copy_from_slice(&self.flush_chapters[first..first + count]);
            zone.virtual_chapter_low = self.virtual_chapter_low;
            zone.virtual_chapter_high = self.virtual_chapter_high;
        }
    }
}

fn delta_zones(sub_index: &mut VolumeSubIndex) -> Vec<&mut DeltaZone> {
    sub_index
        .zones
        .iter_mut()
        .map(|zone| &mut zone.get_mut().delta)
        .collect()
}

fn read_sample_rate<R: Read>(readers: &mut [R], sample_rate: u32) -> Result<()> {
    for reader in readers.iter_mut() {
        let header = VolumeIndexHeader::read_from(reader)?;
        if header.sample_rate != sample_rate {
            return Err(IndexError::corrupt(format!(
                "volume index saved with sample rate {} cannot be restored with sample rate {sample_rate}",
                header.sample_rate
            )));
        }
    }
    Ok(())
}

impl VolumeIndex {
    /// Write zone `zone` as one complete stream.
    pub fn save_zone<W: Write + ?Sized>(&self, zone: u32, writer: &mut W) -> Result<()> {
        if zone >= self.zone_count() {
            return Err(IndexError::invalid_argument(format!(
                "zone {zone} out of range for {} zones",
                self.zone_count()
            )));
        }
        let zone_count = self.zone_count();
        let dense = self.dense.zones[zone as usize].lock();
        let sample = self
            .sample
            .as_ref()
            .map(|sub| (sub.nonce, sub.zones[zone as usize].lock()));

        if sample.is_some() {
            let header = VolumeIndexHeader {
                sample_rate: self.sample_rate,
            };
            writer.write_all(&header.encode())?;
        }
        dense.write_header(self.dense.nonce, zone_count, writer)?;
        if let Some((nonce, sample)) = &sample {
            sample.write_header(*nonce, zone_count, writer)?;
        }
        dense.delta.write_lists(writer)?;
        if let Some((_, sample)) = &sample {
            sample.delta.write_lists(writer)?;
        }
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
        let (dense, sample) = self.stats();
        info!(
            zones = self.zone_count(),
            dense_records = dense.record_count,
            sample_records = sample.record_count,
            "saved volume index"
        );
        Ok(())
    }

    /// Restore from streams written by `save`, possibly by an index with a
    /// different zone count. On failure the index is left empty and keeps
    /// the nonce it had before the call.
    pub fn load<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        if readers.is_empty() {
            return Err(IndexError::invalid_argument("no streams to restore from"));
        }
        // A zero nonce is replaced by the saved one while reading headers.
        let nonces = (self.dense.nonce, self.sample.as_ref().map(|sub| sub.nonce));
        if let Err(err) = self.restore(readers) {
            self.empty();
            self.dense.nonce = nonces.0;
            if let (Some(sub), Some(nonce)) = (self.sample.as_mut(), nonces.1) {
                sub.nonce = nonce;
            }
            warn!(streams = readers.len(), error = %err, "failed to restore volume index");
            self.sink
                .emit(&VolumeIndexEvent::RestoreAborted { error: err.kind() });
            return Err(err);
        }
        let (dense, sample) = self.stats();
        info!(
            streams = readers.len(),
            zones = self.zone_count(),
            dense_records = dense.record_count,
            sample_records = sample.record_count,
            window = ?self.window(0),
            "restored volume index"
        );
        Ok(())
    }

    fn restore<R: Read>(&mut self, readers: &mut [R]) -> Result<()> {
        let Self {
            sample_rate,
            dense,
            sample,
            ..
        } = self;
        if sample.is_some() {
            read_sample_rate(readers, *sample_rate)?;
        }

        let dense_layout = dense.layout;
        let dense_chapters = SavedChapters::read(&dense_layout, &mut dense.nonce, readers)?;
        let mut dense_restore =
            DeltaIndexRestore::new(delta_zones(dense), dense_layout.routing, dense_layout.tag)?;
        dense_restore.start(readers)?;

        let mut sample_restore = match sample.as_mut() {
            Some(sub) => {
                let layout = sub.layout;
                let chapters = SavedChapters::read(&layout, &mut sub.nonce, readers)?;
                let mut restore =
                    DeltaIndexRestore::new(delta_zones(sub), layout.routing, layout.tag)?;
                restore.start(readers)?;
                Some((chapters, restore))
            }
            None => None,
        };

        dense_restore.finish(readers)?;
        if let Some((_, restore)) = &mut sample_restore {
            restore.finish(readers)?;
        }
        check_guard_lists(readers)?;
        drop(dense_restore);
        let sample_chapters = sample_restore.map(|(chapters, _)| chapters);

        dense_chapters.apply(dense);
        if let (Some(sub), Some(chapters)) = (sample.as_mut(), sample_chapters) {
            chapters.apply(sub);
        }
        Ok(())
    }
}
