//! Immutable delta index pages.
//!
//! A page packs a run of lists from a mutable index into a fixed-size
//! buffer:
//!
//! ```text
//! nonce:u64 virtual_chapter:u64 first_list:u16 list_count:u16   (20 bytes)
//! list_count + 1 list start offsets, 19 bits each
//! list bit streams, back to back
//! ...
//! 7 guard bytes of 0xFF at the very end of the page
//! ```
//!
//! An opened page is searchable but rejects every mutation.

use chapterdex_error::{IndexError, Result};
use chapterdex_types::RecordName;
use chapterdex_types::stream::{read_u16_le, read_u64_le};
use tracing::debug;

use crate::bits::{self, GUARD_BITS, POST_FIELD_GUARD_BYTES};
use crate::coding::{DeltaCoding, delta_memory_size};
use crate::entry::DeltaIndexEntry;
use crate::index::DeltaIndex;
use crate::zone::{DeltaList, DeltaZone};

pub const PAGE_HEADER_SIZE: usize = 20;

/// Bits per list start offset.
pub const IMMUTABLE_HEADER_SIZE: u32 = 19;

/// Tag of the index wrapped around an opened page.
pub const PAGE_TAG: u8 = b'p';

/// Largest page whose bit offsets fit the 19-bit start fields.
pub const MAX_PAGE_SIZE: usize = 1 << (IMMUTABLE_HEADER_SIZE - 3);

#[inline]
const fn immutable_header_offset(list: u32) -> u64 {
    (PAGE_HEADER_SIZE * 8) as u64 + list as u64 * IMMUTABLE_HEADER_SIZE as u64
}

fn immutable_start(page: &[u8], list: u32) -> u64 {
    u64::from(bits::read_field(
        page,
        immutable_header_offset(list),
        IMMUTABLE_HEADER_SIZE,
    ))
}

fn set_immutable_start(page: &mut [u8], list: u32, start: u64) {
    bits::write_field(
        page,
        immutable_header_offset(list),
        IMMUTABLE_HEADER_SIZE,
        start as u32,
    );
}

/// Pack as many lists as fit, starting at `first_list`, into `page`.
/// Returns the number of lists packed.
pub fn pack_page(
    index: &DeltaIndex,
    nonce: u64,
    page: &mut [u8],
    virtual_chapter: u64,
    first_list: u32,
) -> Result<u32> {
    if page.len() > MAX_PAGE_SIZE {
        return Err(IndexError::invalid_argument(format!(
            "page of {} bytes exceeds {MAX_PAGE_SIZE}",
            page.len()
        )));
    }
    let first_list_field = u16::try_from(first_list).map_err(|_| {
        IndexError::invalid_argument(format!("list {first_list} cannot start a page"))
    })?;
    if first_list >= index.list_count() {
        return Err(IndexError::invalid_argument(format!(
            "list {first_list} is out of range ({})",
            index.list_count()
        )));
    }

    let reserved = immutable_header_offset(1) + (POST_FIELD_GUARD_BYTES * 8) as u64;
    let mut free_bits = (page.len() * 8) as u64;
    if free_bits < reserved + u64::from(IMMUTABLE_HEADER_SIZE) {
        return Err(IndexError::overflow(format!(
            "chapter index page of {} bytes is too small",
            page.len()
        )));
    }
    free_bits -= reserved;

    let max_lists = (index.list_count() - first_list).min(u32::from(u16::MAX));
    let list_at = |i: u32| {
        let list_number = first_list + i;
        let zone = index.zone(index.zone_for_list(list_number));
        let local = list_number - zone.first_list();
        (zone, zone.list(local))
    };

    let mut list_count = 0u32;
    while list_count < max_lists {
        let bits_needed =
            u64::from(IMMUTABLE_HEADER_SIZE) + u64::from(list_at(list_count).1.size());
        if bits_needed > free_bits {
            break;
        }
        list_count += 1;
        free_bits -= bits_needed;
    }

    page[..8].copy_from_slice(&nonce.to_le_bytes());
    page[8..16].copy_from_slice(&virtual_chapter.to_le_bytes());
    page[16..18].copy_from_slice(&first_list_field.to_le_bytes());
    page[18..20].copy_from_slice(&(list_count as u16).to_le_bytes());

    let mut offset = immutable_header_offset(list_count + 1);
    set_immutable_start(page, 0, offset);
    for i in 0..list_count {
        offset += u64::from(list_at(i).1.size());
        set_immutable_start(page, i + 1, offset);
    }

    for i in 0..list_count {
        let (zone, list) = list_at(i);
        let destination = immutable_start(page, i);
        bits::move_bits(
            &zone.memory,
            list.start(),
            page,
            destination,
            u64::from(list.size()),
        );
    }

    let guard = page.len() - POST_FIELD_GUARD_BYTES;
    page[guard..].fill(0xFF);
    debug!(
        first_list,
        list_count,
        virtual_chapter,
        page_bytes = page.len(),
        "packed delta index page"
    );
    Ok(list_count)
}

/// Pages needed to hold `entries` entries spread over `list_count` lists.
pub fn page_count(
    entries: u64,
    list_count: u32,
    mean_delta: u32,
    payload_bits: u32,
    bytes_per_page: usize,
) -> Result<u64> {
    let mut bits_per_index = delta_memory_size(entries, mean_delta, payload_bits)?;
    let bits_per_list = bits_per_index / u64::from(list_count.max(1));
    bits_per_index += u64::from(list_count) * u64::from(IMMUTABLE_HEADER_SIZE);
    let bits_per_page = (bytes_per_page.saturating_sub(PAGE_HEADER_SIZE) * 8) as u64;
    // One header and one list of internal fragmentation per page.
    let usable = bits_per_page
        .checked_sub(u64::from(IMMUTABLE_HEADER_SIZE) + bits_per_list)
        .filter(|usable| *usable > 0)
        .ok_or_else(|| {
            IndexError::invalid_argument(format!(
                "pages of {bytes_per_page} bytes cannot hold a delta list"
            ))
        })?;
    Ok(bits_per_index.div_ceil(usable))
}

/// A read-only delta index over one packed page.
#[derive(Debug)]
pub struct DeltaIndexPage {
    index: DeltaIndex,
    virtual_chapter: u64,
    lowest_list: u32,
    highest_list: u32,
}

impl DeltaIndexPage {
    /// Validate and open a page written by `pack_page`.
    pub fn open(page: Vec<u8>, expected_nonce: u64, mean_delta: u32, value_bits: u32) -> Result<Self> {
        let coding = DeltaCoding::new(mean_delta)?;
        let size = page.len();
        if size > MAX_PAGE_SIZE || size < PAGE_HEADER_SIZE + POST_FIELD_GUARD_BYTES + 8 {
            return Err(IndexError::corrupt(format!("page of {size} bytes has an impossible size")));
        }
        let mut cursor = 0;
        let nonce = read_u64_le(&page, &mut cursor, "nonce")?;
        let virtual_chapter = read_u64_le(&page, &mut cursor, "virtual_chapter")?;
        let first_list = read_u16_le(&page, &mut cursor, "first_list")?;
        let list_count = read_u16_le(&page, &mut cursor, "list_count")?;

        // A nonce mismatch is expected for pages that predate the volume.
        if nonce != expected_nonce {
            return Err(IndexError::corrupt(format!(
                "page nonce {nonce:#x} does not match {expected_nonce:#x}"
            )));
        }
        let list_count = u32::from(list_count);
        let guard_start = ((size - POST_FIELD_GUARD_BYTES) * 8) as u64;
        if immutable_header_offset(list_count + 1) > guard_start {
            return Err(IndexError::corrupt(format!(
                "{list_count} delta lists cannot fit a page of {size} bytes"
            )));
        }
        if immutable_start(&page, 0) != immutable_header_offset(list_count + 1) {
            return Err(IndexError::corrupt("first delta list does not follow the offset table"));
        }
        let mut lists = Vec::with_capacity(list_count as usize + 2);
        lists.push(DeltaList::default());
        for i in 0..list_count {
            let start = immutable_start(&page, i);
            let end = immutable_start(&page, i + 1);
            let list_size = end
                .checked_sub(start)
                .and_then(|bits| u16::try_from(bits).ok())
                .ok_or_else(|| {
                    IndexError::corrupt(format!("delta list {i} on the page is out of order"))
                })?;
            lists.push(DeltaList {
                start,
                size: list_size,
                ..DeltaList::default()
            });
        }
        if immutable_start(&page, list_count) > guard_start {
            return Err(IndexError::corrupt("last delta list runs into the page guard"));
        }
        if page[size - POST_FIELD_GUARD_BYTES..].iter().any(|&byte| byte != 0xFF) {
            return Err(IndexError::corrupt("page guard bytes are not all ones"));
        }
        lists.push(DeltaList {
            start: guard_start,
            size: GUARD_BITS as u16,
            ..DeltaList::default()
        });

        let zone = DeltaZone::immutable(page, lists, coding, value_bits, 0, PAGE_TAG);
        let lowest_list = u32::from(first_list);
        Ok(Self {
            index: DeltaIndex::from_immutable_zone(zone),
            virtual_chapter,
            lowest_list,
            highest_list: (lowest_list + list_count).saturating_sub(1),
        })
    }

    pub fn virtual_chapter(&self) -> u64 {
        self.virtual_chapter
    }

    pub fn lowest_list(&self) -> u32 {
        self.lowest_list
    }

    pub fn highest_list(&self) -> u32 {
        self.highest_list
    }

    pub fn list_count(&self) -> u32 {
        self.index.list_count()
    }

    pub fn index(&self) -> &DeltaIndex {
        &self.index
    }

    pub fn index_mut(&mut self) -> &mut DeltaIndex {
        &mut self.index
    }

    /// Look up `key` in list `list_number` (numbered as in the source index).
    pub fn get_entry(&mut self, list_number: u32, key: u32, name: &RecordName) -> Result<DeltaIndexEntry> {
        let local = list_number
            .checked_sub(self.lowest_list)
            .filter(|local| *local < self.index.list_count())
            .ok_or_else(|| {
                IndexError::invalid_argument(format!(
                    "list {list_number} is not on the page ({}..={})",
                    self.lowest_list, self.highest_list
                ))
            })?;
        self.index.get_entry(local, key, name)
    }

    pub fn entry_value(&self, entry: &DeltaIndexEntry) -> u32 {
        self.index.entry_value(entry)
    }
}
