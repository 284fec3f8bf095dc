//! One delta zone: a contiguous bit buffer holding a run of delta lists.
//!
//! List slots `1..=list_count` hold real lists. Slot 0 is an empty guard at
//! bit 0 and slot `list_count + 1` is a guard of [`GUARD_BITS`] all-one bits
//! at the end of the buffer. Lists never overlap and stay ordered by start.

use std::time::{Duration, Instant};

use chapterdex_error::{IndexError, Result};
use tracing::{debug, warn};

use crate::bits::{self, GUARD_BITS, POST_FIELD_GUARD_BYTES};
use crate::coding::DeltaCoding;
use crate::entry::DeltaIndexEntry;

/// Largest size a single delta list may reach, in bits.
pub const DELTA_LIST_MAX_BITS: u32 = u16::MAX as u32;

/// Tag of a general-purpose mutable delta index.
pub const DEFAULT_TAG: u8 = b'm';

/// Location and search cache of one delta list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaList {
    pub(crate) start: u64,
    pub(crate) size: u16,
    pub(crate) save_offset: u16,
    pub(crate) save_key: u32,
}

impl DeltaList {
    #[inline]
    pub const fn start(&self) -> u64 {
        self.start
    }

    #[inline]
    pub const fn size(&self) -> u16 {
        self.size
    }

    #[inline]
    pub const fn end(&self) -> u64 {
        self.start + self.size as u64
    }

    /// Bytes spanned by the list, counting partial bytes at both ends.
    #[inline]
    pub const fn byte_size(&self) -> usize {
        ((self.start % 8 + self.size as u64).div_ceil(8)) as usize
    }

    #[inline]
    pub const fn byte_start(&self) -> usize {
        (self.start / 8) as usize
    }
}

/// Counters kept per zone.
///
/// A restore credits every record to the first zone, so the record and
/// collision counts of other zones can drop below zero. They wrap, and only
/// their sum across zones is meaningful.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ZoneCounters {
    pub record_count: u64,
    pub collision_count: u64,
    pub discard_count: u64,
    pub overflow_count: u64,
    pub rebalance_count: u64,
    pub rebalance_time: Duration,
}

#[derive(Debug)]
pub struct DeltaZone {
    pub(crate) memory: Vec<u8>,
    pub(crate) lists: Vec<DeltaList>,
    new_offsets: Vec<u64>,
    pub(crate) coding: DeltaCoding,
    pub(crate) value_bits: u32,
    pub(crate) zone_number: u32,
    pub(crate) first_list: u32,
    pub(crate) list_count: u32,
    pub(crate) mutable: bool,
    pub(crate) tag: u8,
    pub(crate) counters: ZoneCounters,
}

impl DeltaZone {
    /// Allocate an empty mutable zone of `size` bytes.
    pub fn new(
        zone_number: u32,
        size: usize,
        first_list: u32,
        list_count: u32,
        mean_delta: u32,
        value_bits: u32,
    ) -> Result<Self> {
        if list_count == 0 {
            return Err(IndexError::invalid_argument(format!(
                "delta zone {zone_number} has no lists"
            )));
        }
        if value_bits > 32 {
            return Err(IndexError::invalid_argument(format!(
                "payload of {value_bits} bits exceeds 32"
            )));
        }
        let coding = DeltaCoding::new(mean_delta)?;
        // Each list needs room for its partial trailing byte plus the guard.
        let minimum = list_count as usize + 2 * POST_FIELD_GUARD_BYTES + 1;
        if size < minimum {
            return Err(IndexError::invalid_argument(format!(
                "delta zone {zone_number} of {size} bytes cannot hold {list_count} lists"
            )));
        }
        let slots = list_count as usize + 2;
        let mut zone = Self {
            memory: vec![0u8; size],
            lists: vec![DeltaList::default(); slots],
            new_offsets: vec![0; slots],
            coding,
            value_bits,
            zone_number,
            first_list,
            list_count,
            mutable: true,
            tag: DEFAULT_TAG,
            counters: ZoneCounters::default(),
        };
        zone.empty();
        Ok(zone)
    }

    /// Build an immutable zone over a packed page whose list headers were
    /// already decoded into `lists` (guard slots included).
    pub(crate) fn immutable(
        memory: Vec<u8>,
        lists: Vec<DeltaList>,
        coding: DeltaCoding,
        value_bits: u32,
        first_list: u32,
        tag: u8,
    ) -> Self {
        let list_count = (lists.len() - 2) as u32;
        Self {
            memory,
            lists,
            new_offsets: Vec::new(),
            coding,
            value_bits,
            zone_number: 0,
            first_list,
            list_count,
            mutable: false,
            tag,
            counters: ZoneCounters::default(),
        }
    }

    pub fn zone_number(&self) -> u32 {
        self.zone_number
    }

    pub fn first_list(&self) -> u32 {
        self.first_list
    }

    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub(crate) fn set_tag(&mut self, tag: u8) {
        self.tag = tag;
    }

    pub fn coding(&self) -> DeltaCoding {
        self.coding
    }

    pub fn value_bits(&self) -> u32 {
        self.value_bits
    }

    /// Size of the zone buffer in bytes.
    pub fn size(&self) -> usize {
        self.memory.len()
    }

    pub fn record_count(&self) -> u64 {
        self.counters.record_count
    }

    pub fn collision_count(&self) -> u64 {
        self.counters.collision_count
    }

    pub(crate) fn set_totals(&mut self, records: u64, collisions: u64) {
        self.counters.record_count = records;
        self.counters.collision_count = collisions;
    }

    /// Header of zone-relative list `index` (0-based, guards excluded).
    pub fn list(&self, index: u32) -> DeltaList {
        self.lists[index as usize + 1]
    }

    /// Translate a global list number into a zone-relative one.
    pub(crate) fn local_list(&self, list_number: u32) -> Result<u32> {
        list_number
            .checked_sub(self.first_list)
            .filter(|local| *local < self.list_count)
            .ok_or_else(|| {
                IndexError::corrupt(format!(
                    "delta list number {list_number} is not in zone {} (lists {}..{})",
                    self.zone_number,
                    self.first_list,
                    self.first_list + self.list_count
                ))
            })
    }

    /// Reset to the empty layout. Records held become discards.
    pub fn empty(&mut self) {
        for list in &mut self.lists {
            *list = DeltaList::default();
        }
        let guard_start = (self.memory.len() * 8) as u64 - u64::from(GUARD_BITS);
        let count = self.list_count as usize;
        self.lists[count + 1] = DeltaList {
            start: guard_start,
            size: GUARD_BITS as u16,
            ..DeltaList::default()
        };
        let guard_byte = (guard_start / 8) as usize;
        self.memory[guard_byte..guard_byte + POST_FIELD_GUARD_BYTES].fill(0xFF);

        let spacing = guard_start / count as u64;
        let mut offset = spacing / 2;
        for list in &mut self.lists[1..=count] {
            list.start = offset;
            offset += spacing;
        }

        self.counters.discard_count = self
            .counters
            .discard_count
            .wrapping_add(self.counters.record_count);
        self.counters.record_count = 0;
        self.counters.collision_count = 0;
    }

    /// Bits occupied by real lists.
    pub fn bits_used(&self) -> u64 {
        self.lists[1..=self.list_count as usize]
            .iter()
            .map(|list| u64::from(list.size))
            .sum()
    }

    pub fn bits_allocated(&self) -> u64 {
        (self.memory.len() * 8) as u64
    }

    pub fn memory_allocated(&self) -> usize {
        self.memory.len()
            + self.lists.len() * std::mem::size_of::<DeltaList>()
            + self.new_offsets.len() * std::mem::size_of::<u64>()
    }

    fn bytes_in_lists(&self) -> usize {
        self.lists.iter().map(DeltaList::byte_size).sum()
    }

    /// Lay out new list offsets with equal free space between lists.
    /// `growing_index` names the slot that must gain `growing_size` bytes in
    /// front of it; zero means no list grows.
    fn compute_new_list_offsets(&mut self, growing_index: u32, growing_size: usize, used: usize) {
        let count = self.list_count as usize;
        let spacing = ((self.memory.len() - used) / count) as u64;
        self.new_offsets[0] = 0;
        for i in 0..=count {
            self.new_offsets[i + 1] =
                self.new_offsets[i] + self.lists[i].byte_size() as u64 + spacing;
            self.new_offsets[i] *= 8;
            self.new_offsets[i] += self.lists[i].start % 8;
            if i == 0 {
                self.new_offsets[i + 1] -= spacing / 2;
            }
            if i + 1 == growing_index as usize {
                self.new_offsets[i + 1] += growing_size as u64;
            }
        }
        self.new_offsets[count + 1] =
            (self.memory.len() * 8) as u64 - u64::from(self.lists[count + 1].size);
    }

    /// Move lists `first..=last` to their new offsets. Lists moving down go
    /// first, then the range is split so nothing is overwritten before it moves.
    fn rebalance(&mut self, first: usize, last: usize) {
        if first == last {
            let new_start = self.new_offsets[first];
            let list = self.lists[first];
            if list.start != new_start {
                let source = list.byte_start();
                self.lists[first].start = new_start;
                let destination = self.lists[first].byte_start();
                let len = self.lists[first].byte_size();
                self.memory.copy_within(source..source + len, destination);
            }
            return;
        }
        let middle = first + (last - first) / 2;
        if self.new_offsets[middle] > self.lists[middle].start {
            self.rebalance(middle + 1, last);
            self.rebalance(first, middle);
        } else {
            self.rebalance(first, middle);
            self.rebalance(middle + 1, last);
        }
    }

    /// Redistribute free space so slot `growing_index` gains `growing_size`
    /// bytes before its start.
    pub(crate) fn extend(&mut self, growing_index: u32, growing_size: usize) -> Result<()> {
        let started = Instant::now();
        let used = growing_size + self.bytes_in_lists();
        if self.memory.len() < used {
            return Err(IndexError::overflow(format!(
                "delta zone {} needs {used} bytes but holds {}",
                self.zone_number,
                self.memory.len()
            )));
        }
        self.compute_new_list_offsets(growing_index, growing_size, used);
        self.rebalance(1, self.list_count as usize + 1);
        let elapsed = started.elapsed();
        self.counters.rebalance_count += 1;
        self.counters.rebalance_time += elapsed;
        debug!(
            zone = self.zone_number,
            tag = %char::from(self.tag),
            bytes_used = used,
            elapsed_us = elapsed.as_micros() as u64,
            "rebalanced delta zone"
        );
        Ok(())
    }

    /// Assign fresh, evenly spaced offsets from the list sizes alone. Used
    /// after a restore has read the size table but not the list data.
    pub(crate) fn rebalance_lists(&mut self) -> Result<()> {
        let used = self.bytes_in_lists();
        if used > self.memory.len() {
            return Err(IndexError::overflow(format!(
                "restored lists need {used} bytes but delta zone {} holds {}",
                self.zone_number,
                self.memory.len()
            )));
        }
        self.compute_new_list_offsets(0, 0, used);
        let count = self.list_count as usize;
        for i in 1..=count + 1 {
            self.lists[i].start = self.new_offsets[i];
        }
        Ok(())
    }

    /// Open a gap of `size` bits at the entry's offset.
    pub(crate) fn insert_bits(&mut self, entry: &mut DeltaIndexEntry, size: u32) -> Result<()> {
        let index = entry.list_number as usize + 1;
        let list = self.lists[index];
        let total = u32::from(list.size);
        let before = entry.offset;
        let after = total - entry.offset;

        if total + size > DELTA_LIST_MAX_BITS {
            entry.list_overflow = true;
            self.counters.overflow_count += 1;
            return Err(IndexError::overflow(format!(
                "delta list {} would grow to {} bits",
                self.first_list + entry.list_number,
                total + size
            )));
        }

        let wanted = u64::from(size);
        let free_before = list.start - self.lists[index - 1].end();
        let free_after = self.lists[index + 1].start - list.end();
        let before_flag = if wanted <= free_before && wanted <= free_after {
            // Room on both sides: move the shorter half, or toward the
            // larger gap when the halves tie.
            if before < after {
                true
            } else if after < before {
                false
            } else {
                free_before > free_after
            }
        } else if wanted <= free_before {
            true
        } else if wanted <= free_after {
            false
        } else {
            let before_flag = before < after;
            let growing_index = entry.list_number + 1 + u32::from(!before_flag);
            if let Err(err) = self.extend(growing_index, size.div_ceil(8) as usize) {
                entry.list_overflow = true;
                self.counters.overflow_count += 1;
                return Err(err);
            }
            before_flag
        };

        let list = &mut self.lists[index];
        let (source, destination, count) = if before_flag {
            let source = list.start;
            list.start -= wanted;
            list.size += size as u16;
            (source, source - wanted, before)
        } else {
            list.size += size as u16;
            let source = list.start + u64::from(entry.offset);
            (source, source + wanted, after)
        };
        bits::move_bits_within(&mut self.memory, source, destination, u64::from(count));
        Ok(())
    }

    /// Close a gap of `size` bits at the entry's offset.
    pub(crate) fn delete_bits(&mut self, entry: &DeltaIndexEntry, size: u32) {
        let index = entry.list_number as usize + 1;
        let list = self.lists[index];
        let total = u32::from(list.size);
        let before = entry.offset;
        let after = total - entry.offset - size;

        let before_flag = if before < after {
            true
        } else if after < before {
            false
        } else {
            let free_before = list.start - self.lists[index - 1].end();
            let free_after = self.lists[index + 1].start - list.end();
            free_before < free_after
        };

        let list = &mut self.lists[index];
        let wanted = u64::from(size);
        let (source, destination, count) = if before_flag {
            let source = list.start;
            list.start += wanted;
            list.size -= size as u16;
            (source, source + wanted, before)
        } else {
            list.size -= size as u16;
            let destination = list.start + u64::from(entry.offset);
            (destination + wanted, destination, after)
        };
        bits::move_bits_within(&mut self.memory, source, destination, u64::from(count));
    }

    /// Check list ordering, the guard lists and the guard bytes.
    pub fn verify_layout(&self) -> Result<()> {
        let count = self.list_count as usize;
        let fail = |detail: String| {
            warn!(zone = self.zone_number, %detail, "delta zone layout check failed");
            Err(IndexError::corrupt(detail))
        };
        let head = self.lists[0];
        if head.start != 0 || head.size != 0 {
            return fail(format!("head guard list is {}+{}", head.start, head.size));
        }
        let tail = self.lists[count + 1];
        let guard_start = self.bits_allocated() - u64::from(GUARD_BITS);
        if tail.start != guard_start || u32::from(tail.size) != GUARD_BITS {
            return fail(format!("tail guard list is {}+{}", tail.start, tail.size));
        }
        let guard_byte = (guard_start / 8) as usize;
        if self.memory[guard_byte..guard_byte + POST_FIELD_GUARD_BYTES]
            .iter()
            .any(|&byte| byte != 0xFF)
        {
            return fail("tail guard bytes were overwritten".to_owned());
        }
        for i in 1..=count + 1 {
            if self.lists[i - 1].end() > self.lists[i].start {
                return fail(format!(
                    "delta list {} ends at {} after list {} starts at {}",
                    i - 1,
                    self.lists[i - 1].end(),
                    i,
                    self.lists[i].start
                ));
            }
        }
        Ok(())
    }
}
