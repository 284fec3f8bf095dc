//! Cursors over delta lists and the entry-level operations on a zone.
//!
//! An entry is `value_bits` of payload, then the Huffman-coded key delta,
//! then for a collision entry the full 256-bit record name. A collision
//! entry has delta zero and is never first in its list, which is how it is
//! told apart from an ordinary entry whose key is zero.

use chapterdex_error::{IndexError, Result};
use chapterdex_types::{RECORD_NAME_SIZE, RecordName};

use crate::bits;
use crate::zone::DeltaZone;

/// Bytes of record name carried by a collision entry.
pub const COLLISION_BYTES: usize = RECORD_NAME_SIZE;

/// Bits of record name carried by a collision entry.
pub const COLLISION_BITS: u32 = (COLLISION_BYTES * 8) as u32;

/// Position of a search within one delta list.
///
/// The cursor holds only offsets; the list's start and size are read from
/// the zone on every call, so it stays valid across rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaIndexEntry {
    /// Key of the current entry.
    pub key: u32,
    /// Key difference from the previous entry.
    pub delta: u32,
    /// Bit offset of the entry within its list.
    pub offset: u32,
    /// Total bits of the entry, payload and collision name included.
    pub entry_bits: u32,
    pub value_bits: u32,
    pub at_end: bool,
    pub is_collision: bool,
    /// Set when an insert into this list failed for lack of room.
    pub list_overflow: bool,
    pub(crate) zone_number: u32,
    /// Zone-relative list number.
    pub(crate) list_number: u32,
}

impl DeltaIndexEntry {
    pub fn zone_number(&self) -> u32 {
        self.zone_number
    }
}

#[inline]
const fn mask32(bits: u32) -> u32 {
    if bits >= u32::BITS {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

impl DeltaZone {
    fn require_mutable(&self) -> Result<()> {
        if self.mutable {
            Ok(())
        } else {
            Err(IndexError::bad_state(format!(
                "delta index '{}' is not mutable",
                char::from(self.tag)
            )))
        }
    }

    fn require_not_at_end(entry: &DeltaIndexEntry) -> Result<()> {
        if entry.at_end {
            Err(IndexError::bad_state(
                "operation is invalid because the list entry is at the end of the delta list",
            ))
        } else {
            Ok(())
        }
    }

    /// Position a cursor before the first entry that could hold `key`,
    /// resuming from the list's remembered position when that is safe.
    pub fn start_search(&self, list_number: u32, key: u32) -> Result<DeltaIndexEntry> {
        let local = self.local_list(list_number)?;
        let list = self.list(local);
        let (start_key, offset) = if key > list.save_key {
            (list.save_key, u32::from(list.save_offset))
        } else {
            (0, 0)
        };
        Ok(DeltaIndexEntry {
            key: start_key,
            delta: 0,
            offset,
            entry_bits: 0,
            value_bits: self.value_bits,
            at_end: false,
            is_collision: false,
            list_overflow: false,
            zone_number: self.zone_number,
            list_number: local,
        })
    }

    fn decode_delta(&self, entry: &mut DeltaIndexEntry) {
        let list = self.list(entry.list_number);
        let delta_offset =
            list.start + u64::from(entry.offset) + u64::from(entry.value_bits);
        let mut address = (delta_offset / 8) as usize;
        let shift = (delta_offset % 8) as u32;
        let mut data = bits::load_le32(&self.memory, address) >> shift;
        address += 4;

        let coding = &self.coding;
        let mut key_bits = coding.min_bits;
        let mut delta = data & mask32(key_bits);
        if delta >= coding.min_keys {
            data >>= key_bits;
            if data == 0 {
                key_bits = u32::BITS - shift;
                loop {
                    data = bits::load_le32(&self.memory, address);
                    if data != 0 {
                        break;
                    }
                    address += 4;
                    key_bits += u32::BITS;
                }
            }
            key_bits += data.trailing_zeros() + 1;
            delta = delta.wrapping_add(
                (key_bits - coding.min_bits - 1).wrapping_mul(coding.incr_keys),
            );
        }

        entry.delta = delta;
        entry.key = entry.key.wrapping_add(delta);
        if delta == 0 && entry.offset > 0 {
            entry.is_collision = true;
            entry.entry_bits = entry.value_bits + key_bits + COLLISION_BITS;
        } else {
            entry.is_collision = false;
            entry.entry_bits = entry.value_bits + key_bits;
        }
    }

    /// Advance to the next entry, or to the end of the list.
    pub fn next_entry(&self, entry: &mut DeltaIndexEntry) -> Result<()> {
        Self::require_not_at_end(entry)?;
        let size = u32::from(self.list(entry.list_number).size);
        entry.offset += entry.entry_bits;
        if entry.offset >= size {
            entry.at_end = true;
            entry.delta = 0;
            entry.is_collision = false;
            if entry.offset == size {
                return Ok(());
            }
            tracing::warn!(
                list = self.first_list + entry.list_number,
                offset = entry.offset,
                size,
                "delta list decode ran past the list end"
            );
            return Err(IndexError::corrupt(format!(
                "next offset {} is past the end of delta list {} ({size} bits)",
                entry.offset,
                self.first_list + entry.list_number
            )));
        }

        self.decode_delta(entry);
        let end = entry.offset + entry.entry_bits;
        if end > size {
            tracing::warn!(
                list = self.first_list + entry.list_number,
                offset = entry.offset,
                entry_bits = entry.entry_bits,
                size,
                "decoded delta entry overruns its list"
            );
            return Err(IndexError::corrupt(format!(
                "entry at offset {} of delta list {} ends at {end}, past {size}",
                entry.offset,
                self.first_list + entry.list_number
            )));
        }
        Ok(())
    }

    /// Cache the cursor position so a later search for a larger key can
    /// resume here. Immutable pages carry no cache.
    pub fn remember_offset(&mut self, entry: &DeltaIndexEntry) -> Result<()> {
        if entry.is_collision {
            return Err(IndexError::bad_state(
                "cannot remember the offset of a collision entry",
            ));
        }
        if !self.mutable {
            return Ok(());
        }
        let list = &mut self.lists[entry.list_number as usize + 1];
        list.save_key = entry.key - entry.delta;
        list.save_offset = entry.offset as u16;
        Ok(())
    }

    /// Find the entry for `key`, preferring the collision entry that names
    /// `name` when several entries share the key.
    ///
    /// The returned cursor is at the first entry whose key is not below
    /// `key`, or at the end of the list.
    pub fn get_entry(
        &mut self,
        list_number: u32,
        key: u32,
        name: &RecordName,
    ) -> Result<DeltaIndexEntry> {
        let mut entry = self.start_search(list_number, key)?;
        loop {
            self.next_entry(&mut entry)?;
            if entry.at_end || key <= entry.key {
                break;
            }
        }
        self.remember_offset(&entry)?;

        if !entry.at_end && entry.key == key {
            let mut collision = entry;
            loop {
                self.next_entry(&mut collision)?;
                if collision.at_end || !collision.is_collision {
                    break;
                }
                if self.collision_name(&collision)? == *name {
                    return Ok(collision);
                }
            }
        }
        Ok(entry)
    }

    /// Payload of the entry under the cursor.
    pub fn entry_value(&self, entry: &DeltaIndexEntry) -> u32 {
        let list = self.list(entry.list_number);
        bits::read_field(
            &self.memory,
            list.start + u64::from(entry.offset),
            entry.value_bits,
        )
    }

    /// Overwrite the payload of the entry under the cursor in place.
    pub fn set_entry_value(&mut self, entry: &DeltaIndexEntry, value: u32) -> Result<()> {
        self.require_mutable()?;
        Self::require_not_at_end(entry)?;
        if value & !mask32(entry.value_bits) != 0 {
            return Err(IndexError::invalid_argument(format!(
                "value {value} does not fit in {} bits",
                entry.value_bits
            )));
        }
        let list = self.list(entry.list_number);
        bits::write_field(
            &mut self.memory,
            list.start + u64::from(entry.offset),
            entry.value_bits,
            value,
        );
        Ok(())
    }

    /// Record name stored in a collision entry.
    pub fn collision_name(&self, entry: &DeltaIndexEntry) -> Result<RecordName> {
        Self::require_not_at_end(entry)?;
        if !entry.is_collision {
            return Err(IndexError::bad_state(
                "cannot read the name of a non-collision entry",
            ));
        }
        let list = self.list(entry.list_number);
        let offset = list.start + u64::from(entry.offset + entry.entry_bits - COLLISION_BITS);
        let mut raw = [0u8; COLLISION_BYTES];
        bits::read_bytes(&self.memory, offset, &mut raw);
        Ok(RecordName::new(raw))
    }

    fn set_delta(&self, entry: &mut DeltaIndexEntry, delta: u32) {
        entry.delta = delta;
        entry.entry_bits = entry.value_bits + self.coding.key_bits(delta);
    }

    fn encode_delta(&mut self, entry: &DeltaIndexEntry) {
        let list = self.list(entry.list_number);
        let offset = list.start + u64::from(entry.offset) + u64::from(entry.value_bits);
        let coding = self.coding;
        if entry.delta < coding.min_keys {
            bits::write_field(&mut self.memory, offset, coding.min_bits, entry.delta);
            return;
        }
        let excess = entry.delta - coding.min_keys;
        let remainder = excess % coding.incr_keys + coding.min_keys;
        let quotient = excess / coding.incr_keys;
        bits::write_field(&mut self.memory, offset, coding.min_bits, remainder);
        let unary = offset + u64::from(coding.min_bits);
        bits::set_zero(&mut self.memory, unary, quotient);
        bits::write_field(&mut self.memory, unary + u64::from(quotient), 1, 1);
    }

    fn encode_entry(&mut self, entry: &DeltaIndexEntry, value: u32, name: Option<&RecordName>) {
        let list = self.list(entry.list_number);
        bits::write_field(
            &mut self.memory,
            list.start + u64::from(entry.offset),
            entry.value_bits,
            value,
        );
        self.encode_delta(entry);
        if let Some(name) = name {
            let offset =
                list.start + u64::from(entry.offset + entry.entry_bits - COLLISION_BITS);
            bits::write_bytes(&mut self.memory, offset, name.as_bytes());
        }
    }

    /// Insert an entry at the cursor.
    ///
    /// With `name`, a collision entry for the cursor's key is added after
    /// the cursor's entry. Without it, `key` must fall between the previous
    /// key and the cursor's key (or past the last key when at the end). On
    /// success the cursor addresses the new entry.
    pub fn put_entry(
        &mut self,
        entry: &mut DeltaIndexEntry,
        key: u32,
        value: u32,
        name: Option<&RecordName>,
    ) -> Result<()> {
        self.require_mutable()?;
        if entry.is_collision {
            // The caller found a collision entry carrying this very name.
            return Err(IndexError::DuplicateName);
        }
        if value & !mask32(entry.value_bits) != 0 {
            return Err(IndexError::invalid_argument(format!(
                "value {value} does not fit in {} bits",
                entry.value_bits
            )));
        }

        let save_offset = u32::from(self.list(entry.list_number).save_offset);
        if entry.offset < save_offset {
            // The list's cached position is about to shift; drop back to
            // this entry, which is before the change.
            self.remember_offset(entry)?;
        }

        if let Some(name) = name {
            if entry.at_end {
                return Err(IndexError::bad_state(
                    "a collision entry needs an existing entry to follow",
                ));
            }
            if key != entry.key {
                return Err(IndexError::invalid_argument(format!(
                    "collision key {key} does not match entry key {}",
                    entry.key
                )));
            }
            entry.offset += entry.entry_bits;
            self.set_delta(entry, 0);
            entry.is_collision = true;
            entry.entry_bits += COLLISION_BITS;
            let size = entry.entry_bits;
            self.insert_bits(entry, size)?;
        } else if entry.at_end {
            if key < entry.key {
                return Err(IndexError::invalid_argument(format!(
                    "key {key} precedes the last key {} of the list",
                    entry.key
                )));
            }
            self.set_delta(entry, key - entry.key);
            entry.key = key;
            entry.at_end = false;
            let size = entry.entry_bits;
            self.insert_bits(entry, size)?;
        } else {
            let previous_key = entry.key - entry.delta;
            if key >= entry.key || key < previous_key {
                return Err(IndexError::invalid_argument(format!(
                    "key {key} is outside the gap {previous_key}..{}",
                    entry.key
                )));
            }
            let old_entry_bits = entry.entry_bits;
            let mut next = *entry;
            let next_value = self.entry_value(&next);
            self.set_delta(entry, key - previous_key);
            entry.key = key;
            let next_delta = next.key - key;
            self.set_delta(&mut next, next_delta);
            next.offset += entry.entry_bits;
            let additional = entry.entry_bits + next.entry_bits - old_entry_bits;
            self.insert_bits(entry, additional)?;
            self.encode_entry(&next, next_value, None);
        }

        self.encode_entry(entry, value, name);
        self.counters.record_count = self.counters.record_count.wrapping_add(1);
        if entry.is_collision {
            self.counters.collision_count = self.counters.collision_count.wrapping_add(1);
        }
        Ok(())
    }

    /// Delete the entry under the cursor. The cursor moves to the entry
    /// that followed it.
    pub fn remove_entry(&mut self, entry: &mut DeltaIndexEntry) -> Result<()> {
        self.require_mutable()?;
        let mut next = *entry;
        self.next_entry(&mut next)?;

        if entry.is_collision {
            self.delete_bits(entry, entry.entry_bits);
            next.offset = entry.offset;
            self.counters.collision_count = self.counters.collision_count.wrapping_sub(1);
        } else if next.at_end {
            self.delete_bits(entry, entry.entry_bits);
            next.key -= entry.delta;
            next.offset = entry.offset;
        } else {
            // Fold this entry's delta into its successor.
            let next_value = self.entry_value(&next);
            let old_bits = entry.entry_bits + next.entry_bits;
            if next.is_collision {
                next.is_collision = false;
                self.counters.collision_count = self.counters.collision_count.wrapping_sub(1);
            }
            let next_delta = entry.delta + next.delta;
            self.set_delta(&mut next, next_delta);
            next.offset = entry.offset;
            self.delete_bits(entry, old_bits - next.entry_bits);
            self.encode_entry(&next, next_value, None);
        }

        self.counters.record_count = self.counters.record_count.wrapping_sub(1);
        self.counters.discard_count += 1;
        *entry = next;

        let list = &mut self.lists[entry.list_number as usize + 1];
        if entry.offset < u32::from(list.save_offset) {
            list.save_key = 0;
            list.save_offset = 0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> DeltaZone {
        DeltaZone::new(0, 64 * 1024, 0, 1, 256, 8).expect("zone")
    }

    fn name(byte: u8) -> RecordName {
        RecordName::new([byte; RECORD_NAME_SIZE])
    }

    fn put(zone: &mut DeltaZone, key: u32, value: u32) {
        let mut entry = zone.get_entry(0, key, &name(0)).expect("get");
        zone.put_entry(&mut entry, key, value, None).expect("put");
    }

    #[test]
    fn test_basic_get_put_remove() {
        let mut zone = zone();
        let entry = zone.get_entry(0, 0, &name(0)).expect("empty get");
        assert!(entry.at_end);

        let mut entry = zone.get_entry(0, 1, &name(1)).expect("get");
        assert!(entry.at_end);
        zone.put_entry(&mut entry, 1, 99, None).expect("put");
        assert_eq!(entry.key, 1);
        assert!(!entry.at_end);
        assert_eq!(zone.entry_value(&entry), 99);

        let entry = zone.get_entry(0, 0, &name(0)).expect("get 0");
        assert!(!entry.at_end);
        assert_eq!(entry.key, 1);

        let entry = zone.get_entry(0, 1, &name(1)).expect("get 1");
        zone.set_entry_value(&entry, 42).expect("set value");
        assert_eq!(zone.entry_value(&entry), 42);

        let entry = zone.get_entry(0, 2, &name(2)).expect("get 2");
        assert!(entry.at_end);

        let mut entry = zone.get_entry(0, 1, &name(1)).expect("get 1 again");
        zone.remove_entry(&mut entry).expect("remove");
        assert!(entry.at_end);
        let entry = zone.get_entry(0, 1, &name(1)).expect("gone");
        assert!(entry.at_end);
        assert_eq!(zone.record_count(), 0);
        assert_eq!(zone.counters.discard_count, 1);
    }

    #[test]
    fn test_insert_between_existing_keys() {
        let mut zone = zone();
        put(&mut zone, 10, 1);
        put(&mut zone, 30, 3);
        put(&mut zone, 20, 2);
        for (key, value) in [(10, 1), (20, 2), (30, 3)] {
            let entry = zone.get_entry(0, key, &name(0)).expect("get");
            assert_eq!(entry.key, key);
            assert_eq!(zone.entry_value(&entry), value);
        }
        zone.verify_layout().expect("layout");
    }

    #[test]
    fn test_collision_entries() {
        let mut zone = zone();
        let mut entry = zone.get_entry(0, 5, &name(1)).expect("get");
        zone.put_entry(&mut entry, 5, 1, None).expect("put first");

        let mut entry = zone.get_entry(0, 5, &name(2)).expect("get");
        assert!(!entry.is_collision);
        zone.put_entry(&mut entry, 5, 2, Some(&name(2))).expect("collide");
        assert!(entry.is_collision);
        assert_eq!(zone.collision_count(), 1);

        let found = zone.get_entry(0, 5, &name(2)).expect("find collision");
        assert!(found.is_collision);
        assert_eq!(zone.entry_value(&found), 2);
        assert_eq!(zone.collision_name(&found).expect("name"), name(2));

        let mut again = found;
        let err = zone
            .put_entry(&mut again, 5, 3, Some(&name(2)))
            .expect_err("duplicate");
        assert!(matches!(err, IndexError::DuplicateName));

        let plain = zone.get_entry(0, 5, &name(9)).expect("plain");
        assert!(!plain.is_collision);
        assert_eq!(zone.entry_value(&plain), 1);
        assert!(zone.collision_name(&plain).is_err());
    }

    #[test]
    fn test_removing_first_of_colliding_pair_promotes_the_collision() {
        let mut zone = zone();
        put(&mut zone, 7, 1);
        let mut entry = zone.get_entry(0, 7, &name(3)).expect("get");
        zone.put_entry(&mut entry, 7, 2, Some(&name(3))).expect("collide");
        put(&mut zone, 9, 4);

        let mut first = zone.get_entry(0, 7, &name(0)).expect("first");
        assert!(!first.is_collision);
        zone.remove_entry(&mut first).expect("remove");
        assert_eq!(first.key, 7);
        assert!(!first.is_collision);
        assert_eq!(zone.entry_value(&first), 2);
        assert_eq!(zone.collision_count(), 0);

        let later = zone.get_entry(0, 9, &name(0)).expect("later");
        assert_eq!(zone.entry_value(&later), 4);
    }

    #[test]
    fn test_operations_at_end_are_rejected() {
        let mut zone = zone();
        let mut entry = zone.get_entry(0, 3, &name(0)).expect("get");
        assert!(entry.at_end);
        assert!(matches!(
            zone.set_entry_value(&entry, 1),
            Err(IndexError::BadState { .. })
        ));
        assert!(matches!(
            zone.next_entry(&mut entry),
            Err(IndexError::BadState { .. })
        ));
        assert!(zone.remove_entry(&mut entry).is_err());
    }

    #[test]
    fn test_value_must_fit_payload() {
        let mut zone = zone();
        let mut entry = zone.get_entry(0, 3, &name(0)).expect("get");
        let err = zone.put_entry(&mut entry, 3, 256, None).expect_err("too wide");
        assert!(matches!(err, IndexError::InvalidArgument { .. }));
    }
}
