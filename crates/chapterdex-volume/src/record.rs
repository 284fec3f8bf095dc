//! The result of looking a record name up in the volume index.

use chapterdex_delta::DeltaIndexEntry;
use chapterdex_error::{IndexError, Result};
use chapterdex_types::RecordName;

use crate::telemetry::SubIndexKind;

/// A located (or locatable) record in one sub-index zone.
///
/// The record remembers where its entry lives, so it can be updated
/// without searching again. It goes stale as soon as anything else mutates
/// the same delta list; get a fresh record before using it again.
#[derive(Debug, Clone)]
pub struct VolumeIndexRecord {
    pub(crate) name: RecordName,
    pub(crate) sub_index: SubIndexKind,
    pub(crate) zone_number: u32,
    pub(crate) entry: DeltaIndexEntry,
    pub(crate) is_found: bool,
    pub(crate) is_collision: bool,
    pub(crate) virtual_chapter: u64,
    /// Cleared by a remove; every later operation is refused.
    pub(crate) valid: bool,
}

impl VolumeIndexRecord {
    pub(crate) fn new(
        name: RecordName,
        sub_index: SubIndexKind,
        zone_number: u32,
        entry: DeltaIndexEntry,
    ) -> Self {
        Self {
            name,
            sub_index,
            zone_number,
            entry,
            is_found: false,
            is_collision: false,
            virtual_chapter: 0,
            valid: true,
        }
    }

    pub fn name(&self) -> &RecordName {
        &self.name
    }

    pub fn sub_index(&self) -> SubIndexKind {
        self.sub_index
    }

    pub fn zone_number(&self) -> u32 {
        self.zone_number
    }

    /// True when an entry with this record's address exists. Without a
    /// collision the stored name is unknown, so this is a likely match
    /// rather than a certain one.
    pub fn is_found(&self) -> bool {
        self.is_found
    }

    pub fn is_collision(&self) -> bool {
        self.is_collision
    }

    /// Chapter of the matching entry.
    pub fn virtual_chapter(&self) -> Option<u64> {
        self.is_found.then_some(self.virtual_chapter)
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub(crate) fn check_valid(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(IndexError::bad_state("volume index record was already removed"))
        }
    }

    /// A record must be valid and found before it can be changed.
    pub(crate) fn check_found(&self) -> Result<()> {
        self.check_valid()?;
        if self.is_found {
            Ok(())
        } else {
            Err(IndexError::bad_state("illegal operation on a new record"))
        }
    }
}
