//! Point-in-time counters for a delta index.

use std::ops::AddAssign;

use serde::Serialize;

use crate::zone::DeltaZone;

/// Aggregated counters across the zones of one delta index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeltaIndexStats {
    /// Bytes of zone memory, guard bytes included.
    pub memory_allocated: usize,
    /// Time spent moving lists to make room.
    pub rebalance_time_ns: u64,
    pub rebalance_count: u64,
    /// Entries currently stored, collision entries included.
    pub record_count: u64,
    /// Entries that carry a full record name.
    pub collision_count: u64,
    /// Entries removed, or dropped when their zone was emptied.
    pub discard_count: u64,
    /// Inserts refused because a zone had no room left.
    pub overflow_count: u64,
    pub list_count: u64,
}

impl DeltaIndexStats {
    /// Counters of a single zone.
    pub fn of_zone(zone: &DeltaZone) -> Self {
        let counters = &zone.counters;
        Self {
            memory_allocated: zone.memory_allocated(),
            rebalance_time_ns: u64::try_from(counters.rebalance_time.as_nanos())
                .unwrap_or(u64::MAX),
            rebalance_count: counters.rebalance_count,
            record_count: counters.record_count,
            collision_count: counters.collision_count,
            discard_count: counters.discard_count,
            overflow_count: counters.overflow_count,
            list_count: u64::from(zone.list_count),
        }
    }
}

impl AddAssign for DeltaIndexStats {
    fn add_assign(&mut self, other: Self) {
        self.memory_allocated += other.memory_allocated;
        self.rebalance_time_ns = self.rebalance_time_ns.saturating_add(other.rebalance_time_ns);
        self.rebalance_count += other.rebalance_count;
        self.record_count = self.record_count.wrapping_add(other.record_count);
        self.collision_count = self.collision_count.wrapping_add(other.collision_count);
        self.discard_count = self.discard_count.wrapping_add(other.discard_count);
        self.overflow_count += other.overflow_count;
        self.list_count += other.list_count;
    }
}

impl<'a> std::iter::Sum<&'a DeltaZone> for DeltaIndexStats {
    fn sum<I: Iterator<Item = &'a DeltaZone>>(iter: I) -> Self {
        let mut total = Self::default();
        for zone in iter {
            total += Self::of_zone(zone);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_sum_over_zones() {
        let zones = [
            DeltaZone::new(0, 64 * 1024, 0, 8, 256, 8).expect("zone 0"),
            DeltaZone::new(1, 64 * 1024, 8, 4, 256, 8).expect("zone 1"),
        ];
        let stats: DeltaIndexStats = zones.iter().sum();
        assert_eq!(stats.list_count, 12);
        assert_eq!(stats.record_count, 0);
        assert!(stats.memory_allocated >= 2 * 64 * 1024);

        let json = serde_json::to_value(stats).expect("serialize");
        assert_eq!(json["list_count"], 12);
    }
}
