//! Structured events from the volume index.
//!
//! The index never keeps process-wide counters. Anything that wants to see
//! early flushes, dropped entries or aborted restores installs a
//! [`VolumeIndexObserver`]; the default observer does nothing.
//!
//! Observers are called on the zone's own thread, sometimes with the sample
//! zone's mutex held. They must not block or call back into the index.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::warn;

/// Which sub-index an event or record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SubIndexKind {
    Dense,
    Sample,
}

impl SubIndexKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dense => "dense",
            Self::Sample => "sample",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VolumeIndexEvent {
    /// Chapters expired before the window required it, to bound zone memory.
    EarlyFlush {
        sub_index: SubIndexKind,
        zone: u32,
        /// The chapter being opened.
        chapter: u64,
        first_expired: u64,
        last_expired: u64,
    },

    /// An insert was dropped because its delta list or zone was full.
    EntryOverflow {
        sub_index: SubIndexKind,
        zone: u32,
        chapter: u64,
        /// Drops since the index was created, this one included.
        dropped: u64,
    },

    /// A load failed and the index was emptied.
    RestoreAborted { error: &'static str },
}

impl VolumeIndexEvent {
    #[must_use]
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::EarlyFlush { .. } => "early_flush",
            Self::EntryOverflow { .. } => "entry_overflow",
            Self::RestoreAborted { .. } => "restore_aborted",
        }
    }
}

pub trait VolumeIndexObserver: Send + Sync {
    fn on_event(&self, event: &VolumeIndexEvent);
}

pub struct NoOpVolumeIndexObserver;

impl VolumeIndexObserver for NoOpVolumeIndexObserver {
    #[inline]
    fn on_event(&self, _event: &VolumeIndexEvent) {}
}

/// Observer that keeps recent events for inspection.
///
/// Overflow drops for the same sub-index, zone and chapter are merged into
/// the entry already held for them, whose `dropped` then tracks the latest
/// total. Once `capacity` distinct events are held the oldest is evicted.
pub struct VolumeEventLog {
    inner: parking_lot::Mutex<EventLogInner>,
}

struct EventLogInner {
    events: VecDeque<VolumeIndexEvent>,
    capacity: usize,
    evicted: u64,
    merged: u64,
}

impl EventLogInner {
    /// Fold an overflow into the held entry for the same zone and chapter.
    fn merge_overflow(&mut self, event: &VolumeIndexEvent) -> bool {
        let VolumeIndexEvent::EntryOverflow {
            sub_index,
            zone,
            chapter,
            dropped,
        } = *event
        else {
            return false;
        };
        let held = self.events.iter_mut().rev().find_map(|held| match held {
            VolumeIndexEvent::EntryOverflow {
                sub_index: s,
                zone: z,
                chapter: c,
                dropped: d,
            } if *s == sub_index && *z == zone && *c == chapter => Some(d),
            _ => None,
        });
        match held {
            Some(held) => {
                *held = (*held).max(dropped);
                self.merged += 1;
                true
            }
            None => false,
        }
    }
}

impl VolumeEventLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: parking_lot::Mutex::new(EventLogInner {
                events: VecDeque::with_capacity(capacity),
                capacity,
                evicted: 0,
                merged: 0,
            }),
        }
    }

    /// Remove and return the held events, oldest first.
    #[must_use]
    pub fn take(&self) -> Vec<VolumeIndexEvent> {
        self.inner.lock().events.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events pushed out by newer ones.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.inner.lock().evicted
    }

    /// Overflow events folded into an entry that was already held.
    #[must_use]
    pub fn merged_overflows(&self) -> u64 {
        self.inner.lock().merged
    }

    /// Chapters expired early in `sub_index` according to the held
    /// `EarlyFlush` events.
    #[must_use]
    pub fn expired_chapters(&self, sub_index: SubIndexKind) -> u64 {
        self.inner
            .lock()
            .events
            .iter()
            .map(|event| match *event {
                VolumeIndexEvent::EarlyFlush {
                    sub_index: kind,
                    first_expired,
                    last_expired,
                    ..
                } if kind == sub_index => last_expired - first_expired + 1,
                _ => 0,
            })
            .sum()
    }
}

impl VolumeIndexObserver for VolumeEventLog {
    fn on_event(&self, event: &VolumeIndexEvent) {
        let mut inner = self.inner.lock();
        if inner.merge_overflow(event) {
            return;
        }
        if inner.events.len() == inner.capacity {
            inner.events.pop_front();
            inner.evicted += 1;
        }
        inner.events.push_back(event.clone());
    }
}

/// Overflow warnings are logged for the first drop and then once per this
/// many drops.
pub const OVERFLOW_LOG_INTERVAL: u64 = 4096;

/// Where the index sends events, plus the one counter it must share across
/// zones.
pub(crate) struct EventSink {
    observer: Arc<dyn VolumeIndexObserver>,
    overflow_drops: AtomicU64,
}

impl EventSink {
    pub(crate) fn new(observer: Arc<dyn VolumeIndexObserver>) -> Self {
        Self {
            observer,
            overflow_drops: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_observer(&mut self, observer: Arc<dyn VolumeIndexObserver>) {
        self.observer = observer;
    }

    pub(crate) fn emit(&self, event: &VolumeIndexEvent) {
        self.observer.on_event(event);
    }

    pub(crate) fn overflow_drops(&self) -> u64 {
        self.overflow_drops.load(Ordering::Relaxed)
    }

    pub(crate) fn entry_overflow(&self, sub_index: SubIndexKind, zone: u32, chapter: u64) {
        let dropped = self.overflow_drops.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped % OVERFLOW_LOG_INTERVAL == 1 {
            warn!(
                sub_index = sub_index.as_str(),
                zone,
                chapter,
                dropped,
                "volume index entry dropped due to overflow condition"
            );
        }
        self.emit(&VolumeIndexEvent::EntryOverflow {
            sub_index,
            zone,
            chapter,
            dropped,
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(Arc::new(NoOpVolumeIndexObserver))
    }
}
