//! Lock-free ring buffer of entity/component events.
//!
//! [`EventBuffer`] is a fixed-size ring of packed event records plus a
//! single monotonic write index. Writers never block: `push` does a
//! fetch-add on the index and an atomic store of the record into the
//! resulting slot, overwriting the oldest entry on wrap-around. Readers
//! compare their own last-seen index against the current write index to
//! discover how much of the log they have not yet scanned, and detect
//! when they have lagged far enough to lose events (ยง4.5).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Bitmask set of event kinds (ยง3).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EventKind: u8 {
        const ADDED = 1 << 0;
        const REMOVED = 1 << 1;
        const CHANGED = 1 << 2;
        const COMPONENT_ADDED = 1 << 3;
        const COMPONENT_REMOVED = 1 << 4;
    }
}

/// An 8-byte event record: `(entity_id, event_type, padding, component_id)`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct EventRecord {
    pub entity_id: u32,
    pub event_type: EventKind,
    pub component_id: u16,
}

impl EventRecord {
    fn pack(self) -> u64 {
        (self.entity_id as u64)
            | ((self.event_type.bits() as u64) << 32)
            | ((self.component_id as u64) << 48)
    }

    fn unpack(word: u64) -> Self {
        let entity_id = word as u32;
        let event_type = EventKind::from_bits_truncate((word >> 32) as u8);
        let component_id = (word >> 48) as u16;
        Self {
            entity_id,
            event_type,
            component_id,
        }
    }
}

/// Shared, lock-free event ring buffer.
#[derive(Debug)]
pub struct EventBuffer {
    slots: Vec<AtomicU64>,
    write_index: AtomicU32,
    max_events: u32,
}

impl EventBuffer {
    pub fn new(max_events: u32) -> Self {
        assert!(max_events > 0, "max_events must be > 0");
        Self {
            slots: (0..max_events).map(|_| AtomicU64::new(0)).collect(),
            write_index: AtomicU32::new(0),
            max_events,
        }
    }

    /// Current write index (number of events ever pushed, mod 2^32).
    pub fn write_index(&self) -> u32 {
        self.write_index.load(Ordering::Acquire)
    }

    /// Push a raw event record.
    pub fn push(&self, entity_id: u32, event_type: EventKind, component_id: u16) {
        let index = self.write_index.fetch_add(1, Ordering::AcqRel);
        let slot = (index % self.max_events) as usize;
        let record = EventRecord {
            entity_id,
            event_type,
            component_id,
        };
        self.slots[slot].store(record.pack(), Ordering::Release);
    }

    pub fn push_added(&self, entity_id: u32) {
        self.push(entity_id, EventKind::ADDED, 0);
    }

    pub fn push_removed(&self, entity_id: u32) {
        self.push(entity_id, EventKind::REMOVED, 0);
    }

    pub fn push_changed(&self, entity_id: u32, component_id: u16) {
        self.push(entity_id, EventKind::CHANGED, component_id);
    }

    pub fn push_component_added(&self, entity_id: u32, component_id: u16) {
        self.push(entity_id, EventKind::COMPONENT_ADDED, component_id);
    }

    pub fn push_component_removed(&self, entity_id: u32, component_id: u16) {
        self.push(entity_id, EventKind::COMPONENT_REMOVED, component_id);
    }

    /// Read the event stored at absolute index `i` (mod `max_events`),
    /// without any bounds/staleness checking -- used for debug dumps.
    pub fn read_event(&self, i: u32) -> EventRecord {
        let slot = (i % self.max_events) as usize;
        EventRecord::unpack(self.slots[slot].load(Ordering::Acquire))
    }

    /// Collect the set of distinct entity ids affected by events in
    /// `(last_index, current_write_index]` whose kind matches
    /// `event_type_mask`, optionally filtered (for `CHANGED` events) by
    /// testing `component_id` against `component_mask`.
    ///
    /// Returns `(entities, new_last_index, overflowed)`. `overflowed` is
    /// `true` when the caller had lagged far enough that some events were
    /// overwritten before being scanned; the log is still a correct,
    /// non-corrupted view of whatever range survived.
    pub fn collect_entities_in_range(
        &self,
        last_index: u32,
        event_type_mask: EventKind,
        component_mask: Option<&crate::query::Bitmask>,
    ) -> (HashSet<u32>, u32, bool) {
        let current = self.write_index();
        let mut last_index = last_index;
        let mut overflowed = false;
        if current.wrapping_sub(last_index) > self.max_events {
            last_index = current.wrapping_sub(self.max_events);
            overflowed = true;
            tracing::warn!(
                max_events = self.max_events,
                "event reader lagged past ring buffer capacity; missed events"
            );
        }

        let mut entities = HashSet::new();
        let mut i = last_index;
        while i != current {
            let record = self.read_event(i);
            if record.event_type.intersects(event_type_mask) {
                let passes_component_filter = if record.event_type == EventKind::CHANGED {
                    match component_mask {
                        Some(mask) => mask.test(record.component_id as u32),
                        None => true,
                    }
                } else {
                    true
                };
                if passes_component_filter {
                    entities.insert(record.entity_id);
                }
            }
            i = i.wrapping_add(1);
        }
        (entities, current, overflowed)
    }

    /// Debug helper: read every event in `(last_index, current]`, in order.
    pub fn read_events(&self, last_index: u32) -> (Vec<EventRecord>, u32) {
        let current = self.write_index();
        let last_index = if current.wrapping_sub(last_index) > self.max_events {
            current.wrapping_sub(self.max_events)
        } else {
            last_index
        };
        let mut out = Vec::new();
        let mut i = last_index;
        while i != current {
            out.push(self.read_event(i));
            i = i.wrapping_add(1);
        }
        (out, current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Bitmask;

    #[test]
    fn push_then_collect_added() {
        let buf = EventBuffer::new(16);
        buf.push_added(1);
        buf.push_added(2);
        let (entities, idx, overflowed) =
            buf.collect_entities_in_range(0, EventKind::ADDED, None);
        assert_eq!(entities, [1, 2].into_iter().collect());
        assert_eq!(idx, 2);
        assert!(!overflowed);
    }

    #[test]
    fn changed_filtered_by_component_mask() {
        let buf = EventBuffer::new(16);
        buf.push_changed(1, 0);
        buf.push_changed(2, 5);
        let mask = Bitmask::from_bits(&[0], 1);
        let (entities, _, _) =
            buf.collect_entities_in_range(0, EventKind::CHANGED, Some(&mask));
        assert_eq!(entities, [1].into_iter().collect());
    }

    #[test]
    fn ring_wrap_clamps_and_warns() {
        let buf = EventBuffer::new(4);
        for e in 1..=6u32 {
            buf.push_added(e);
        }
        let (entities, idx, overflowed) =
            buf.collect_entities_in_range(0, EventKind::ADDED, None);
        assert!(overflowed);
        assert_eq!(idx, 6);
        assert!(entities.len() <= 4);
        assert!(entities.is_subset(&[3, 4, 5, 6].into_iter().collect()));
    }

    #[test]
    fn event_type_mask_filters_kinds() {
        let buf = EventBuffer::new(16);
        buf.push_added(1);
        buf.push_removed(2);
        let (entities, _, _) =
            buf.collect_entities_in_range(0, EventKind::REMOVED, None);
        assert_eq!(entities, [2].into_iter().collect());
    }

    #[test]
    fn read_event_roundtrips_fields() {
        let buf = EventBuffer::new(4);
        buf.push(7, EventKind::COMPONENT_ADDED, 3);
        let record = buf.read_event(0);
        assert_eq!(record.entity_id, 7);
        assert_eq!(record.event_type, EventKind::COMPONENT_ADDED);
        assert_eq!(record.component_id, 3);
    }
}
