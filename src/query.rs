//! Bitmask query descriptors and per-reader incremental match tracking.
//!
//! A [`QueryDef`] is a pure descriptor over the dense component-id space:
//! `with`/`without`/`any` select the match set, `tracking` selects which
//! components' `CHANGED` events are surfaced. A [`QueryInstance`] is the
//! mutable, per-reader state built from one: a dense cache of currently
//! matching entity ids (plus a reverse index for O(1) membership tests),
//! a cursor into the event log, and per-tick memoized `added`/`removed`/
//! `changed` results.

use std::collections::HashMap;

use crate::entity::{EntityBuffer, SINGLETON_ENTITY};
use crate::event::EventKind;

const BITS_PER_WORD: u32 = 32;

/// A dense bitmask over `componentCount` bits, stored as 32-bit words.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitmask {
    words: Vec<u32>,
}

impl Bitmask {
    /// An all-zero mask sized for `word_count` words.
    pub fn empty(word_count: u32) -> Self {
        Self {
            words: vec![0; word_count.max(1) as usize],
        }
    }

    /// Build a mask with `bits` set, sized for `word_count` words.
    pub fn from_bits(bits: &[u32], word_count: u32) -> Self {
        let mut mask = Self::empty(word_count);
        for &bit in bits {
            mask.set(bit);
        }
        mask
    }

    pub fn set(&mut self, bit: u32) {
        let word = (bit / BITS_PER_WORD) as usize;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % BITS_PER_WORD);
    }

    pub fn word(&self, idx: usize) -> u32 {
        self.words.get(idx).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn test(&self, bit: u32) -> bool {
        let word = (bit / BITS_PER_WORD) as usize;
        self.words.get(word).map(|w| w & (1 << (bit % BITS_PER_WORD)) != 0).unwrap_or(false)
    }

    pub fn word_count(&self) -> u32 {
        self.words.len() as u32
    }
}

/// The four masks a query is built from (ยง3, ยง4.6). `(with, without, any)`
/// is the descriptor's cache key; `tracking` only affects `changed()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryMasks {
    pub with: Bitmask,
    pub without: Bitmask,
    pub any: Bitmask,
}

/// A query descriptor: which entities match, and which of their
/// components are watched for `CHANGED` events.
#[derive(Debug, Clone)]
pub struct QueryDef {
    pub masks: QueryMasks,
    pub tracking: Bitmask,
}

impl QueryDef {
    pub fn new(with: Bitmask, without: Bitmask, any: Bitmask, tracking: Bitmask) -> Self {
        Self {
            masks: QueryMasks { with, without, any },
            tracking,
        }
    }

    /// The cache key identifying this descriptor: `(with, without, any)`.
    /// `tracking` is deliberately excluded (ยง4.6).
    pub fn cache_key(&self) -> (Vec<u32>, Vec<u32>, Vec<u32>) {
        (
            self.masks.with.words.clone(),
            self.masks.without.words.clone(),
            self.masks.any.words.clone(),
        )
    }
}

/// Stable identity under which a [`QueryInstance`] tracks its position in
/// the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(pub u32);

/// Per-reader, per-tick memoized results.
#[derive(Debug, Clone, Default)]
struct TickCache {
    tick: u64,
    added: Option<Vec<u32>>,
    removed: Option<Vec<u32>>,
    changed: Option<Vec<u32>>,
}

/// Per-reader mutable query state: a dense current-match cache plus a
/// cursor into the event log and per-tick memoization (ยง4.6).
#[derive(Debug)]
pub struct QueryInstance {
    def: QueryDef,
    reader: ReaderId,
    last_scanned_index: u32,
    /// Dense list of currently matching entity ids.
    current: Vec<u32>,
    /// entity id -> index into `current`, for O(1) membership tests.
    index_of: HashMap<u32, usize>,
    initialized: bool,
    tick_cache: TickCache,
    /// Whether the most recent `advance()` lost events to ring-buffer
    /// overflow (ยง4.5, ยง7 `EcsError::EventOverflow`).
    overflowed: bool,
}

impl QueryInstance {
    pub fn new(def: QueryDef, reader: ReaderId, initial_write_index: u32) -> Self {
        Self {
            def,
            reader,
            last_scanned_index: initial_write_index,
            current: Vec::new(),
            index_of: HashMap::new(),
            initialized: false,
            tick_cache: TickCache::default(),
            overflowed: false,
        }
    }

    /// Whether this reader's last scan lost events to ring-buffer overflow.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn reader_id(&self) -> ReaderId {
        self.reader
    }

    pub fn masks(&self) -> &QueryMasks {
        &self.def.masks
    }

    fn insert_current(&mut self, id: u32) {
        if !self.index_of.contains_key(&id) {
            self.index_of.insert(id, self.current.len());
            self.current.push(id);
        }
    }

    fn remove_current(&mut self, id: u32) {
        if let Some(idx) = self.index_of.remove(&id) {
            let last = self.current.len() - 1;
            self.current.swap(idx, last);
            self.current.pop();
            if idx < self.current.len() {
                let moved = self.current[idx];
                self.index_of.insert(moved, idx);
            }
        }
    }

    /// Full rescan over every live entity; only run once, on first use.
    fn bootstrap(&mut self, entities: &EntityBuffer) {
        for id in 0..entities.max_entities() {
            if entities.matches(id, &self.def.masks) {
                self.insert_current(id);
            }
        }
        self.initialized = true;
    }

    /// Dense current matching entity ids (ยง4.6 `current()`).
    pub fn current(&mut self, entities: &EntityBuffer) -> &[u32] {
        if !self.initialized {
            self.bootstrap(entities);
        }
        &self.current
    }

    fn reset_tick_cache_if_stale(&mut self, tick: u64) {
        if self.tick_cache.tick != tick {
            self.tick_cache = TickCache {
                tick,
                ..Default::default()
            };
        }
    }

    /// Advance the cache by scanning `ADDED | COMPONENT_ADDED |
    /// COMPONENT_REMOVED | REMOVED` events since `last_scanned_index`,
    /// re-testing `matches()` for each affected entity, and memoizing the
    /// added/removed/changed sets for `tick`.
    fn advance(&mut self, entities: &EntityBuffer, events: &crate::event::EventBuffer, tick: u64) {
        if !self.initialized {
            self.bootstrap(entities);
        }
        self.reset_tick_cache_if_stale(tick);
        if self.tick_cache.added.is_some() {
            // Already advanced+memoized this tick.
            return;
        }

        let membership_mask =
            EventKind::ADDED | EventKind::REMOVED | EventKind::COMPONENT_ADDED | EventKind::COMPONENT_REMOVED;
        let (affected, new_index, membership_overflowed) =
            events.collect_entities_in_range(self.last_scanned_index, membership_mask, None);

        let mut added = Vec::new();
        let mut removed = Vec::new();
        for &id in &affected {
            let now_matches = entities.matches(id, &self.def.masks);
            let was_in_cache = self.index_of.contains_key(&id);
            if now_matches && !was_in_cache {
                self.insert_current(id);
                added.push(id);
            } else if !now_matches && was_in_cache {
                self.remove_current(id);
                removed.push(id);
            }
        }

        let (changed, changed_overflowed) = if self.def.tracking.is_empty() {
            (Vec::new(), false)
        } else {
            let (changed_entities, _, overflowed) =
                events.collect_entities_in_range(self.last_scanned_index, EventKind::CHANGED, Some(&self.def.tracking));
            // The singleton sentinel never carries a membership bit (it is
            // not a real entity id and never appears in `current()`), so it
            // can never be in `index_of`. Exempt it from the membership
            // filter below or a tracked singleton's CHANGED would never
            // surface (ยง4.6 `changedSingleton()`, ยง8 S2).
            (
                changed_entities
                    .into_iter()
                    .filter(|id| *id == SINGLETON_ENTITY || self.index_of.contains_key(id))
                    .collect(),
                overflowed,
            )
        };

        self.last_scanned_index = new_index;
        self.overflowed = membership_overflowed || changed_overflowed;
        self.tick_cache.added = Some(added);
        self.tick_cache.removed = Some(removed);
        self.tick_cache.changed = Some(changed);
    }

    /// Entity ids that entered the match set since the reader's last call,
    /// memoized per `tick` (ยง4.6).
    pub fn added(&mut self, entities: &EntityBuffer, events: &crate::event::EventBuffer, tick: u64) -> Vec<u32> {
        self.advance(entities, events, tick);
        self.tick_cache.added.clone().unwrap_or_default()
    }

    /// Entity ids that left the match set since the reader's last call.
    pub fn removed(&mut self, entities: &EntityBuffer, events: &crate::event::EventBuffer, tick: u64) -> Vec<u32> {
        self.advance(entities, events, tick);
        self.tick_cache.removed.clone().unwrap_or_default()
    }

    /// Entity ids (still in the match set) whose tracked components
    /// emitted `CHANGED` since the reader's last call.
    pub fn changed(&mut self, entities: &EntityBuffer, events: &crate::event::EventBuffer, tick: u64) -> Vec<u32> {
        self.advance(entities, events, tick);
        self.tick_cache.changed.clone().unwrap_or_default()
    }

    /// Whether the singleton sentinel is currently matching; for
    /// singleton components this is equivalent to `changedSingleton()`
    /// once `changed()` has been consulted.
    pub fn has(&self, id: u32) -> bool {
        self.index_of.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBuffer;

    #[test]
    fn bootstrap_scans_existing_entities() {
        let entities = EntityBuffer::new(8, 3);
        entities.create(1);
        entities.add_component_to_entity(1, 0);
        let def = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::empty(1), Bitmask::empty(1), Bitmask::empty(1));
        let mut instance = QueryInstance::new(def, ReaderId(0), 0);
        assert_eq!(instance.current(&entities), &[1]);
    }

    #[test]
    fn added_and_removed_are_tracked_incrementally() {
        let entities = EntityBuffer::new(8, 3);
        let events = EventBuffer::new(32);
        let def = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::empty(1), Bitmask::empty(1), Bitmask::empty(1));
        let mut instance = QueryInstance::new(def, ReaderId(0), events.write_index());
        assert!(instance.current(&entities).is_empty());

        entities.create(1);
        entities.add_component_to_entity(1, 0);
        events.push_added(1);
        let added = instance.added(&entities, &events, 1);
        assert_eq!(added, vec![1]);
        assert_eq!(instance.current(&entities), &[1]);

        entities.mark_dead(1);
        events.push_removed(1);
        let removed = instance.removed(&entities, &events, 2);
        assert_eq!(removed, vec![1]);
        assert!(instance.current(&entities).is_empty());
    }

    #[test]
    fn memoized_within_a_tick() {
        let entities = EntityBuffer::new(8, 3);
        let events = EventBuffer::new(32);
        entities.create(1);
        entities.add_component_to_entity(1, 0);
        events.push_added(1);
        let def = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::empty(1), Bitmask::empty(1), Bitmask::empty(1));
        let mut instance = QueryInstance::new(def, ReaderId(0), 0);

        let first = instance.added(&entities, &events, 1);
        entities.create(2);
        entities.add_component_to_entity(2, 0);
        events.push_added(2);
        let second = instance.added(&entities, &events, 1);
        assert_eq!(first, second, "same tick must return the memoized result");

        let third = instance.added(&entities, &events, 2);
        assert_eq!(third, vec![2]);
    }

    #[test]
    fn without_mask_removes_on_update() {
        let entities = EntityBuffer::new(8, 3);
        let events = EventBuffer::new(32);
        entities.create(1);
        entities.add_component_to_entity(1, 0);
        let def = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::from_bits(&[2], 1), Bitmask::empty(1), Bitmask::empty(1));
        let mut instance = QueryInstance::new(def, ReaderId(0), events.write_index());
        assert_eq!(instance.current(&entities), &[1]);

        entities.add_component_to_entity(1, 2);
        events.push_component_added(1, 2);
        let removed = instance.removed(&entities, &events, 1);
        assert_eq!(removed, vec![1]);
        assert!(instance.current(&entities).is_empty());
    }

    #[test]
    fn dead_entity_absent_from_current_but_seen_by_removed() {
        let entities = EntityBuffer::new(8, 3);
        let events = EventBuffer::new(32);
        entities.create(1);
        entities.add_component_to_entity(1, 0);
        events.push_added(1);
        let def = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::empty(1), Bitmask::empty(1), Bitmask::empty(1));
        let mut instance = QueryInstance::new(def, ReaderId(0), 0);
        instance.added(&entities, &events, 1);

        entities.mark_dead(1);
        events.push_removed(1);
        let removed = instance.removed(&entities, &events, 2);
        assert_eq!(removed, vec![1]);
        assert!(instance.current(&entities).is_empty());
    }

    #[test]
    fn changed_filters_by_tracking_mask_and_membership() {
        let entities = EntityBuffer::new(8, 3);
        let events = EventBuffer::new(32);
        entities.create(1);
        entities.add_component_to_entity(1, 0);
        events.push_added(1);
        let def = QueryDef::new(
            Bitmask::from_bits(&[0], 1),
            Bitmask::empty(1),
            Bitmask::empty(1),
            Bitmask::from_bits(&[0], 1),
        );
        let mut instance = QueryInstance::new(def, ReaderId(0), 0);
        instance.added(&entities, &events, 1);

        events.push_changed(1, 0);
        events.push_changed(1, 1); // untracked component
        let changed = instance.changed(&entities, &events, 2);
        assert_eq!(changed, vec![1]);
    }

    #[test]
    fn changed_surfaces_singleton_sentinel_despite_empty_index() {
        // The singleton sentinel never carries a membership bit, so it is
        // never present in `index_of`/`current()` -- `changed()` must still
        // report it when its tracked component fires CHANGED.
        let entities = EntityBuffer::new(8, 1);
        let events = EventBuffer::new(32);
        let def = QueryDef::new(
            Bitmask::from_bits(&[0], 1),
            Bitmask::empty(1),
            Bitmask::empty(1),
            Bitmask::from_bits(&[0], 1),
        );
        let mut instance = QueryInstance::new(def, ReaderId(0), 0);
        assert!(instance.current(&entities).is_empty());

        events.push_changed(SINGLETON_ENTITY, 0);
        let changed = instance.changed(&entities, &events, 1);
        assert_eq!(changed, vec![SINGLETON_ENTITY]);
    }

    #[test]
    fn cache_key_excludes_tracking() {
        let a = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::empty(1), Bitmask::empty(1), Bitmask::from_bits(&[1], 1));
        let b = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::empty(1), Bitmask::empty(1), Bitmask::from_bits(&[2], 1));
        assert_eq!(a.cache_key(), b.cache_key());
    }

    #[test]
    fn overflow_flag_set_when_scan_crosses_ring_wrap() {
        let entities = EntityBuffer::new(16, 1);
        let events = EventBuffer::new(4);
        let def = QueryDef::new(Bitmask::from_bits(&[0], 1), Bitmask::empty(1), Bitmask::empty(1), Bitmask::empty(1));
        let mut instance = QueryInstance::new(def, ReaderId(0), 0);

        for id in 1..=6u32 {
            entities.create(id);
            events.push_added(id);
        }
        instance.added(&entities, &events, 1);
        assert!(instance.overflowed(), "6 pushes into a 4-slot ring must overflow a reader starting at 0");
    }

    #[test]
    fn bitmask_word_and_test_agree() {
        let mask = Bitmask::from_bits(&[0, 35], 2);
        assert!(mask.test(0));
        assert!(mask.test(35));
        assert!(!mask.test(1));
        assert_eq!(mask.word(1) & (1 << 3), 1 << 3);
    }

}
