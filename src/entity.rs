//! Entity identity, liveness, generation, and component membership.
//!
//! Entities are bare integer ids in `[0, max_entities)` (id 0 is reserved
//! as "never an entity"). [`EntityBuffer`] is the single shared structure
//! that tracks, per id: whether it is currently live, its generation (a
//! wrapping 7-bit counter bumped on reclamation), and which components it
//! carries, packed as a dense bitmap.

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::query::QueryMasks;

/// Generation counter wraps at 7 bits, matching the packed `Ref` layout
/// (ยง4/ยง6), which reserves the high 7 bits of a 32-bit word for it.
pub const GENERATION_BITS: u32 = 7;
const GENERATION_MASK: u8 = (1 << GENERATION_BITS) - 1;

/// Sentinel entity id used for singleton component events (ยง3, ยง4.9).
pub const SINGLETON_ENTITY: u32 = u32::MAX;

const BITS_PER_WORD: u32 = 32;

/// Shared, thread-aware entity liveness/generation/membership table.
#[derive(Debug)]
pub struct EntityBuffer {
    max_entities: u32,
    component_count: u32,
    words_per_entity: u32,
    /// One bit per entity; 1 == live.
    liveness: Vec<AtomicU32>,
    /// One byte per entity; low 7 bits are the generation.
    generations: Vec<AtomicU8>,
    /// `words_per_entity` words per entity, `component_count` bits used.
    membership: Vec<AtomicU32>,
}

impl EntityBuffer {
    /// Construct a buffer sized for `max_entities` ids and
    /// `component_count` distinct component ids.
    pub fn new(max_entities: u32, component_count: u32) -> Self {
        let liveness_words = (max_entities + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let words_per_entity = (component_count + BITS_PER_WORD - 1) / BITS_PER_WORD.max(1);
        let words_per_entity = words_per_entity.max(1);
        Self {
            max_entities,
            component_count,
            words_per_entity,
            liveness: (0..liveness_words).map(|_| AtomicU32::new(0)).collect(),
            generations: (0..max_entities).map(|_| AtomicU8::new(0)).collect(),
            membership: (0..max_entities * words_per_entity)
                .map(|_| AtomicU32::new(0))
                .collect(),
        }
    }

    /// Mark `id` live, reset its membership bitmap, and bump its
    /// generation if the slot was ever live before.
    pub fn create(&self, id: u32) {
        self.set_live(id, true);
        self.clear_membership(id);
    }

    /// Clear liveness only; generation and component bits are preserved
    /// so that post-removal readers (e.g. a lagging `removed()` consumer)
    /// can still see what the entity had.
    pub fn mark_dead(&self, id: u32) {
        self.set_live(id, false);
        let idx = id as usize;
        let gen = self.generations[idx].load(Ordering::Relaxed);
        self.generations[idx].store((gen + 1) & GENERATION_MASK, Ordering::Release);
    }

    /// Wipe liveness, generation is left as bumped by `mark_dead`, and
    /// membership bits are cleared. Invoked only by `World` reclamation.
    pub fn delete(&self, id: u32) {
        self.set_live(id, false);
        self.clear_membership(id);
    }

    fn set_live(&self, id: u32, live: bool) {
        let word = (id / BITS_PER_WORD) as usize;
        let bit = id % BITS_PER_WORD;
        if live {
            self.liveness[word].fetch_or(1 << bit, Ordering::AcqRel);
        } else {
            self.liveness[word].fetch_and(!(1 << bit), Ordering::AcqRel);
        }
    }

    fn clear_membership(&self, id: u32) {
        let base = id as usize * self.words_per_entity as usize;
        for w in 0..self.words_per_entity as usize {
            self.membership[base + w].store(0, Ordering::Release);
        }
    }

    /// Whether `id` is currently live.
    pub fn has(&self, id: u32) -> bool {
        if id >= self.max_entities {
            return false;
        }
        let word = (id / BITS_PER_WORD) as usize;
        let bit = id % BITS_PER_WORD;
        self.liveness[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Current generation for `id`, in `[0, 128)`.
    pub fn generation(&self, id: u32) -> u8 {
        self.generations[id as usize].load(Ordering::Acquire)
    }

    /// Set `component_id`'s membership bit for `id`.
    pub fn add_component_to_entity(&self, id: u32, component_id: u32) {
        self.set_component_bit(id, component_id, true);
    }

    /// Clear `component_id`'s membership bit for `id`.
    pub fn remove_component_from_entity(&self, id: u32, component_id: u32) {
        self.set_component_bit(id, component_id, false);
    }

    fn set_component_bit(&self, id: u32, component_id: u32, set: bool) {
        let base = id as usize * self.words_per_entity as usize;
        let word = base + (component_id / BITS_PER_WORD) as usize;
        let bit = component_id % BITS_PER_WORD;
        if set {
            self.membership[word].fetch_or(1 << bit, Ordering::AcqRel);
        } else {
            self.membership[word].fetch_and(!(1 << bit), Ordering::AcqRel);
        }
    }

    /// Whether `id` currently carries `component_id`.
    pub fn has_component(&self, id: u32, component_id: u32) -> bool {
        let base = id as usize * self.words_per_entity as usize;
        let word = base + (component_id / BITS_PER_WORD) as usize;
        let bit = component_id % BITS_PER_WORD;
        self.membership[word].load(Ordering::Acquire) & (1 << bit) != 0
    }

    /// Evaluate the four query masks against `id`'s membership bitmap.
    pub fn matches(&self, id: u32, masks: &QueryMasks) -> bool {
        if !self.has(id) {
            return false;
        }
        let base = id as usize * self.words_per_entity as usize;
        let mut any_overlap = masks.any.is_empty();
        for w in 0..self.words_per_entity as usize {
            let bits = self.membership[base + w].load(Ordering::Acquire);
            let with = masks.with.word(w);
            let without = masks.without.word(w);
            let any = masks.any.word(w);
            if bits & with != with {
                return false;
            }
            if bits & without != 0 {
                return false;
            }
            if any != 0 && bits & any != 0 {
                any_overlap = true;
            }
        }
        any_overlap
    }

    /// Iterate the component ids currently set for `id`.
    pub fn component_ids(&self, id: u32) -> Vec<u32> {
        let base = id as usize * self.words_per_entity as usize;
        let mut out = Vec::new();
        for w in 0..self.words_per_entity as usize {
            let mut bits = self.membership[base + w].load(Ordering::Acquire);
            while bits != 0 {
                let bit = bits.trailing_zeros();
                out.push(w as u32 * BITS_PER_WORD + bit);
                bits &= bits - 1;
            }
        }
        out
    }

    pub(crate) fn words_per_entity(&self) -> u32 {
        self.words_per_entity
    }

    pub(crate) fn max_entities(&self) -> u32 {
        self.max_entities
    }

    pub(crate) fn component_count(&self) -> u32 {
        self.component_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Bitmask;

    fn masks(with: &[u32], without: &[u32], any: &[u32], word_count: u32) -> QueryMasks {
        QueryMasks {
            with: Bitmask::from_bits(with, word_count),
            without: Bitmask::from_bits(without, word_count),
            any: Bitmask::from_bits(any, word_count),
        }
    }

    #[test]
    fn create_then_has() {
        let buf = EntityBuffer::new(16, 4);
        buf.create(3);
        assert!(buf.has(3));
        assert!(!buf.has(4));
    }

    #[test]
    fn mark_dead_preserves_membership_but_not_liveness() {
        let buf = EntityBuffer::new(16, 4);
        buf.create(3);
        buf.add_component_to_entity(3, 1);
        buf.mark_dead(3);
        assert!(!buf.has(3));
        assert!(buf.has_component(3, 1), "membership preserved post-removal");
    }

    #[test]
    fn delete_wipes_membership() {
        let buf = EntityBuffer::new(16, 4);
        buf.create(3);
        buf.add_component_to_entity(3, 1);
        buf.mark_dead(3);
        buf.delete(3);
        assert!(!buf.has_component(3, 1));
    }

    #[test]
    fn generation_wraps_at_128() {
        let buf = EntityBuffer::new(4, 1);
        for _ in 0..130 {
            buf.create(1);
            buf.mark_dead(1);
        }
        assert!(buf.generation(1) < 128);
    }

    #[test]
    fn matches_with_without_any() {
        let buf = EntityBuffer::new(8, 3);
        buf.create(1);
        buf.add_component_to_entity(1, 0); // P
        buf.add_component_to_entity(1, 1); // V
        let m = masks(&[0], &[2], &[], 1);
        assert!(buf.matches(1, &m));
        buf.add_component_to_entity(1, 2); // F
        assert!(!buf.matches(1, &m), "F is in `without`");
    }

    #[test]
    fn matches_any_empty_means_skip() {
        let buf = EntityBuffer::new(8, 3);
        buf.create(1);
        buf.add_component_to_entity(1, 0);
        let m = masks(&[0], &[], &[], 1);
        assert!(buf.matches(1, &m));
    }

    #[test]
    fn matches_any_requires_overlap() {
        let buf = EntityBuffer::new(8, 3);
        buf.create(1);
        buf.add_component_to_entity(1, 0);
        let m = masks(&[0], &[], &[1, 2], 1);
        assert!(!buf.matches(1, &m));
        buf.add_component_to_entity(1, 1);
        assert!(buf.matches(1, &m));
    }

    #[test]
    fn component_ids_lists_set_bits() {
        let buf = EntityBuffer::new(8, 40);
        buf.create(1);
        buf.add_component_to_entity(1, 0);
        buf.add_component_to_entity(1, 35);
        let mut ids = buf.component_ids(1);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 35]);
    }

    #[test]
    fn dead_entity_never_matches() {
        let buf = EntityBuffer::new(8, 2);
        buf.create(1);
        buf.add_component_to_entity(1, 0);
        buf.mark_dead(1);
        let m = masks(&[0], &[], &[], 1);
        assert!(!buf.matches(1, &m));
    }
}
