//! Free-list allocator for entity ids over a shared atomic bitmap.
//!
//! [`Pool`] hands out the lowest free id in `[0, capacity)` and takes ids
//! back. Every operation is lock-free: the bitmap is a `Vec` of `AtomicU32`
//! buckets, one bit per id, and claims are made with compare-and-swap so
//! that concurrent callers on different threads never observe a torn claim.
//! Index 0 is reserved at construction (the data model treats id 0 as
//! "never an entity").

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::EcsError;

const BITS_PER_BUCKET: u32 = 32;

/// Shared, thread-safe bitmap allocator for entity ids.
#[derive(Debug)]
pub struct Pool {
    /// One bit per id; a set bit means "free". Reserved ids (just id 0)
    /// start cleared.
    buckets: Vec<AtomicU32>,
    capacity: u32,
}

impl Pool {
    /// Create a pool over `[0, capacity)`, with id 0 pre-claimed.
    pub fn new(capacity: u32) -> Self {
        let bucket_count = (capacity + BITS_PER_BUCKET - 1) / BITS_PER_BUCKET;
        let buckets: Vec<AtomicU32> = (0..bucket_count).map(|_| AtomicU32::new(u32::MAX)).collect();
        let pool = Self { buckets, capacity };
        // Mask off bits beyond `capacity` in the final bucket so `get()`
        // never hands out an out-of-range id.
        if capacity % BITS_PER_BUCKET != 0 {
            let last = bucket_count as usize - 1;
            let valid_bits = capacity % BITS_PER_BUCKET;
            let mask = (1u32 << valid_bits) - 1;
            pool.buckets[last].store(mask, Ordering::Relaxed);
        }
        // Reserve id 0.
        pool.claim(0);
        pool
    }

    /// Number of 32-bit buckets backing this pool. Exposed for worker
    /// transfer (a worker reconstructs a view over the same shared bytes).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total id capacity (`[0, capacity)`).
    pub fn size(&self) -> u32 {
        self.capacity
    }

    /// Shared handle to the underlying bucket buffer, for handing to a
    /// worker so it can reconstruct a `Pool` view over the same memory.
    pub fn buffer(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    fn claim(&self, id: u32) {
        let bucket = (id / BITS_PER_BUCKET) as usize;
        let bit = id % BITS_PER_BUCKET;
        self.buckets[bucket].fetch_and(!(1u32 << bit), Ordering::AcqRel);
    }

    /// Atomically claim and return the lowest free id.
    pub fn get(&self) -> Result<u32, EcsError> {
        for (bucket_idx, bucket) in self.buckets.iter().enumerate() {
            loop {
                let current = bucket.load(Ordering::Acquire);
                if current == 0 {
                    break;
                }
                let bit = current.trailing_zeros();
                let claimed = current & !(1u32 << bit);
                if bucket
                    .compare_exchange(current, claimed, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(bucket_idx as u32 * BITS_PER_BUCKET + bit);
                }
                // Lost the race to another thread; retry against the fresh value.
            }
        }
        Err(EcsError::PoolExhausted)
    }

    /// Return `id` to the pool.
    ///
    /// Callers must not free an id that is still in use; double-free is
    /// not checked (mirrors the source allocator's contract).
    pub fn free(&self, id: u32) {
        debug_assert!(id < self.capacity, "freed id {id} out of pool range");
        self.claim_set(id);
    }

    fn claim_set(&self, id: u32) {
        let bucket = (id / BITS_PER_BUCKET) as usize;
        let bit = id % BITS_PER_BUCKET;
        self.buckets[bucket].fetch_or(1u32 << bit, Ordering::AcqRel);
    }
}
