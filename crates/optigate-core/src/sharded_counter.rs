//! Sharded atomic counters for request-path statistics.
//!
//! Every rollout decision and cache lookup bumps at least one counter, so the
//! counters are spread over cache-line padded shards to keep concurrent
//! request threads from bouncing a single line. Reads sum all shards; they
//! are eventually consistent, which is all a statistics snapshot needs.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::hash::fnv1a_64;

/// Upper bound on shards per counter.
const MAX_SHARDS: usize = 32;

fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().clamp(1, MAX_SHARDS))
        .unwrap_or(4)
}

/// One atomic slot on its own 128-byte line.
#[repr(align(128))]
#[derive(Debug, Default)]
struct Slot {
    value: AtomicU64,
}

/// Per-thread shard selector, hashed once with FNV-1a.
#[inline]
fn shard_index(shards: usize) -> usize {
    thread_local! {
        static THREAD_HASH: u64 =
            fnv1a_64(format!("{:?}", std::thread::current().id()).as_bytes());
    }
    THREAD_HASH.with(|h| (*h as usize) % shards)
}

/// A monotonically increasing, lock-free counter.
#[derive(Debug)]
pub struct ShardedCounter {
    slots: Box<[Slot]>,
}

impl ShardedCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(default_shard_count())
    }

    /// Counter with an explicit shard count, clamped to `[1, 32]`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        let slots: Vec<Slot> = (0..n.clamp(1, MAX_SHARDS)).map(|_| Slot::default()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        let idx = shard_index(self.slots.len());
        self.slots[idx].value.fetch_add(value, Ordering::Relaxed);
    }

    /// Sum across all shards.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.value.load(Ordering::Relaxed))
            .sum()
    }

    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.value.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ShardedCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Ratio helper shared by the statistics snapshots. Zero denominators read as 0.
#[must_use]
pub fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}
