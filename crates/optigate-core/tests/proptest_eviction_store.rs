//! Property-based tests for the cache eviction store.
//!
//! - `len() <= capacity` after every operation
//! - A full store evicts an expired entry before any live one
//! - With nothing expired, the evicted entry is the least recently used
//! - Entries are visible exactly on `[created, created + ttl)`
//! - Re-inserting a key never evicts

use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use optigate_core::cache::{CacheEntry, EvictionReason, EvictionStore};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Insert { key: u8, ttl_ms: u64 },
    Touch { key: u8 },
    Advance { ms: u64 },
    Purge,
    Remove { key: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (0u8..24, 1u64..5_000).prop_map(|(key, ttl_ms)| Op::Insert { key, ttl_ms }),
        3 => (0u8..24).prop_map(|key| Op::Touch { key }),
        2 => (0u64..3_000).prop_map(|ms| Op::Advance { ms }),
        1 => Just(Op::Purge),
        1 => (0u8..24).prop_map(|key| Op::Remove { key }),
    ]
}

fn entry(key: u8, now: u64, ttl_ms: u64) -> CacheEntry<u8> {
    CacheEntry::new(format!("k{key}"), &[f32::from(key), 1.0], Arc::new(key), now, ttl_ms)
}

// ────────────────────────────────────────────────────────────────────
// Capacity and eviction order
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Capacity holds after every operation in an arbitrary sequence.
    #[test]
    fn prop_capacity_invariant(capacity in 1usize..12, ops in prop::collection::vec(arb_op(), 1..120)) {
        let mut store = EvictionStore::new(capacity);
        let mut now = 0u64;
        for op in ops {
            match op {
                Op::Insert { key, ttl_ms } => {
                    store.insert(entry(key, now, ttl_ms), now);
                }
                Op::Touch { key } => {
                    store.touch(&format!("k{key}"), now);
                }
                Op::Advance { ms } => now += ms,
                Op::Purge => {
                    let purged = store.purge_expired(now);
                    prop_assert!(purged.iter().all(|e| !e.is_live(now)));
                    prop_assert!(store.iter_mru().all(|e| e.is_live(now)));
                }
                Op::Remove { key } => {
                    store.remove(&format!("k{key}"));
                }
            }
            prop_assert!(store.len() <= capacity);
            prop_assert_eq!(store.iter_mru().count(), store.len());
        }
    }

    /// Eviction prefers expired entries; otherwise it takes the LRU tail.
    #[test]
    fn prop_eviction_victim(capacity in 1usize..10, ops in prop::collection::vec(arb_op(), 1..120)) {
        let mut store = EvictionStore::new(capacity);
        let mut now = 0u64;
        for op in ops {
            match op {
                Op::Insert { key, ttl_ms } => {
                    let full_and_new = store.len() == capacity && !store.contains_key(&format!("k{key}"));
                    let any_expired = store.iter_mru().any(|e| !e.is_live(now));
                    let lru = store.lru_key().map(str::to_string);
                    let evicted = store.insert(entry(key, now, ttl_ms), now);
                    prop_assert_eq!(evicted.is_some(), full_and_new);
                    if let Some(ev) = evicted {
                        if any_expired {
                            prop_assert_eq!(ev.reason, EvictionReason::Expired);
                            prop_assert!(!ev.entry.is_live(now));
                        } else {
                            prop_assert_eq!(ev.reason, EvictionReason::LeastRecentlyUsed);
                            prop_assert_eq!(Some(ev.entry.key.clone()), lru);
                        }
                    }
                }
                Op::Touch { key } => {
                    store.touch(&format!("k{key}"), now);
                }
                Op::Advance { ms } => now += ms,
                Op::Purge => {
                    store.purge_expired(now);
                }
                Op::Remove { key } => {
                    store.remove(&format!("k{key}"));
                }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────
// TTL visibility
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// An entry is visible at every instant of `[t0, t0 + ttl)` and at none after.
    #[test]
    fn prop_ttl_window(t0 in 0u64..1_000_000, ttl in 1u64..100_000, probe in 0u64..200_000) {
        let mut store = EvictionStore::new(4);
        store.insert(entry(1, t0, ttl), t0);
        let at = t0 + probe;
        let visible = store.touch("k1", at).is_some();
        prop_assert_eq!(visible, probe < ttl);
        prop_assert_eq!(store.live_len(at), usize::from(probe < ttl));
    }

    /// Re-inserting keys that are already present never evicts.
    #[test]
    fn prop_reinsert_never_evicts(keys in prop::collection::vec(0u8..6, 1..40)) {
        let distinct: HashSet<u8> = keys.iter().copied().collect();
        let mut store = EvictionStore::new(distinct.len());
        for &k in &distinct {
            prop_assert!(store.insert(entry(k, 0, 1_000), 0).is_none());
        }
        for (i, &k) in keys.iter().enumerate() {
            let now = i as u64;
            prop_assert!(store.insert(entry(k, now, 1_000), now).is_none());
        }
        prop_assert_eq!(store.len(), distinct.len());
    }
}
