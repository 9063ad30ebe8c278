//! Bounded entry store with LRU capacity eviction and absolute TTL expiry.
//!
//! Entries live in a `Vec<Node>` arena linked into a doubly-linked recency
//! list (head = most recent, tail = least recent); a `HashMap` maps keys to
//! arena slots. A second index, ordered by `(expires_at, seq)`, serves the TTL
//! sweep and picks expired eviction victims without scanning.
//!
//! # Eviction rule
//! Inserting a *new* key while `len() == capacity` removes exactly one entry:
//! the entry with the earliest expiry if it has already expired, otherwise the
//! least-recently-used entry. Re-inserting an existing key replaces it in
//! place and never evicts.
//!
//! The store is not synchronized; [`SemanticCache`](super::SemanticCache)
//! wraps it in a single mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const SENTINEL: usize = usize::MAX;

/// A cached answer. Never mutated after insertion.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub key: String,
    pub embedding: Vec<f32>,
    pub value: Arc<V>,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
    /// Insertion sequence number, assigned by the store.
    pub seq: u64,
}

impl<V> CacheEntry<V> {
    /// `seq` is assigned when the entry is inserted.
    pub fn new(
        key: impl Into<String>,
        embedding: &[f32],
        value: Arc<V>,
        created_at_ms: u64,
        ttl_ms: u64,
    ) -> Self {
        Self {
            key: key.into(),
            embedding: embedding.to_vec(),
            value,
            created_at_ms,
            ttl_ms,
            seq: 0,
        }
    }

    #[must_use]
    pub fn expires_at_ms(&self) -> u64 {
        self.created_at_ms.saturating_add(self.ttl_ms)
    }

    /// Visible iff `now < created_at + ttl`.
    #[must_use]
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms()
    }
}

/// Why an entry left the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Capacity eviction of an entry that had already expired.
    Expired,
    /// Capacity eviction of the least-recently-used live entry.
    LeastRecentlyUsed,
}

/// An entry removed to make room for an insertion.
#[derive(Debug)]
pub struct Eviction<V> {
    pub entry: CacheEntry<V>,
    pub reason: EvictionReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub insertions: u64,
    pub replacements: u64,
    pub evictions: u64,
    pub expired_evictions: u64,
    pub expirations: u64,
    pub removals: u64,
}

#[derive(Debug)]
struct Node<V> {
    entry: Option<CacheEntry<V>>,
    prev: usize,
    next: usize,
}

pub struct EvictionStore<V> {
    capacity: usize,
    map: HashMap<String, usize>,
    arena: Vec<Node<V>>,
    head: usize,
    tail: usize,
    free_head: usize,
    /// (expires_at_ms, seq) → arena index.
    expiry: BTreeMap<(u64, u64), usize>,
    next_seq: u64,
    stats: StoreStats,
}

impl<V> std::fmt::Debug for EvictionStore<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionStore")
            .field("capacity", &self.capacity)
            .field("len", &self.map.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl<V> EvictionStore<V> {
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "EvictionStore capacity must be > 0");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            arena: Vec::with_capacity(capacity),
            head: SENTINEL,
            tail: SENTINEL,
            free_head: SENTINEL,
            expiry: BTreeMap::new(),
            next_seq: 1,
            stats: StoreStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Physical size, including expired entries not yet swept.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of entries visible at `now_ms`.
    pub fn live_len(&self, now_ms: u64) -> usize {
        self.map.len() - self.expiry.range(..(now_ms.saturating_add(1), 0)).count()
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Insert `entry`, assigning it the next sequence number and making it the
    /// most recently used. Returns the entry evicted to make room, if any.
    pub fn insert(&mut self, mut entry: CacheEntry<V>, now_ms: u64) -> Option<Eviction<V>> {
        entry.seq = self.next_seq;
        self.next_seq += 1;

        if let Some(&idx) = self.map.get(&entry.key) {
            if let Some(old) = self.arena[idx].entry.as_ref() {
                self.expiry.remove(&(old.expires_at_ms(), old.seq));
            }
            self.expiry.insert((entry.expires_at_ms(), entry.seq), idx);
            self.arena[idx].entry = Some(entry);
            self.move_to_head(idx);
            self.stats.replacements += 1;
            return None;
        }

        let evicted = if self.map.len() >= self.capacity {
            self.evict_one(now_ms)
        } else {
            None
        };

        let key = entry.key.clone();
        let expiry_key = (entry.expires_at_ms(), entry.seq);
        let idx = self.alloc_slot(entry);
        self.push_head(idx);
        self.map.insert(key, idx);
        self.expiry.insert(expiry_key, idx);
        self.stats.insertions += 1;

        evicted
    }

    /// Live entry for `key`, promoted to most recently used.
    pub fn touch(&mut self, key: &str, now_ms: u64) -> Option<&CacheEntry<V>> {
        let idx = *self.map.get(key)?;
        if !self.arena[idx].entry.as_ref()?.is_live(now_ms) {
            return None;
        }
        self.move_to_head(idx);
        self.arena[idx].entry.as_ref()
    }

    /// Entry for `key` without a recency change, expired or not.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.map
            .get(key)
            .and_then(|&idx| self.arena[idx].entry.as_ref())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let idx = self.map.remove(key)?;
        let entry = self.release(idx);
        if entry.is_some() {
            self.stats.removals += 1;
        }
        entry
    }

    /// Visible entries, most recently used first.
    pub fn iter_live(&self, now_ms: u64) -> impl Iterator<Item = &CacheEntry<V>> {
        self.iter_mru().filter(move |e| e.is_live(now_ms))
    }

    /// All entries, most recently used first.
    pub fn iter_mru(&self) -> MruIter<'_, V> {
        MruIter {
            arena: &self.arena,
            current: self.head,
            remaining: self.map.len(),
        }
    }

    /// Key of the least recently used entry.
    pub fn lru_key(&self) -> Option<&str> {
        if self.tail == SENTINEL {
            return None;
        }
        self.arena[self.tail]
            .entry
            .as_ref()
            .map(|e| e.key.as_str())
    }

    /// Physically remove every entry that has expired at `now_ms`.
    pub fn purge_expired(&mut self, now_ms: u64) -> Vec<CacheEntry<V>> {
        let mut purged = Vec::new();
        while let Some((&(expires_at, _), &idx)) = self.expiry.first_key_value() {
            if expires_at > now_ms {
                break;
            }
            let Some(key) = self.arena[idx].entry.as_ref().map(|e| e.key.clone()) else {
                break;
            };
            self.map.remove(&key);
            if let Some(entry) = self.release(idx) {
                purged.push(entry);
            }
        }
        self.stats.expirations += purged.len() as u64;
        purged
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.arena.clear();
        self.expiry.clear();
        self.head = SENTINEL;
        self.tail = SENTINEL;
        self.free_head = SENTINEL;
    }

    // --- internal ---

    fn evict_one(&mut self, now_ms: u64) -> Option<Eviction<V>> {
        let (idx, reason) = match self.expiry.first_key_value() {
            Some((&(expires_at, _), &idx)) if expires_at <= now_ms => (idx, EvictionReason::Expired),
            _ if self.tail != SENTINEL => (self.tail, EvictionReason::LeastRecentlyUsed),
            _ => return None,
        };
        let key = self.arena[idx].entry.as_ref()?.key.clone();
        self.map.remove(&key);
        let entry = self.release(idx)?;
        self.stats.evictions += 1;
        if reason == EvictionReason::Expired {
            self.stats.expired_evictions += 1;
        }
        Some(Eviction { entry, reason })
    }

    /// Unlink `idx`, drop it from the expiry index and recycle the slot.
    /// The caller has already removed the key from `map`.
    fn release(&mut self, idx: usize) -> Option<CacheEntry<V>> {
        self.unlink(idx);
        let entry = self.arena[idx].entry.take();
        if let Some(e) = entry.as_ref() {
            self.expiry.remove(&(e.expires_at_ms(), e.seq));
        }
        self.arena[idx].next = self.free_head;
        self.free_head = idx;
        entry
    }

    fn alloc_slot(&mut self, entry: CacheEntry<V>) -> usize {
        let node = Node {
            entry: Some(entry),
            prev: SENTINEL,
            next: SENTINEL,
        };
        if self.free_head != SENTINEL {
            let idx = self.free_head;
            self.free_head = self.arena[idx].next;
            self.arena[idx] = node;
            idx
        } else {
            self.arena.push(node);
            self.arena.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.arena[idx].prev;
        let next = self.arena[idx].next;

        if prev != SENTINEL {
            self.arena[prev].next = next;
        } else {
            self.head = next;
        }

        if next != SENTINEL {
            self.arena[next].prev = prev;
        } else {
            self.tail = prev;
        }

        self.arena[idx].prev = SENTINEL;
        self.arena[idx].next = SENTINEL;
    }

    fn push_head(&mut self, idx: usize) {
        self.arena[idx].prev = SENTINEL;
        self.arena[idx].next = self.head;

        if self.head != SENTINEL {
            self.arena[self.head].prev = idx;
        }
        self.head = idx;

        if self.tail == SENTINEL {
            self.tail = idx;
        }
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_head(idx);
    }
}

/// Iterator from most-recently used to least-recently used.
pub struct MruIter<'a, V> {
    arena: &'a [Node<V>],
    current: usize,
    remaining: usize,
}

impl<'a, V> Iterator for MruIter<'a, V> {
    type Item = &'a CacheEntry<V>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == SENTINEL || self.remaining == 0 {
            return None;
        }
        let node = &self.arena[self.current];
        self.current = node.next;
        self.remaining -= 1;
        node.entry.as_ref()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, created_at_ms: u64, ttl_ms: u64) -> CacheEntry<&'static str> {
        CacheEntry::new(key, &[1.0, 0.0], Arc::new("answer"), created_at_ms, ttl_ms)
    }

    fn keys_mru(store: &EvictionStore<&'static str>) -> Vec<String> {
        store.iter_mru().map(|e| e.key.clone()).collect()
    }

    #[test]
    fn insert_and_touch() {
        let mut store = EvictionStore::new(3);
        assert!(store.insert(entry("a", 0, 1_000), 0).is_none());
        assert!(store.insert(entry("b", 0, 1_000), 0).is_none());
        assert_eq!(store.len(), 2);
        assert_eq!(store.touch("a", 10).unwrap().key, "a");
        assert_eq!(keys_mru(&store), vec!["a", "b"]);
    }

    #[test]
    fn evicts_lru_when_full() {
        let mut store = EvictionStore::new(2);
        store.insert(entry("a", 0, 10_000), 0);
        store.insert(entry("b", 0, 10_000), 0);
        store.touch("a", 1);

        let evicted = store.insert(entry("c", 2, 10_000), 2).unwrap();
        assert_eq!(evicted.entry.key, "b");
        assert_eq!(evicted.reason, EvictionReason::LeastRecentlyUsed);
        assert_eq!(store.len(), 2);
        assert!(!store.contains_key("b"));
    }

    #[test]
    fn prefers_expired_victim_over_lru() {
        let mut store = EvictionStore::new(3);
        store.insert(entry("old", 0, 10_000), 0);
        store.insert(entry("short", 0, 100), 0);
        store.insert(entry("fresh", 0, 10_000), 0);
        // "old" is LRU but "short" has expired.
        store.touch("short", 50);

        let evicted = store.insert(entry("new", 200, 10_000), 200).unwrap();
        assert_eq!(evicted.entry.key, "short");
        assert_eq!(evicted.reason, EvictionReason::Expired);
        assert!(store.contains_key("old"));
        assert_eq!(store.stats().expired_evictions, 1);
    }

    #[test]
    fn replacing_existing_key_never_evicts() {
        let mut store = EvictionStore::new(2);
        store.insert(entry("a", 0, 1_000), 0);
        store.insert(entry("b", 0, 1_000), 0);
        assert!(store.insert(entry("a", 5, 1_000), 5).is_none());
        assert_eq!(store.len(), 2);
        assert_eq!(keys_mru(&store), vec!["a", "b"]);
        assert_eq!(store.peek("a").unwrap().created_at_ms, 5);
        assert_eq!(store.stats().replacements, 1);
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut store = EvictionStore::new(4);
        store.insert(entry("a", 0, 1_000), 0);
        store.insert(entry("b", 0, 1_000), 0);
        assert!(store.peek("b").unwrap().seq > store.peek("a").unwrap().seq);
    }

    #[test]
    fn ttl_boundary_is_exclusive() {
        let mut store = EvictionStore::new(2);
        store.insert(entry("a", 1_000, 500), 1_000);
        assert!(store.touch("a", 1_000).is_some());
        assert!(store.touch("a", 1_499).is_some());
        assert!(store.touch("a", 1_500).is_none());
        assert_eq!(store.live_len(1_499), 1);
        assert_eq!(store.live_len(1_500), 0);
    }

    #[test]
    fn purge_expired_removes_only_expired() {
        let mut store = EvictionStore::new(4);
        store.insert(entry("a", 0, 100), 0);
        store.insert(entry("b", 0, 200), 0);
        store.insert(entry("c", 0, 300), 0);

        let purged = store.purge_expired(200);
        let keys: Vec<_> = purged.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(store.len(), 1);
        assert!(store.contains_key("c"));
        assert_eq!(store.stats().expirations, 2);
    }

    #[test]
    fn remove_and_slot_reuse() {
        let mut store = EvictionStore::new(2);
        store.insert(entry("a", 0, 1_000), 0);
        assert!(store.remove("a").is_some());
        assert!(store.remove("a").is_none());
        store.insert(entry("b", 0, 1_000), 0);
        store.insert(entry("c", 0, 1_000), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.arena.len(), 2);
    }

    #[test]
    fn iter_live_skips_expired() {
        let mut store = EvictionStore::new(3);
        store.insert(entry("a", 0, 100), 0);
        store.insert(entry("b", 0, 1_000), 0);
        let live: Vec<_> = store.iter_live(500).map(|e| e.key.as_str()).collect();
        assert_eq!(live, vec!["b"]);
    }

    #[test]
    fn lru_key_tracks_tail() {
        let mut store = EvictionStore::new(3);
        assert!(store.lru_key().is_none());
        store.insert(entry("a", 0, 1_000), 0);
        store.insert(entry("b", 0, 1_000), 0);
        assert_eq!(store.lru_key(), Some("a"));
        store.touch("a", 1);
        assert_eq!(store.lru_key(), Some("b"));
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = EvictionStore::new(2);
        store.insert(entry("a", 0, 1_000), 0);
        store.clear();
        assert!(store.is_empty());
        assert!(store.lru_key().is_none());
        assert!(store.purge_expired(u64::MAX).is_empty());
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = EvictionStore::<()>::new(0);
    }

    #[test]
    fn capacity_one_churn() {
        let mut store = EvictionStore::new(1);
        for i in 0..50u64 {
            store.insert(entry(&format!("k{i}"), i, 1_000), i);
            assert_eq!(store.len(), 1);
        }
        assert_eq!(store.stats().evictions, 49);
    }
}
