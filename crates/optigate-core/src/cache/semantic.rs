//! Similarity-keyed answer cache.
//!
//! A lookup embeds the query, scans every live entry for the highest cosine
//! similarity, and returns that entry's value when the similarity reaches the
//! configured threshold. Ties go to the most recently inserted entry. Embedding
//! trouble (error, panic, timeout, malformed vector) turns the lookup into a
//! degraded miss; nothing on the request path returns an error.
//!
//! With a backing store attached, every change to the entry set is mirrored
//! to it. The async entry points run that I/O on Tokio's blocking pool; the
//! synchronous ones run it on the calling thread.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::backend::BackingStore;
use super::store::{CacheEntry, Eviction, EvictionStore};
use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::{ConfigError, StoreError};
use crate::hash::embedding_key;
use crate::sharded_counter::{ShardedCounter, ratio};
use crate::similarity::{
    DegradedReason, Embedder, SimilarityIndex, cosine_similarity, validate_embedding,
};

/// Outcome of [`SemanticCache::get`].
#[derive(Debug, Clone)]
pub enum Lookup<V> {
    Hit {
        value: Arc<V>,
        similarity: f32,
        key: String,
    },
    /// No live entry reached the threshold. `best_similarity` is the closest
    /// candidate, if any entry was comparable.
    Miss { best_similarity: Option<f32> },
    /// The query could not be embedded; treated as a miss.
    Degraded { reason: DegradedReason },
}

impl<V> Lookup<V> {
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. })
    }

    #[must_use]
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    #[must_use]
    pub fn value(&self) -> Option<&Arc<V>> {
        match self {
            Self::Hit { value, .. } => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_value(self) -> Option<Arc<V>> {
        match self {
            Self::Hit { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Similarity of the returned entry on a hit, or of the best candidate on
    /// a plain miss.
    #[must_use]
    pub fn similarity(&self) -> Option<f32> {
        match self {
            Self::Hit { similarity, .. } => Some(*similarity),
            Self::Miss { best_similarity } => *best_similarity,
            Self::Degraded { .. } => None,
        }
    }
}

/// Serialized form written to the backing store.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<V> {
    embedding: Vec<f32>,
    value: V,
    created_at_ms: u64,
    ttl_ms: u64,
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub similarity_threshold: f32,
    pub hits: u64,
    /// Includes degraded lookups.
    pub misses: u64,
    pub degraded: u64,
    pub false_positives: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub store_errors: u64,
    /// `hits / (hits + misses)`, 0 when there were no lookups.
    pub hit_rate: f64,
    /// `false_positives / hits`, 0 when there were no hits.
    pub false_positive_rate: f64,
}

#[derive(Debug, Default)]
struct CacheCounters {
    hits: ShardedCounter,
    misses: ShardedCounter,
    degraded: ShardedCounter,
    false_positives: ShardedCounter,
    store_errors: ShardedCounter,
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// An attached backing store.
#[derive(Debug)]
struct Persistence {
    backend: Arc<dyn BackingStore>,
    key_prefix: String,
    /// Held from an in-process mutation until the backend has seen it, so rows
    /// are written and deleted in the order entries enter and leave.
    gate: Mutex<()>,
}

impl Persistence {
    fn row_key(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }

    fn lock_gate(&self) -> MutexGuard<'_, ()> {
        match self.gate.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// The half of the cache that changes the entry set. Every field is shared,
/// so a clone can carry write-through work onto the blocking pool.
struct CacheWriter<V> {
    store: Arc<Mutex<EvictionStore<V>>>,
    counters: Arc<CacheCounters>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    persistence: Option<Arc<Persistence>>,
}

impl<V> Clone for CacheWriter<V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            clock: Arc::clone(&self.clock),
            ttl: self.ttl,
            persistence: self.persistence.clone(),
        }
    }
}

impl<V> CacheWriter<V> {
    fn lock_store(&self) -> MutexGuard<'_, EvictionStore<V>> {
        match self.store.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn gate(&self) -> Option<MutexGuard<'_, ()>> {
        self.persistence.as_deref().map(Persistence::lock_gate)
    }

    /// Insert `entry`, write `blob` as its row and delete the row of whatever
    /// it evicted. `blob` is `None` when the row is already in the backend.
    fn insert(
        &self,
        entry: CacheEntry<V>,
        now: u64,
        blob: Option<Result<Vec<u8>, StoreError>>,
    ) -> Option<Eviction<V>> {
        let _gate = self.gate();
        let row_key = self.persistence.as_ref().map(|p| p.row_key(&entry.key));
        let evicted = self.lock_store().insert(entry, now);

        if let Some(p) = &self.persistence {
            if let (Some(row_key), Some(blob)) = (row_key, blob) {
                let written = blob.and_then(|b| p.backend.set_with_ttl(&row_key, &b, self.ttl));
                self.note_store_result("write", written);
            }
            if let Some(eviction) = &evicted {
                let deleted = p.backend.delete(&p.row_key(&eviction.entry.key));
                self.note_store_result("delete", deleted);
            }
        }
        evicted
    }

    fn purge_expired(&self) -> usize {
        let _gate = self.gate();
        let purged = self.lock_store().purge_expired(self.clock.now_ms());
        if let Some(p) = &self.persistence {
            for entry in &purged {
                let deleted = p.backend.delete(&p.row_key(&entry.key));
                self.note_store_result("delete", deleted);
            }
        }
        purged.len()
    }

    fn clear(&self) {
        let _gate = self.gate();
        self.lock_store().clear();
        if let Some(p) = &self.persistence {
            match p.backend.keys(&p.key_prefix) {
                Ok(keys) => {
                    for key in keys {
                        let deleted = p.backend.delete(&key);
                        self.note_store_result("delete", deleted);
                    }
                }
                Err(e) => self.note_store_result::<()>("list", Err(e)),
            }
        }
        info!("semantic cache cleared");
    }

    fn note_store_result<T>(&self, op: &'static str, result: Result<T, StoreError>) {
        if let Err(e) = result {
            self.counters.store_errors.increment();
            let n = self.counters.store_errors.get();
            if n == 1 {
                warn!(op, error = %e, "backing store operation failed");
            } else {
                debug!(op, error = %e, "backing store operation failed");
            }
        }
    }
}

impl<V: Serialize> CacheWriter<V> {
    fn put_embedding(&self, embedding: &[f32], value: V) -> Option<String> {
        if validate_embedding(embedding).is_err() {
            return None;
        }
        let key = embedding_key(embedding);
        let now = self.clock.now_ms();
        let ttl_ms = duration_ms(self.ttl);

        let blob = self.persistence.as_ref().map(|_| {
            let persisted = PersistedEntry {
                embedding: embedding.to_vec(),
                value: &value,
                created_at_ms: now,
                ttl_ms,
            };
            serde_json::to_vec(&persisted).map_err(StoreError::from)
        });
        let entry = CacheEntry::new(key.clone(), embedding, Arc::new(value), now, ttl_ms);

        if let Some(eviction) = self.insert(entry, now, blob) {
            debug!(reason = ?eviction.reason, "semantic cache evicted entry");
        }
        Some(key)
    }
}

impl<V: DeserializeOwned> CacheWriter<V> {
    fn warm_from_store(&self) -> Result<usize, StoreError> {
        let Some(p) = &self.persistence else {
            return Ok(0);
        };
        let keys = p.backend.keys(&p.key_prefix)?;
        let now = self.clock.now_ms();

        let mut entries = Vec::with_capacity(keys.len());
        for row_key in keys {
            let blob = match p.backend.get(&row_key) {
                Ok(Some(blob)) => blob,
                Ok(None) => continue,
                Err(e) => {
                    self.note_store_result::<()>("read", Err(e));
                    continue;
                }
            };
            let persisted: PersistedEntry<V> = match serde_json::from_slice(&blob) {
                Ok(p) => p,
                Err(e) => {
                    self.note_store_result::<()>("decode", Err(e.into()));
                    continue;
                }
            };
            if validate_embedding(&persisted.embedding).is_err() {
                continue;
            }
            let key = row_key
                .strip_prefix(&p.key_prefix)
                .map_or_else(|| embedding_key(&persisted.embedding), str::to_string);
            let entry = CacheEntry::new(
                key,
                &persisted.embedding,
                Arc::new(persisted.value),
                persisted.created_at_ms,
                persisted.ttl_ms,
            );
            if entry.is_live(now) {
                entries.push(entry);
            }
        }

        // oldest first, so overflow evicts the oldest rows
        entries.sort_by_key(|e| e.created_at_ms);
        let read = entries.len();
        let mut evicted = 0usize;
        for entry in entries {
            if self.insert(entry, now, None).is_some() {
                evicted += 1;
            }
        }
        let loaded = read.saturating_sub(evicted);

        info!(
            loaded,
            evicted,
            backend = p.backend.name(),
            "semantic cache warmed from store"
        );
        Ok(loaded)
    }
}

/// Thread-safe semantic cache over values of type `V`.
pub struct SemanticCache<V> {
    index: SimilarityIndex,
    threshold: f32,
    writer: CacheWriter<V>,
}

impl<V> std::fmt::Debug for SemanticCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemanticCache")
            .field("index", &self.index)
            .field("threshold", &self.threshold)
            .field("ttl", &self.writer.ttl)
            .field(
                "backend",
                &self.writer.persistence.as_ref().map(|p| p.backend.name()),
            )
            .finish_non_exhaustive()
    }
}

impl<V> SemanticCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        config: &CacheConfig,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            index: SimilarityIndex::new(embedder, config.embed_timeout()),
            threshold: config.similarity_threshold,
            writer: CacheWriter {
                store: Arc::new(Mutex::new(EvictionStore::new(config.capacity))),
                counters: Arc::default(),
                clock,
                ttl: config.ttl(),
                persistence: None,
            },
        })
    }

    /// Attach a durable store. Every later change to the entry set is
    /// mirrored to it under `key_prefix`.
    #[must_use]
    pub fn with_backend(
        mut self,
        backend: Arc<dyn BackingStore>,
        key_prefix: impl Into<String>,
    ) -> Self {
        self.writer.persistence = Some(Arc::new(Persistence {
            backend,
            key_prefix: key_prefix.into(),
            gate: Mutex::new(()),
        }));
        self
    }

    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.writer.ttl
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.writer.lock_store().capacity()
    }

    /// Entries currently held, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.writer.lock_store().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn has_backend(&self) -> bool {
        self.writer.persistence.is_some()
    }

    /// Look up the closest cached answer for `query`.
    pub async fn get(&self, query: &str) -> Lookup<V> {
        match self.index.embed(query).await {
            Ok(embedding) => self.lookup_embedding(&embedding),
            Err(reason) => {
                self.writer.counters.degraded.increment();
                self.writer.counters.misses.increment();
                debug!(%reason, "semantic cache lookup degraded to miss");
                Lookup::Degraded { reason }
            }
        }
    }

    /// Look up with an embedding the caller already has.
    pub fn lookup_embedding(&self, embedding: &[f32]) -> Lookup<V> {
        let counters = &self.writer.counters;
        if let Err(reason) = validate_embedding(embedding) {
            counters.degraded.increment();
            counters.misses.increment();
            return Lookup::Degraded { reason };
        }

        let now = self.writer.clock.now_ms();
        let mut store = self.writer.lock_store();

        let mut best: Option<(f32, u64, String)> = None;
        for entry in store.iter_live(now) {
            let Some(sim) = cosine_similarity(embedding, &entry.embedding) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((best_sim, best_seq, _)) => {
                    sim > *best_sim || (sim == *best_sim && entry.seq > *best_seq)
                }
            };
            if better {
                best = Some((sim, entry.seq, entry.key.clone()));
            }
        }

        match best {
            Some((similarity, _, key)) if similarity >= self.threshold => {
                let value = store.touch(&key, now).map(|e| Arc::clone(&e.value));
                drop(store);
                if let Some(value) = value {
                    counters.hits.increment();
                    debug!(similarity, "semantic cache hit");
                    return Lookup::Hit {
                        value,
                        similarity,
                        key,
                    };
                }
                counters.misses.increment();
                Lookup::Miss {
                    best_similarity: Some(similarity),
                }
            }
            best => {
                drop(store);
                counters.misses.increment();
                Lookup::Miss {
                    best_similarity: best.map(|(sim, _, _)| sim),
                }
            }
        }
    }

    /// Cache `value` as the answer for `query`. Returns `false` when the query
    /// could not be embedded and nothing was stored.
    pub async fn put(&self, query: &str, value: V) -> bool {
        let embedding = match self.index.embed(query).await {
            Ok(embedding) => embedding,
            Err(reason) => {
                debug!(%reason, "semantic cache insert skipped");
                return false;
            }
        };
        if !self.has_backend() {
            return self.writer.put_embedding(&embedding, value).is_some();
        }
        self.on_blocking_pool("put", move |writer| {
            writer.put_embedding(&embedding, value).is_some()
        })
        .await
        .unwrap_or(false)
    }

    /// Insert under an embedding the caller already has. Returns the cache key,
    /// or `None` if the embedding is unusable.
    ///
    /// Backend writes happen on the calling thread; async callers should use
    /// [`put`](Self::put).
    pub fn put_embedding(&self, embedding: &[f32], value: V) -> Option<String> {
        self.writer.put_embedding(embedding, value)
    }

    /// Record that a served hit was judged wrong. Counted only; the entry is
    /// left in place.
    pub fn report_false_positive(&self, query: &str) {
        self.writer.counters.false_positives.increment();
        debug!(query_len = query.len(), "semantic cache false positive reported");
    }

    /// Physically drop expired entries here and in the backing store.
    pub fn purge_expired(&self) -> usize {
        self.writer.purge_expired()
    }

    /// [`purge_expired`](Self::purge_expired) with the backend deletes run
    /// via `spawn_blocking`.
    pub async fn purge_expired_async(&self) -> usize {
        if !self.has_backend() {
            return self.writer.purge_expired();
        }
        self.on_blocking_pool("purge", CacheWriter::<V>::purge_expired)
            .await
            .unwrap_or(0)
    }

    /// Drop every entry, including those written through to the backing store.
    pub fn clear(&self) {
        self.writer.clear();
    }

    /// [`clear`](Self::clear) with the backend deletes run via `spawn_blocking`.
    pub async fn clear_async(&self) {
        if !self.has_backend() {
            self.writer.clear();
            return;
        }
        self.on_blocking_pool("clear", CacheWriter::<V>::clear).await;
    }

    /// Load unexpired entries from the backing store, oldest first. Rows that
    /// overflow the capacity are evicted from the backend as well. Returns how
    /// many entries remain loaded; undecodable rows are skipped and counted as
    /// store errors.
    pub fn warm_from_store(&self) -> Result<usize, StoreError> {
        self.writer.warm_from_store()
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, capacity, store_stats) = {
            let store = self.writer.lock_store();
            (store.len(), store.capacity(), store.stats().clone())
        };
        let counters = &self.writer.counters;
        let hits = counters.hits.get();
        let misses = counters.misses.get();
        let false_positives = counters.false_positives.get();
        CacheStats {
            entries,
            capacity,
            similarity_threshold: self.threshold,
            hits,
            misses,
            degraded: counters.degraded.get(),
            false_positives,
            insertions: store_stats.insertions + store_stats.replacements,
            evictions: store_stats.evictions,
            expirations: store_stats.expirations,
            store_errors: counters.store_errors.get(),
            hit_rate: ratio(hits, hits + misses),
            false_positive_rate: ratio(false_positives, hits),
        }
    }

    /// Zero the lookup counters. Entries are untouched.
    pub fn reset_counters(&self) {
        let counters = &self.writer.counters;
        counters.hits.reset();
        counters.misses.reset();
        counters.degraded.reset();
        counters.false_positives.reset();
        counters.store_errors.reset();
    }

    /// Run `f` against a clone of the writer on Tokio's blocking pool. `None`
    /// if the task panicked or was cancelled.
    async fn on_blocking_pool<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        F: FnOnce(&CacheWriter<V>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let writer = self.writer.clone();
        match tokio::task::spawn_blocking(move || f(&writer)).await {
            Ok(out) => Some(out),
            Err(e) => {
                warn!(op, error = %e, "semantic cache blocking task failed");
                None
            }
        }
    }
}
