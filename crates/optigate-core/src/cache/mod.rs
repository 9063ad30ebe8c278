//! Semantic answer cache.
//!
//! - [`EvictionStore`]: bounded LRU + TTL storage, expired entries evicted first
//! - [`SemanticCache`]: similarity lookup over the store
//! - [`BackingStore`]: optional durable write-through target

pub mod backend;
mod semantic;
mod store;

pub use backend::{BackingStore, SqliteStore};
pub use semantic::{CacheStats, Lookup, SemanticCache};
pub use store::{CacheEntry, Eviction, EvictionReason, EvictionStore, MruIter, StoreStats};
