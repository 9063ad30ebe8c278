//! Composition root.
//!
//! [`ControlPlane`] builds one breaker, one governor and one semantic cache
//! from a validated [`Config`] and reports their combined statistics. Hosts
//! hold it in an `Arc` and share it across request handlers.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{BackingStore, CacheStats, SemanticCache, SqliteStore};
use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerStatus, CircuitStateKind, SharedCircuitBreaker,
};
use crate::clock::{Clock, system_clock};
use crate::config::Config;
use crate::rollout::{GovernorStats, RolloutGovernor};
use crate::similarity::Embedder;

/// Combined statistics snapshot, serializable to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPlaneStats {
    pub total_requests: u64,
    pub optimized_count: u64,
    pub bypassed_count: u64,
    pub breaker_triggered_count: u64,
    pub breaker_state: CircuitStateKind,
    pub breaker_failures: u32,
    pub rollout_percentage: u8,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_rate: f64,
    pub false_positive_rate: f64,
    /// `None` when the durable store is in use or none was configured.
    pub store_fallback: Option<String>,
    pub governor: GovernorStats,
    pub cache: CacheStats,
    pub breaker: CircuitBreakerStatus,
}

/// Rollout governor, circuit breaker and semantic cache wired together.
#[derive(Debug)]
pub struct ControlPlane<V> {
    config: Config,
    governor: RolloutGovernor,
    cache: SemanticCache<V>,
    store_fallback: Option<String>,
}

impl<V> ControlPlane<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Build on the system clock.
    pub fn new(config: &Config, embedder: Arc<dyn Embedder>) -> crate::Result<Self> {
        Self::from_config(config, embedder, system_clock())
    }

    /// Build from `config`. A configured SQLite store that cannot be opened is
    /// logged once and the cache runs in-process only.
    pub fn from_config(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
    ) -> crate::Result<Self> {
        config.validate()?;
        let backend = match &config.store.sqlite_path {
            None => Ok(None),
            Some(path) => match SqliteStore::open(path, Arc::clone(&clock)) {
                Ok(store) => Ok(Some(Arc::new(store) as Arc<dyn BackingStore>)),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Backing store unavailable; semantic cache will run in-process only"
                    );
                    Err(e.to_string())
                }
            },
        };

        match backend {
            Ok(backend) => Self::assemble(config, embedder, clock, backend, None),
            Err(reason) => Self::assemble(config, embedder, clock, None, Some(reason)),
        }
    }

    /// Build with a caller-supplied backing store, ignoring `config.store.sqlite_path`.
    pub fn with_backing_store(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn BackingStore>,
    ) -> crate::Result<Self> {
        Self::assemble(config, embedder, clock, Some(backend), None)
    }

    fn assemble(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        clock: Arc<dyn Clock>,
        backend: Option<Arc<dyn BackingStore>>,
        store_fallback: Option<String>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let breaker = CircuitBreaker::with_clock(
            "optimized_path",
            config.breaker.to_breaker_config()?,
            Arc::clone(&clock),
        );
        let governor = RolloutGovernor::new(
            Arc::new(SharedCircuitBreaker::new(breaker)),
            config.rollout.percentage,
        )?;

        let mut cache = SemanticCache::new(&config.cache, embedder, clock)?;
        if let Some(backend) = backend {
            cache = cache.with_backend(backend, config.store.key_prefix.clone());
            if let Err(e) = cache.warm_from_store() {
                warn!(error = %e, "Failed to warm semantic cache from backing store");
            }
        }

        info!(
            rollout_percentage = config.rollout.percentage,
            similarity_threshold = config.cache.similarity_threshold,
            capacity = config.cache.capacity,
            durable = cache.has_backend(),
            "Control plane ready"
        );

        Ok(Self {
            config: config.clone(),
            governor,
            cache,
            store_fallback,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn governor(&self) -> &RolloutGovernor {
        &self.governor
    }

    #[must_use]
    pub fn cache(&self) -> &SemanticCache<V> {
        &self.cache
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<SharedCircuitBreaker> {
        self.governor.breaker()
    }

    /// Why the configured durable store is not in use, if it isn't.
    #[must_use]
    pub fn store_fallback(&self) -> Option<&str> {
        self.store_fallback.as_deref()
    }

    pub fn stats(&self) -> ControlPlaneStats {
        let governor = self.governor.stats();
        let cache = self.cache.stats();
        let breaker = self.breaker().status();
        ControlPlaneStats {
            total_requests: governor.total_requests,
            optimized_count: governor.optimized_count,
            bypassed_count: governor.bypassed_count,
            breaker_triggered_count: governor.breaker_triggered_count,
            breaker_state: breaker.state,
            breaker_failures: breaker.consecutive_failures,
            rollout_percentage: governor.rollout_percentage,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            hit_rate: cache.hit_rate,
            false_positive_rate: cache.false_positive_rate,
            store_fallback: self.store_fallback.clone(),
            governor,
            cache,
            breaker,
        }
    }
}
