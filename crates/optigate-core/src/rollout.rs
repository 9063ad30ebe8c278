//! Percentage-based rollout of the optimized path.
//!
//! Identified users land in a fixed bucket, `fnv1a_64(user) % 100`, and are
//! optimized while their bucket is below the rollout percentage. Raising the
//! percentage only admits more buckets; nobody already admitted is moved out
//! unless it is lowered again. Anonymous requests draw a random bucket per
//! call. The circuit breaker overrides everything.

use std::fmt::Display;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::circuit_breaker::{CircuitStateKind, SharedCircuitBreaker};
use crate::config::validate_percentage;
use crate::error::ConfigError;
use crate::hash::fnv1a_64;
use crate::sharded_counter::ShardedCounter;

/// Number of rollout buckets.
pub const BUCKETS: u64 = 100;

/// Stable bucket in `0..100` for an identified user.
#[must_use]
pub fn bucket_for(user_id: &str) -> u8 {
    (fnv1a_64(user_id.as_bytes()) % BUCKETS) as u8
}

/// Governor statistics snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorStats {
    pub total_requests: u64,
    pub optimized_count: u64,
    pub bypassed_count: u64,
    /// Requests turned away because the breaker was open.
    pub breaker_triggered_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub rollout_percentage: u8,
    pub breaker_state: CircuitStateKind,
    pub breaker_failures: u32,
}

#[derive(Debug, Default)]
struct GovernorCounters {
    total: ShardedCounter,
    optimized: ShardedCounter,
    bypassed: ShardedCounter,
    breaker_triggered: ShardedCounter,
    successes: ShardedCounter,
    failures: ShardedCounter,
}

/// Per-request gate for the optimized path.
#[derive(Debug)]
pub struct RolloutGovernor {
    breaker: Arc<SharedCircuitBreaker>,
    percentage: AtomicU8,
    counters: GovernorCounters,
}

impl RolloutGovernor {
    pub fn new(breaker: Arc<SharedCircuitBreaker>, percentage: u8) -> Result<Self, ConfigError> {
        validate_percentage(percentage)?;
        Ok(Self {
            breaker,
            percentage: AtomicU8::new(percentage),
            counters: GovernorCounters::default(),
        })
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<SharedCircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn rollout_percentage(&self) -> u8 {
        self.percentage.load(Ordering::Relaxed)
    }

    /// Change the rollout boundary. Values above 100 are rejected.
    pub fn set_rollout_percentage(&self, percentage: u8) -> Result<(), ConfigError> {
        validate_percentage(percentage)?;
        let previous = self.percentage.swap(percentage, Ordering::Relaxed);
        if previous != percentage {
            info!(from = previous, to = percentage, "Rollout percentage changed");
        }
        Ok(())
    }

    /// Decide with the configured percentage. `None` or an empty id is
    /// anonymous.
    pub fn should_optimize(&self, user_id: Option<&str>) -> bool {
        self.should_optimize_with(user_id, self.rollout_percentage())
    }

    /// Decide with an explicit percentage. Percentages above 100 behave as 100.
    pub fn should_optimize_with(&self, user_id: Option<&str>, percentage: u8) -> bool {
        self.counters.total.increment();

        if self.breaker.is_open() {
            self.counters.breaker_triggered.increment();
            self.counters.bypassed.increment();
            return false;
        }

        let optimized = match percentage {
            0 => false,
            p if p >= 100 => true,
            p => {
                let bucket = match user_id {
                    Some(id) if !id.is_empty() => bucket_for(id),
                    _ => rand::rng().random_range(0..BUCKETS as u8),
                };
                bucket < p
            }
        };

        if optimized {
            self.counters.optimized.increment();
        } else {
            self.counters.bypassed.increment();
        }
        optimized
    }

    pub fn record_success(&self) {
        self.counters.successes.increment();
        self.breaker.record_success();
    }

    pub fn record_failure(&self, reason: impl Display) {
        self.counters.failures.increment();
        debug!(%reason, "Optimized path failure reported");
        self.breaker.record_failure();
    }

    pub fn stats(&self) -> GovernorStats {
        let breaker = self.breaker.status();
        GovernorStats {
            total_requests: self.counters.total.get(),
            optimized_count: self.counters.optimized.get(),
            bypassed_count: self.counters.bypassed.get(),
            breaker_triggered_count: self.counters.breaker_triggered.get(),
            success_count: self.counters.successes.get(),
            failure_count: self.counters.failures.get(),
            rollout_percentage: self.rollout_percentage(),
            breaker_state: breaker.state,
            breaker_failures: breaker.consecutive_failures,
        }
    }
}
