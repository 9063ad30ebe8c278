//! Circuit breaker guarding the optimized request path.
//!
//! CLOSED counts failures and decays the count by one per success. Reaching
//! the failure threshold trips the breaker OPEN; after the cooldown the next
//! check moves it to HALF_OPEN, where a run of probation successes closes it
//! and any failure re-opens it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, system_clock};
use crate::error::ConfigError;

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: u32,
    success_threshold: u32,
    open_cooldown: Duration,
}

impl CircuitBreakerConfig {
    /// Both thresholds must be at least 1.
    pub fn new(
        failure_threshold: u32,
        success_threshold: u32,
        open_cooldown: Duration,
    ) -> Result<Self, ConfigError> {
        if failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if success_threshold == 0 {
            return Err(ConfigError::invalid(
                "breaker.success_threshold",
                "must be at least 1",
            ));
        }
        Ok(Self {
            failure_threshold,
            success_threshold,
            open_cooldown,
        })
    }

    #[must_use]
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    #[must_use]
    pub fn success_threshold(&self) -> u32 {
        self.success_threshold
    }

    #[must_use]
    pub fn open_cooldown(&self) -> Duration {
        self.open_cooldown
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum CircuitState {
    Closed,
    Open { opened_at_ms: u64 },
    HalfOpen { successes: u32 },
}

/// Public-facing circuit state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of circuit breaker status for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_cooldown_ms: u64,
    pub open_for_ms: Option<u64>,
    pub cooldown_remaining_ms: Option<u64>,
    pub half_open_successes: Option<u32>,
    pub last_failure_ms: Option<u64>,
    /// Times the breaker has gone CLOSED or HALF_OPEN to OPEN.
    pub trip_count: u64,
}

/// Circuit breaker state machine.
///
/// Methods take `&mut self`; wrap in [`SharedCircuitBreaker`] to share it
/// across request handlers.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_ms: Option<u64>,
    trip_count: u64,
}

impl CircuitBreaker {
    /// Create a breaker on the system clock.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock("optimized_path", config, system_clock())
    }

    #[must_use]
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_ms: None,
            trip_count: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Move OPEN to HALF_OPEN once the cooldown has elapsed.
    fn refresh(&mut self) {
        if let CircuitState::Open { opened_at_ms } = self.state {
            let elapsed = self.clock.now_ms().saturating_sub(opened_at_ms);
            if u128::from(elapsed) >= self.config.open_cooldown.as_millis() {
                self.state = CircuitState::HalfOpen { successes: 0 };
                info!(
                    circuit = %self.name,
                    open_for_ms = elapsed,
                    "Circuit transitioned to half-open after cooldown"
                );
            }
        }
    }

    fn trip(&mut self, now_ms: u64) {
        self.state = CircuitState::Open {
            opened_at_ms: now_ms,
        };
        self.trip_count += 1;
    }

    /// `true` while requests must bypass the protected path.
    ///
    /// Applies the lazy OPEN to HALF_OPEN transition, so HALF_OPEN admits
    /// probation traffic.
    pub fn is_open(&mut self) -> bool {
        self.refresh();
        matches!(self.state, CircuitState::Open { .. })
    }

    /// Record a successful operation.
    pub fn record_success(&mut self) {
        self.refresh();
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = self.consecutive_failures.saturating_sub(1);
            }
            CircuitState::HalfOpen { successes } => {
                let successes = successes + 1;
                if successes >= self.config.success_threshold {
                    self.consecutive_failures = 0;
                    self.state = CircuitState::Closed;
                    info!(
                        circuit = %self.name,
                        probation_successes = successes,
                        "Circuit closed after successful probation"
                    );
                } else {
                    self.state = CircuitState::HalfOpen { successes };
                }
            }
            CircuitState::Open { .. } => {
                // Straggler from before the trip; cooldown is not affected.
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&mut self) {
        self.refresh();
        let now = self.clock.now_ms();
        match self.state {
            CircuitState::Closed => {
                self.last_failure_ms = Some(now);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                    warn!(
                        circuit = %self.name,
                        failures = self.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        cooldown_ms = self.config.open_cooldown.as_millis() as u64,
                        "Circuit opened after failures"
                    );
                }
            }
            CircuitState::HalfOpen { successes } => {
                self.last_failure_ms = Some(now);
                self.trip(now);
                warn!(
                    circuit = %self.name,
                    probation_successes = successes,
                    "Circuit re-opened after half-open failure"
                );
            }
            CircuitState::Open { .. } => {
                // Already open; keep cooldown ticking.
            }
        }
    }

    /// Force CLOSED with zeroed counters. The trip count is kept.
    pub fn reset(&mut self) {
        let was = self.state_kind();
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.last_failure_ms = None;
        if was != CircuitStateKind::Closed {
            info!(circuit = %self.name, from = %was, "Circuit manually reset");
        }
    }

    /// Current state after applying any due transition.
    pub fn state(&mut self) -> CircuitStateKind {
        self.refresh();
        self.state_kind()
    }

    fn state_kind(&self) -> CircuitStateKind {
        match self.state {
            CircuitState::Closed => CircuitStateKind::Closed,
            CircuitState::Open { .. } => CircuitStateKind::Open,
            CircuitState::HalfOpen { .. } => CircuitStateKind::HalfOpen,
        }
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    #[must_use]
    pub fn trip_count(&self) -> u64 {
        self.trip_count
    }

    /// Return a status snapshot for reporting.
    pub fn status(&mut self) -> CircuitBreakerStatus {
        self.refresh();
        let mut status = CircuitBreakerStatus {
            state: self.state_kind(),
            consecutive_failures: self.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            open_cooldown_ms: self.config.open_cooldown.as_millis() as u64,
            open_for_ms: None,
            cooldown_remaining_ms: None,
            half_open_successes: None,
            last_failure_ms: self.last_failure_ms,
            trip_count: self.trip_count,
        };
        match self.state {
            CircuitState::Closed => {}
            CircuitState::Open { opened_at_ms } => {
                let elapsed = self.clock.now_ms().saturating_sub(opened_at_ms);
                status.open_for_ms = Some(elapsed);
                status.cooldown_remaining_ms = Some(status.open_cooldown_ms.saturating_sub(elapsed));
            }
            CircuitState::HalfOpen { successes } => {
                status.half_open_successes = Some(successes);
            }
        }
        status
    }
}

/// [`CircuitBreaker`] behind a mutex, shareable across threads.
#[derive(Debug)]
pub struct SharedCircuitBreaker {
    inner: Mutex<CircuitBreaker>,
}

impl SharedCircuitBreaker {
    #[must_use]
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self {
            inner: Mutex::new(breaker),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreaker> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_open()
    }

    pub fn record_success(&self) {
        self.lock().record_success();
    }

    pub fn record_failure(&self) {
        self.lock().record_failure();
    }

    pub fn reset(&self) {
        self.lock().reset();
    }

    pub fn state(&self) -> CircuitStateKind {
        self.lock().state()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures()
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        self.lock().status()
    }
}

impl From<CircuitBreaker> for SharedCircuitBreaker {
    fn from(breaker: CircuitBreaker) -> Self {
        Self::new(breaker)
    }
}
