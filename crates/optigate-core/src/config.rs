//! Configuration management for optigate
//!
//! Handles loading and validation of `optigate.toml` plus `OPTIGATE_*`
//! environment overrides. A [`Config`] is built once at startup and passed by
//! reference; the only runtime mutation is the rollout percentage, which goes
//! through [`RolloutGovernor::set_rollout_percentage`](crate::rollout::RolloutGovernor::set_rollout_percentage).

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "OPTIGATE_";

/// Environment variable naming an explicit config file.
pub const CONFIG_PATH_ENV: &str = "OPTIGATE_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Progressive rollout settings
    #[serde(default)]
    pub rollout: RolloutConfig,

    /// Semantic cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Optional durable backing store
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,
}

/// Rollout configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutConfig {
    /// Share of identified users routed to the optimized path, 0–100
    #[serde(default)]
    pub percentage: u8,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self { percentage: 0 }
    }
}

impl RolloutConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_percentage(self.percentage)
    }
}

pub(crate) fn validate_percentage(percentage: u8) -> Result<(), ConfigError> {
    if percentage > 100 {
        return Err(ConfigError::invalid(
            "rollout.percentage",
            format!("{percentage} is outside 0..=100"),
        ));
    }
    Ok(())
}

/// Semantic cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Minimum cosine similarity for a hit, in (0, 1]
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Entry lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Maximum number of entries
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Deadline for a single embedding call in milliseconds
    #[serde(default = "default_embed_timeout_ms")]
    pub embed_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            ttl_secs: default_ttl_secs(),
            capacity: default_capacity(),
            embed_timeout_ms: default_embed_timeout_ms(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.95
}

/// Longest accepted entry lifetime: ten years.
pub const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn default_ttl_secs() -> u64 {
    3_600
}

fn default_capacity() -> usize {
    1_000
}

fn default_embed_timeout_ms() -> u64 {
    2_000
}

impl CacheConfig {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = self.similarity_threshold;
        if !t.is_finite() || t <= 0.0 || t > 1.0 {
            return Err(ConfigError::invalid(
                "cache.similarity_threshold",
                format!("{t} is outside (0, 1]"),
            ));
        }
        if self.ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.ttl_secs", "must be positive"));
        }
        if self.ttl_secs > MAX_TTL_SECS {
            return Err(ConfigError::invalid(
                "cache.ttl_secs",
                format!("{} exceeds the maximum of {MAX_TTL_SECS}", self.ttl_secs),
            ));
        }
        if self.capacity == 0 {
            return Err(ConfigError::invalid("cache.capacity", "must be positive"));
        }
        if self.embed_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "cache.embed_timeout_ms",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures (net of success decay) that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the breaker stays open before probation
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Probation successes required to close
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    2
}

impl BreakerConfig {
    pub fn to_breaker_config(&self) -> Result<CircuitBreakerConfig, ConfigError> {
        CircuitBreakerConfig::new(
            self.failure_threshold,
            self.success_threshold,
            Duration::from_secs(self.cooldown_secs),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_breaker_config().map(|_| ())
    }
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// SQLite file for write-through persistence; in-process only when unset
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,

    /// Namespace for cache keys in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "semcache:".to_string()
}

impl StoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::invalid("store.key_prefix", "must not be empty"));
        }
        Ok(())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

fn parse_override<T>(var: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvOverride {
            var: var.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

impl Config {
    /// Load from `$OPTIGATE_CONFIG` or the default location (defaults when no
    /// file exists), then apply `OPTIGATE_*` environment overrides and
    /// validate.
    pub fn load() -> crate::Result<Self> {
        let explicit = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = match resolve_config_path(explicit.as_deref()) {
            Some(path) => Self::read_file(&path)?,
            None if explicit.is_some() => {
                return Err(ConfigError::FileNotFound(
                    explicit.unwrap_or_default().display().to_string(),
                )
                .into());
            }
            None => Self::default(),
        };
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a specific file. Environment overrides are not applied.
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    /// Apply `OPTIGATE_*` overrides from `(name, value)` pairs. Unknown
    /// `OPTIGATE_*` names are ignored; malformed values are errors.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (var, value) in vars {
            let Some(name) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "ROLLOUT_PERCENTAGE" => self.rollout.percentage = parse_override(&var, &value)?,
                "SIMILARITY_THRESHOLD" => {
                    self.cache.similarity_threshold = parse_override(&var, &value)?;
                }
                "CACHE_TTL_SECS" => self.cache.ttl_secs = parse_override(&var, &value)?,
                "CACHE_CAPACITY" => self.cache.capacity = parse_override(&var, &value)?,
                "EMBED_TIMEOUT_MS" => self.cache.embed_timeout_ms = parse_override(&var, &value)?,
                "BREAKER_FAILURE_THRESHOLD" => {
                    self.breaker.failure_threshold = parse_override(&var, &value)?;
                }
                "BREAKER_COOLDOWN_SECS" => {
                    self.breaker.cooldown_secs = parse_override(&var, &value)?;
                }
                "BREAKER_SUCCESS_THRESHOLD" => {
                    self.breaker.success_threshold = parse_override(&var, &value)?;
                }
                "STORE_PATH" => {
                    let trimmed = value.trim();
                    self.store.sqlite_path =
                        (!trimmed.is_empty()).then(|| PathBuf::from(trimmed));
                }
                "LOG_LEVEL" => self.logging.level = value.trim().to_string(),
                "LOG_FORMAT" => {
                    self.logging.format = value.parse().map_err(|reason| {
                        ConfigError::InvalidEnvOverride {
                            var: var.clone(),
                            value: value.clone(),
                            reason,
                        }
                    })?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate every section. Out-of-range values are rejected, never clamped.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rollout.validate()?;
        self.cache.validate()?;
        self.breaker.validate()?;
        self.store.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Resolve the config file to read: an explicit path if it exists, otherwise
/// `<config_dir>/optigate/optigate.toml` if it exists.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = dirs::config_dir()?.join("optigate").join("optigate.toml");
    default.exists().then_some(default)
}
