//! optigate-core: safety and efficiency control plane for document QA
//!
//! Decides per request whether a question-answering service may take its
//! optimized path (compressed context plus reuse of earlier answers) and keeps
//! that path from turning local failures into systemic ones.
//!
//! # Architecture
//!
//! ```text
//! request ─→ RolloutGovernor ─→ CircuitBreaker open? ─→ baseline
//!                  │
//!                  └─ bucket(user) < percentage ─→ SemanticCache::get
//!                                                   ├─ hit  → cached answer
//!                                                   └─ miss → compute, put
//! outcome ─→ RolloutGovernor::record_{success,failure} ─→ CircuitBreaker
//! ```
//!
//! # Modules
//!
//! - `cache`: bounded LRU + TTL store, similarity lookup, durable write-through
//! - `similarity`: embedder contract, cosine similarity, embed deadline
//! - `circuit_breaker`: CLOSED / OPEN / HALF_OPEN failure isolation
//! - `rollout`: stable percentage buckets and the per-request gate
//! - `control_plane`: composition root and statistics snapshot
//! - `config`: TOML + environment configuration
//! - `logging`: tracing subscriber setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod hash;
pub mod logging;
pub mod rollout;
pub mod sharded_counter;
pub mod similarity;

pub use cache::{Lookup, SemanticCache};
pub use circuit_breaker::{CircuitBreaker, CircuitStateKind, SharedCircuitBreaker};
pub use config::Config;
pub use control_plane::{ControlPlane, ControlPlaneStats};
pub use error::{ConfigError, Error, Result, StoreError};
pub use rollout::RolloutGovernor;
pub use similarity::{EmbedError, Embedder};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
