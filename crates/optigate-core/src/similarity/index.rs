//! Embedding calls with a deadline, and cosine similarity.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::embedder::Embedder;

/// Why an embedding could not be produced. Lookups that hit one of these are
/// reported as degraded misses rather than errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum DegradedReason {
    EmbedFailed(String),
    Timeout { after_ms: u64 },
    Panicked,
    InvalidVector(String),
}

impl std::fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmbedFailed(e) => write!(f, "embedding failed: {e}"),
            Self::Timeout { after_ms } => write!(f, "embedding timed out after {after_ms} ms"),
            Self::Panicked => write!(f, "embedder panicked"),
            Self::InvalidVector(e) => write!(f, "invalid embedding: {e}"),
        }
    }
}

/// 8-lane unrolled dot product.
fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let chunks = a.len() / 8;
    let mut lanes = [0.0f32; 8];
    for i in 0..chunks {
        let base = i * 8;
        for (lane, acc) in lanes.iter_mut().enumerate() {
            *acc += a[base + lane] * b[base + lane];
        }
    }
    let mut tail = 0.0f32;
    for i in (chunks * 8)..a.len() {
        tail += a[i] * b[i];
    }
    (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]) + (lanes[4] + lanes[5]) + (lanes[6] + lanes[7])
        + tail
}

/// Cosine similarity in `[-1, 1]`.
///
/// `None` when the vectors differ in length, are empty, or either has zero
/// norm: such pairs are never considered a match.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let norm_a = dot_product(a, a).sqrt();
    let norm_b = dot_product(b, b).sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return None;
    }
    let sim = dot_product(a, b) / (norm_a * norm_b);
    sim.is_finite().then(|| sim.clamp(-1.0, 1.0))
}

/// Rejects vectors the similarity scan cannot use: empty, non-finite, or
/// zero-norm. A zero-norm vector has no cosine similarity with anything.
pub fn validate_embedding(v: &[f32]) -> Result<(), DegradedReason> {
    if v.is_empty() {
        return Err(DegradedReason::InvalidVector("empty vector".to_string()));
    }
    if let Some(pos) = v.iter().position(|x| !x.is_finite()) {
        return Err(DegradedReason::InvalidVector(format!(
            "non-finite component at index {pos}"
        )));
    }
    if dot_product(v, v).sqrt() <= f32::EPSILON {
        return Err(DegradedReason::InvalidVector("zero-norm vector".to_string()));
    }
    Ok(())
}

/// Wraps the injected embedder with a per-call deadline.
#[derive(Clone)]
pub struct SimilarityIndex {
    embedder: Arc<dyn Embedder>,
    timeout: Duration,
}

impl std::fmt::Debug for SimilarityIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimilarityIndex")
            .field("embedder", &self.embedder.info().name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl SimilarityIndex {
    pub fn new(embedder: Arc<dyn Embedder>, timeout: Duration) -> Self {
        Self { embedder, timeout }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn embedder_name(&self) -> String {
        self.embedder.info().name
    }

    /// Embed `text` on the blocking pool, giving up after the deadline.
    ///
    /// Must be called from within a Tokio runtime. A timed-out call is
    /// abandoned; the embedder thread finishes on its own and its result is
    /// dropped.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, DegradedReason> {
        let embedder = Arc::clone(&self.embedder);
        let owned = text.to_owned();
        let task = tokio::task::spawn_blocking(move || embedder.embed(&owned));

        let vector = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                return Err(DegradedReason::Timeout {
                    after_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
            Ok(Err(join_err)) => {
                return Err(if join_err.is_panic() {
                    DegradedReason::Panicked
                } else {
                    DegradedReason::EmbedFailed(join_err.to_string())
                });
            }
            Ok(Ok(Err(e))) => return Err(DegradedReason::EmbedFailed(e.to_string())),
            Ok(Ok(Ok(v))) => v,
        };

        validate_embedding(&vector)?;
        Ok(vector)
    }
}
