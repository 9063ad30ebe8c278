//! Query embedding and vector comparison.
//!
//! The embedding model itself is an injected dependency ([`Embedder`]);
//! [`SimilarityIndex`] adds the call deadline and [`cosine_similarity`] is the
//! comparison primitive used by the semantic cache scan.

mod embedder;
mod hash_embedder;
mod index;

pub use embedder::{EmbedError, Embedder, EmbedderInfo, FnEmbedder};
pub use hash_embedder::HashEmbedder;
pub use index::{DegradedReason, SimilarityIndex, cosine_similarity, validate_embedding};
