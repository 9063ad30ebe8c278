//! Stable hashes.
//!
//! `std`'s `DefaultHasher` is randomly seeded per process and may change
//! between releases, so anything that must be reproducible (rollout buckets,
//! feature-hash slots, persisted cache keys) goes through these functions.

use sha2::{Digest, Sha256};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a.
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Cache key for an embedding: lowercase hex SHA-256 of the little-endian
/// `f32` bytes. Identical vectors always produce identical keys.
#[must_use]
pub fn embedding_key(embedding: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for x in embedding {
        hasher.update(x.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}
