//! FNV-1a feature-hashing embedder, usable without a model.
//!
//! Lowercases the text, collapses whitespace, and hashes character n-grams
//! plus whole words into a fixed number of signed slots. Paraphrases that
//! share vocabulary land close together; it is no substitute for a learned
//! model but keeps the cache functional when no model is wired in.
use super::embedder::{EmbedError, Embedder, EmbedderInfo};
use crate::hash::fnv1a_64;

/// Words contribute more than single n-grams so shared vocabulary dominates.
const WORD_WEIGHT: f32 = 2.0;

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
    ngram_range: (usize, usize),
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "dimension must be > 0");
        Self {
            dimension,
            ngram_range: (3, 4),
        }
    }

    #[must_use]
    pub fn with_ngram_range(mut self, min: usize, max: usize) -> Self {
        assert!(min > 0 && min <= max);
        self.ngram_range = (min, max);
        self
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a_64(feature.as_bytes());
        let slot = (h % self.dimension as u64) as usize;
        let sign = if (h >> 32) & 1 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

impl Embedder for HashEmbedder {
    fn info(&self) -> EmbedderInfo {
        EmbedderInfo {
            name: format!("fnv1a-ngram-{}", self.dimension),
            dimension: self.dimension,
        }
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let normalized = text
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let mut vector = vec![0.0f32; self.dimension];

        for word in normalized.split(' ').filter(|w| !w.is_empty()) {
            let word = word.trim_matches(|c: char| !c.is_alphanumeric());
            if !word.is_empty() {
                self.accumulate(&mut vector, word, WORD_WEIGHT);
            }
        }

        let chars: Vec<char> = normalized.chars().collect();
        for n in self.ngram_range.0..=self.ngram_range.1 {
            for window in chars.windows(n) {
                let ngram: String = window.iter().collect();
                self.accumulate(&mut vector, &ngram, 1.0);
            }
        }

        l2_normalize(&mut vector);
        Ok(vector)
    }
}
