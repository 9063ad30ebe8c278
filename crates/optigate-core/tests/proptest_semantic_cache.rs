//! Property-based tests for semantic cache lookups.
//!
//! - Raising the threshold never turns a miss into a hit
//! - A hit always returns the most similar live entry, ties to the newest
//! - Reported similarity matches a direct cosine computation
//! - False-positive reports never change lookup results

use proptest::prelude::*;
use std::sync::Arc;

use optigate_core::cache::{Lookup, SemanticCache};
use optigate_core::clock::ManualClock;
use optigate_core::config::CacheConfig;
use optigate_core::similarity::{HashEmbedder, cosine_similarity};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_vector() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0f32..1.0, 4).prop_filter("non-zero", |v| {
        v.iter().map(|x| x * x).sum::<f32>() > 1e-3
    })
}

fn cache(threshold: f32, capacity: usize) -> SemanticCache<usize> {
    let config = CacheConfig {
        similarity_threshold: threshold,
        ttl_secs: 3_600,
        capacity,
        embed_timeout_ms: 1_000,
    };
    SemanticCache::new(&config, Arc::new(HashEmbedder::new(4)), Arc::new(ManualClock::new(0)))
        .unwrap()
}

fn populated(threshold: f32, corpus: &[Vec<f32>]) -> SemanticCache<usize> {
    let cache = cache(threshold, corpus.len().max(1));
    for (i, v) in corpus.iter().enumerate() {
        cache.put_embedding(v, i);
    }
    cache
}

// ────────────────────────────────────────────────────────────────────
// Threshold monotonicity
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_threshold_monotone(
        corpus in prop::collection::vec(arb_vector(), 1..20),
        query in arb_vector(),
        lo in 0.05f32..1.0,
        hi in 0.05f32..1.0,
    ) {
        let (lo, hi) = (lo.min(hi), lo.max(hi));
        let loose = populated(lo, &corpus).lookup_embedding(&query).is_hit();
        let strict = populated(hi, &corpus).lookup_embedding(&query).is_hit();
        prop_assert!(!strict || loose, "hit at {hi} but miss at {lo}");
    }
}

// ────────────────────────────────────────────────────────────────────
// Maximality
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_hit_is_maximal(
        corpus in prop::collection::vec(arb_vector(), 1..20),
        query in arb_vector(),
        threshold in 0.05f32..1.0,
    ) {
        let cache = populated(threshold, &corpus);
        let sims: Vec<f32> = corpus
            .iter()
            .map(|v| cosine_similarity(&query, v).unwrap_or(f32::NEG_INFINITY))
            .collect();
        let best = sims.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        match cache.lookup_embedding(&query) {
            Lookup::Hit { value, similarity, .. } => {
                prop_assert!(best >= threshold);
                prop_assert_eq!(similarity, best);
                // among equal-best entries, the newest wins; identical vectors
                // share a key and were replaced in place by the later insert
                let newest = sims.iter().rposition(|&s| s == best).unwrap();
                prop_assert_eq!(sims[*value], best);
                prop_assert_eq!(*value, newest);
            }
            Lookup::Miss { best_similarity } => {
                prop_assert!(best < threshold);
                prop_assert_eq!(best_similarity, Some(best));
            }
            Lookup::Degraded { reason } => prop_assert!(false, "unexpected degraded: {reason}"),
        }
    }

    #[test]
    fn prop_false_positive_reports_are_observational(
        corpus in prop::collection::vec(arb_vector(), 1..10),
        query in arb_vector(),
        reports in 1usize..10,
    ) {
        let cache = populated(0.5, &corpus);
        let before = cache.lookup_embedding(&query).into_value().map(|v| *v);
        for _ in 0..reports {
            cache.report_false_positive("ignored");
        }
        let after = cache.lookup_embedding(&query).into_value().map(|v| *v);
        prop_assert_eq!(before, after);
        prop_assert_eq!(cache.len(), cache.stats().entries);
        prop_assert_eq!(cache.stats().false_positives, reports as u64);
    }
}
