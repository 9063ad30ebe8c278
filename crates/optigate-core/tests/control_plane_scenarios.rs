//! End-to-end scenarios through the composed control plane.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use optigate_core::clock::{Clock, ManualClock};
use optigate_core::config::Config;
use optigate_core::similarity::{EmbedError, Embedder, FnEmbedder};
use optigate_core::{CircuitStateKind, ControlPlane, Lookup};

const KTP_QUESTION: &str = "Apa syarat membuat KTP elektronik?";
const KTP_PARAPHRASE: &str = "Syarat bikin KTP elektronik apa?";
const SIM_QUESTION: &str = "Bagaimana cara membuat SIM?";

/// Fixed vectors: the paraphrase sits at cosine 0.97 from the KTP question,
/// the SIM question at 0.40.
fn stub_embedder() -> Arc<dyn Embedder> {
    let table: HashMap<&'static str, Vec<f32>> = HashMap::from([
        (KTP_QUESTION, vec![1.0, 0.0, 0.0]),
        (KTP_PARAPHRASE, vec![0.97, (1.0f32 - 0.97 * 0.97).sqrt(), 0.0]),
        (SIM_QUESTION, vec![0.40, 0.0, (1.0f32 - 0.40 * 0.40).sqrt()]),
    ]);
    Arc::new(FnEmbedder::new("stub", 3, move |text: &str| {
        table
            .get(text)
            .cloned()
            .ok_or_else(|| EmbedError::InferenceFailed(format!("no stub vector for {text:?}")))
    }))
}

fn plane(percentage: u8, threshold: f32) -> (ControlPlane<String>, ManualClock) {
    let mut config = Config::default();
    config.rollout.percentage = percentage;
    config.cache.similarity_threshold = threshold;
    let clock = ManualClock::new(1_700_000_000_000);
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let plane = ControlPlane::from_config(&config, stub_embedder(), shared).unwrap();
    (plane, clock)
}

#[tokio::test]
async fn paraphrase_hits_and_unrelated_question_misses() {
    let (plane, _clock) = plane(100, 0.95);
    assert!(plane.governor().should_optimize(Some("citizen-42")));

    let answer = "KTP elektronik membutuhkan KK dan akta kelahiran.".to_string();
    assert!(plane.cache().put(KTP_QUESTION, answer.clone()).await);

    match plane.cache().get(KTP_PARAPHRASE).await {
        Lookup::Hit { value, similarity, .. } => {
            assert_eq!(*value, answer);
            assert!((similarity - 0.97).abs() < 1e-5, "similarity {similarity}");
        }
        other => panic!("expected hit, got {other:?}"),
    }

    let miss = plane.cache().get(SIM_QUESTION).await;
    assert!(!miss.is_hit());
    let best = miss.similarity().unwrap();
    assert!((best - 0.40).abs() < 1e-5, "best similarity {best}");

    let stats = plane.stats();
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert!((stats.hit_rate - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn stricter_threshold_turns_paraphrase_into_miss() {
    let (plane, _clock) = plane(100, 0.98);
    plane.cache().put(KTP_QUESTION, "answer".to_string()).await;
    assert!(!plane.cache().get(KTP_PARAPHRASE).await.is_hit());
}

#[tokio::test]
async fn unknown_query_is_degraded_not_error() {
    let (plane, _clock) = plane(100, 0.95);
    plane.cache().put(KTP_QUESTION, "answer".to_string()).await;
    let lookup = plane.cache().get("query the stub has never seen").await;
    assert!(lookup.is_degraded());
    assert_eq!(plane.stats().cache.degraded, 1);
}

#[test]
fn breaker_trips_cools_down_and_recovers() {
    let (plane, clock) = plane(100, 0.95);
    let governor = plane.governor();
    let breaker = plane.breaker();

    for _ in 0..5 {
        governor.record_failure("answer generator timed out");
    }
    assert_eq!(breaker.state(), CircuitStateKind::Open);
    assert!(!governor.should_optimize(Some("citizen-42")));

    clock.advance(Duration::from_secs(61));
    assert!(!breaker.is_open());
    assert_eq!(breaker.state(), CircuitStateKind::HalfOpen);

    governor.record_success();
    assert_eq!(breaker.state(), CircuitStateKind::HalfOpen);
    governor.record_success();
    assert_eq!(breaker.state(), CircuitStateKind::Closed);

    assert!(governor.should_optimize(Some("citizen-42")));
    governor.set_rollout_percentage(0).unwrap();
    assert!(!governor.should_optimize(Some("citizen-42")));

    let stats = plane.stats();
    assert_eq!(stats.breaker_state, CircuitStateKind::Closed);
    assert_eq!(stats.breaker_failures, 0);
    assert_eq!(stats.breaker_triggered_count, 1);
    assert_eq!(stats.breaker.trip_count, 1);
}

#[test]
fn failures_interleaved_with_successes_need_more_to_trip() {
    let (plane, _clock) = plane(100, 0.95);
    let governor = plane.governor();
    for _ in 0..4 {
        governor.record_failure("bad answer");
    }
    governor.record_success();
    governor.record_failure("bad answer");
    assert_eq!(plane.breaker().state(), CircuitStateKind::Closed);
    governor.record_failure("bad answer");
    assert_eq!(plane.breaker().state(), CircuitStateKind::Open);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_keep_capacity() {
    let mut config = Config::default();
    config.rollout.percentage = 100;
    config.cache.capacity = 16;
    config.cache.similarity_threshold = 0.999;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let embedder: Arc<dyn Embedder> = Arc::new(FnEmbedder::new("angle", 2, move |text: &str| {
        counter.fetch_add(1, Ordering::Relaxed);
        let n: f32 = text.parse().map_err(|_| EmbedError::InferenceFailed(text.to_string()))?;
        Ok(vec![n.cos(), n.sin()])
    }));
    let plane: Arc<ControlPlane<u32>> = Arc::new(
        ControlPlane::from_config(&config, embedder, Arc::new(ManualClock::new(0))).unwrap(),
    );

    let mut tasks = Vec::new();
    for worker in 0..8u32 {
        let plane = Arc::clone(&plane);
        tasks.push(tokio::spawn(async move {
            for i in 0..25u32 {
                let query = format!("{}", (worker * 25 + i) as f32 * 0.1);
                if !plane.cache().get(&query).await.is_hit() {
                    plane.cache().put(&query, worker * 25 + i).await;
                }
                assert!(plane.cache().len() <= 16);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(plane.cache().len() <= 16);
    let stats = plane.stats();
    assert_eq!(stats.cache_hits + stats.cache_misses, 200);
    assert!(calls.load(Ordering::Relaxed) >= 200);
}
