mod common;

use axum::http::StatusCode;
use common::test_helpers::{app, assert_status, harness, init_tracing, request};
use gatehouse::telemetry::{AdmissionEvent, MemorySink, Stage};
use gatehouse::{
    presets, AdmissionLayer, BackendError, BackendTimeout, ConnectionState, GuardedBackend,
    InMemoryBackend, LimiterConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const CALLER: [u8; 4] = [203, 0, 113, 99];
const CALLER_IP: &str = "203.0.113.99";

#[tokio::test]
async fn outage_admits_everything_and_usage_reads_empty() {
    let h = harness();
    let admission = AdmissionLayer::builder(h.backend.clone())
        .limiter(LimiterConfig::new(Duration::from_secs(60), 1))
        .clock(h.clock.clone())
        .build()
        .unwrap()
        .with_sink(h.sink.clone());
    let reputation = admission.reputation().clone();
    let usage = admission.usage().clone();
    let router = app().layer(admission);

    reputation.block(CALLER_IP, "abuse").await.unwrap();
    router.clone().oneshot(request("/api/items", [10, 0, 0, 1])).await.unwrap();
    h.backend.set_available(false);

    // Blocked and over quota, yet the outage lets the caller through.
    for _ in 0..5 {
        assert_status(&router.clone().oneshot(request("/api/items", CALLER)).await.unwrap(), StatusCode::OK);
    }
    assert!(usage.usage_today(CALLER_IP).await.is_empty());
    assert!(reputation.is_blocked(CALLER_IP).await.is_err());

    let stages: Vec<Stage> = h
        .sink
        .of_kind("fail_open")
        .into_iter()
        .filter_map(|e| match e {
            AdmissionEvent::FailOpen { stage, .. } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(stages.len(), 15);
    assert_eq!(&stages[..3], &[Stage::Reputation, Stage::RateLimit, Stage::Usage]);

    // Back up: the block is enforced again.
    h.backend.set_available(true);
    assert_status(
        &router.clone().oneshot(request("/api/items", CALLER)).await.unwrap(),
        StatusCode::FORBIDDEN,
    );
}

#[tokio::test]
async fn degraded_backend_fails_fast_until_the_supervisor_reconnects() {
    init_tracing();
    let memory = InMemoryBackend::new();
    let guarded = Arc::new(GuardedBackend::new(Arc::new(memory.clone())));
    let sink = MemorySink::new();
    let router = app().layer(
        AdmissionLayer::builder(guarded.clone())
            .limiter(presets::auth())
            .build()
            .unwrap()
            .with_sink(sink.clone()),
    );

    memory.set_available(false);
    assert_status(&router.clone().oneshot(request("/auth/login", CALLER)).await.unwrap(), StatusCode::OK);
    assert_eq!(guarded.status().state(), ConnectionState::Degraded);

    // Later stages see the degraded status and skip the round trip.
    let errors: Vec<BackendError> = sink
        .of_kind("fail_open")
        .into_iter()
        .filter_map(|e| match e {
            AdmissionEvent::FailOpen { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert!(matches!(errors[0], BackendError::Unavailable(_)));
    assert!(errors[1..].iter().all(|e| *e == BackendError::Degraded));

    memory.set_available(true);
    let handle = guarded.spawn_supervisor();
    let mut rx = guarded.status().subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .expect("supervisor reconnects")
        .unwrap();
    handle.shutdown();

    let response = router.clone().oneshot(request("/auth/login", CALLER)).await.unwrap();
    assert_status(&response, StatusCode::OK);
    assert_eq!(response.headers()["ratelimit-remaining"], "4");
}

#[tokio::test(start_paused = true)]
async fn slow_backend_is_cut_off_by_the_timeout() {
    init_tracing();
    let memory = InMemoryBackend::new();
    memory.set_latency(Some(Duration::from_secs(5)));
    let guarded = Arc::new(
        GuardedBackend::new(Arc::new(memory))
            .with_timeout(BackendTimeout::new(Duration::from_millis(200)).unwrap()),
    );
    let router = app().layer(AdmissionLayer::builder(guarded.clone()).build().unwrap());

    let started = tokio::time::Instant::now();
    assert_status(&router.clone().oneshot(request("/api/items", CALLER)).await.unwrap(), StatusCode::OK);
    // One timed-out call degrades the status; the remaining stages fail fast.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(guarded.status().is_degraded());
}

#[tokio::test(start_paused = true)]
async fn enforcement_resumes_after_an_outage_without_a_supervisor() {
    init_tracing();
    let memory = InMemoryBackend::new();
    let guarded = Arc::new(GuardedBackend::new(Arc::new(memory.clone())));
    let admission = AdmissionLayer::builder(guarded.clone()).build().unwrap();
    let reputation = admission.reputation().clone();
    let router = app().layer(admission);
    reputation.block(CALLER_IP, "abuse").await.unwrap();

    memory.set_available(false);
    assert_status(&router.clone().oneshot(request("/api/items", CALLER)).await.unwrap(), StatusCode::OK);
    memory.set_available(true);
    assert!(guarded.status().is_degraded());

    tokio::time::sleep(Duration::from_secs(60 * 60)).await;
    assert_status(
        &router.clone().oneshot(request("/api/items", CALLER)).await.unwrap(),
        StatusCode::FORBIDDEN,
    );
    assert_eq!(guarded.status().state(), ConnectionState::Connected);
}
