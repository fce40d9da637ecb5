mod common;

use axum::http::StatusCode;
use common::test_helpers::{app, assert_status, body_json, harness, request};
use gatehouse::rate_limit::{Decision, FixedWindow, RateLimiter};
use gatehouse::{create_limiter, presets, LimiterConfig};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const CALLER: [u8; 4] = [203, 0, 113, 10];

#[tokio::test]
async fn every_preset_admits_its_quota_then_rejects() {
    for (name, config) in presets::all() {
        let h = harness();
        let window = config.rate_window().unwrap();
        let message = config.message.clone();
        let router = app().layer(create_limiter(config, h.backend.clone()).unwrap());

        for n in 1..=window.quota() {
            let response = router.clone().oneshot(request("/api/items", CALLER)).await.unwrap();
            assert_status(&response, StatusCode::OK);
            let remaining = response.headers()["ratelimit-remaining"].to_str().unwrap().to_string();
            assert_eq!(remaining, (window.quota() - n).to_string(), "{name} request {n}");
        }

        let rejected = router.clone().oneshot(request("/api/items", CALLER)).await.unwrap();
        assert_status(&rejected, StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(rejected).await;
        assert_eq!(body["status"], "error", "{name}");
        assert_eq!(body["message"], message.as_str(), "{name}");
        assert_eq!(body["retryAfter"], window.window().as_secs(), "{name}");
    }
}

#[tokio::test]
async fn counter_resets_after_the_window() {
    for (name, config) in presets::all() {
        let h = harness();
        let window = config.rate_window().unwrap();
        let limiter = FixedWindow::new(h.backend.clone(), config).unwrap();

        for _ in 0..window.quota() {
            assert!(limiter.check("10.0.0.1", "/api/items").await.unwrap().is_allowed());
        }
        assert!(!limiter.check("10.0.0.1", "/api/items").await.unwrap().is_allowed(), "{name}");

        h.clock.advance(window.window());
        match limiter.check("10.0.0.1", "/api/items").await.unwrap() {
            Decision::Allowed { count, .. } => assert_eq!(count, 1, "{name}"),
            other => panic!("{name}: expected a fresh window, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn window_is_not_extended_by_later_requests() {
    let h = harness();
    let limiter =
        FixedWindow::new(h.backend.clone(), LimiterConfig::new(Duration::from_secs(60), 2)).unwrap();

    limiter.check("a", "/x").await.unwrap();
    h.clock.advance(Duration::from_secs(50));
    limiter.check("a", "/x").await.unwrap();
    h.clock.advance(Duration::from_secs(10));
    // 60s after the first request the window is over, even though the second came at 50s.
    match limiter.check("a", "/x").await.unwrap() {
        Decision::Allowed { count, .. } => assert_eq!(count, 1),
        other => panic!("expected a fresh window, got {other:?}"),
    }
}

#[tokio::test]
async fn bypass_path_is_never_rejected() {
    let h = harness();
    let router = app().layer(create_limiter(presets::auth(), h.backend.clone()).unwrap());

    for _ in 0..5 {
        router.clone().oneshot(request("/auth/login", CALLER)).await.unwrap();
    }
    assert_status(
        &router.clone().oneshot(request("/auth/login", CALLER)).await.unwrap(),
        StatusCode::TOO_MANY_REQUESTS,
    );
    for _ in 0..50 {
        assert_status(
            &router.clone().oneshot(request("/health", CALLER)).await.unwrap(),
            StatusCode::OK,
        );
    }
}

#[tokio::test]
async fn custom_bypass_and_key_fn() {
    let h = harness();
    let config = LimiterConfig::new(Duration::from_secs(60), 1)
        .bypass("/search")
        .with_key_fn(|_identity, path| format!("shared:{path}"));
    let router = app().layer(create_limiter(config, h.backend.clone()).unwrap());

    // The key ignores the caller, so two callers share one counter.
    assert_status(
        &router.clone().oneshot(request("/api/items", [1, 1, 1, 1])).await.unwrap(),
        StatusCode::OK,
    );
    assert_status(
        &router.clone().oneshot(request("/api/items", [2, 2, 2, 2])).await.unwrap(),
        StatusCode::TOO_MANY_REQUESTS,
    );
    for _ in 0..3 {
        assert_status(
            &router.clone().oneshot(request("/search", [1, 1, 1, 1])).await.unwrap(),
            StatusCode::OK,
        );
    }
}

#[tokio::test]
async fn concurrent_requests_never_exceed_quota() {
    let h = harness();
    let limiter = Arc::new(
        FixedWindow::new(h.backend.clone(), LimiterConfig::new(Duration::from_secs(60), 10)).unwrap(),
    );

    let checks = (0..50).map(|_| {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.check("10.9.8.7", "/api/items").await.unwrap() })
    });
    let decisions = futures::future::join_all(checks).await;
    let admitted = decisions.into_iter().filter(|d| d.as_ref().unwrap().is_allowed()).count();
    assert_eq!(admitted, 10);
}

#[test]
fn config_from_json_fills_defaults() {
    let config =
        LimiterConfig::from_json(r#"{"quota": 3, "bypass_paths": ["/status"], "legacyHeaders": false}"#)
            .unwrap();
    let window = config.rate_window().unwrap();
    assert_eq!(window.quota(), 3);
    assert_eq!(window.window(), Duration::from_secs(15 * 60));
    assert!(config.is_bypassed("/status"));
    assert!(!config.is_bypassed("/health"));
}
