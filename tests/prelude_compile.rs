//! Compile-time prelude coverage test.
use gatehouse::prelude::*;
use std::sync::Arc;
use tower::service_fn;
use tower_layer::Layer;
use tower_service::Service;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let backend = Arc::new(GuardedBackend::new(Arc::new(InMemoryBackend::new())));
    assert_eq!(backend.status().state(), ConnectionState::Connected);

    let limiter: RateLimitLayer<_> =
        create_limiter(presets::webhook(), backend.clone()).expect("valid preset");
    let _reputation = ReputationLayer::new(ReputationStore::new(backend.clone()));
    let _usage = UsageLayer::new(UsageAccounting::new(backend.clone()));
    let _admission = AdmissionLayer::builder(backend).build().expect("default config");

    let mut svc = limiter.layer(service_fn(|_req: axum::http::Request<axum::body::Body>| async {
        Ok::<_, std::convert::Infallible>(axum::response::Response::new(axum::body::Body::empty()))
    }));
    let req = axum::http::Request::builder().uri("/hooks/stripe").body(axum::body::Body::empty()).unwrap();
    let response = svc.call(req).await.expect("service call failed");
    assert_eq!(response.headers()["ratelimit-limit"], "60");

    let _ = LimiterConfig::default();
    let _ = BackendError::Degraded.to_string();
    let _ = (NullSink, LogSink, MemorySink::new());
}
