use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use gatehouse::telemetry::MemorySink;
use gatehouse::{InMemoryBackend, ManualClock};
use std::net::SocketAddr;
use std::sync::Arc;

// 2023-11-14T22:13:20Z
pub const START_MILLIS: u64 = 1_700_000_000_000;

/// Shared in-memory backend, a manual clock driving its expiry, and an event sink.
pub struct Harness {
    pub backend: Arc<InMemoryBackend>,
    pub clock: ManualClock,
    pub sink: MemorySink,
}

pub fn harness() -> Harness {
    init_tracing();
    let clock = ManualClock::new(START_MILLIS);
    let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
    Harness { backend, clock, sink: MemorySink::new() }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Routes used by every end-to-end test; `/health` is the default bypass path.
pub fn app() -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/items", get(|| async { "items" }))
        .route("/auth/login", get(|| async { "welcome" }))
        .route("/search", get(|| async { "results" }))
}

/// GET `path` from a peer at `ip`.
pub fn request(path: &str, ip: [u8; 4]) -> Request<Body> {
    let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
    req.extensions_mut().insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
    req
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn assert_status(response: &Response, status: StatusCode) {
    assert_eq!(response.status(), status, "headers: {:?}", response.headers());
}
