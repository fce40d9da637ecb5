#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # gatehouse
//!
//! Distributed request admission control for HTTP services: fixed-window rate limiting,
//! an IP blocklist, and per-day usage accounting, all kept in a shared key-value store so
//! every instance of a service agrees.
//!
//! ## Features
//!
//! - **Fixed-window rate limiting** with named presets (auth, registration, API, webhook, search)
//! - **IP reputation** checked before any quota is spent
//! - **Usage accounting** per identity, path, and UTC day
//! - **Fail open**: an unreachable backend admits traffic instead of blocking it
//! - **Connection status** `{Connected, Degraded}` with a reconnect supervisor
//! - **Tower middleware** that drops straight into an `axum::Router`
//!
//! ## Quick Start
//!
//! ```rust
//! use gatehouse::{presets, AdmissionLayer, GuardedBackend, InMemoryBackend};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Swap in `gatehouse_redis::RedisBackend` for a shared store.
//!     let backend = Arc::new(GuardedBackend::new(Arc::new(InMemoryBackend::new())));
//!     let _supervisor = backend.spawn_supervisor();
//!
//!     let admission = AdmissionLayer::builder(backend)
//!         .limiter(presets::api().trust_proxy(true))
//!         .build()
//!         .expect("valid policy");
//!
//!     admission.reputation().block("203.0.113.7", "scraping").await.ok();
//!     // let app = axum::Router::new().route(...).layer(admission);
//! }
//! ```

pub mod backend;
pub mod backoff;
pub mod clock;
pub mod error;
pub mod identity;
pub mod policy;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod reputation;
pub mod response;
pub mod stack;
pub mod telemetry;
pub mod timeout;
pub mod usage;

// Re-exports
pub use backend::{
    ConnectionState, ConnectionStatus, GuardedBackend, InMemoryBackend, KvBackend, Supervisor,
    SupervisorHandle,
};
pub use backoff::ReconnectBackoff;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BackendError, ConfigError};
pub use identity::caller_identity;
pub use policy::{LimiterConfig, RateKey, RateWindow};
pub use rate_limit::{create_limiter, Decision, FixedWindow, RateLimitLayer, RateLimiter};
pub use reputation::{BlockRecord, ReputationLayer, ReputationStore};
pub use response::Rejection;
pub use stack::{AdmissionLayer, AdmissionStackBuilder};
pub use timeout::BackendTimeout;
pub use usage::{UsageAccounting, UsageLayer};
