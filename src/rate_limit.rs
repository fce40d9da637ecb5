//! Rate limiting primitives.
//!
//! This module provides the building blocks for rate limiting:
//! - [`RateLimiter`]: The core trait for rate limiting logic.
//! - [`FixedWindow`]: Fixed-window counting over a shared [`KvBackend`](crate::KvBackend).
//! - [`RateLimitLayer`]: Tower middleware that enforces the limit.
//! - [`Decision`]: The result of a rate limit check.
//!
//! # Architecture
//!
//! - **Middleware**: `RateLimitLayer` wraps your service. It doesn't know *how* limiting
//!   works, only that it should ask a `RateLimiter`, and that a failing limiter means
//!   "admit".
//! - **Logic**: `FixedWindow` (in the `strategies` module) does the counting.
//! - **Storage**: the backend holds the counters, so every instance of a service sees the
//!   same count. Correctness relies on the backend's atomic increment, not on local locks.

use crate::error::BackendError;
use crate::policy::{LimiterConfig, RateKey};
use std::time::Duration;

pub mod middleware;
pub mod strategies;
pub use middleware::{create_limiter, RateLimitLayer, RateLimitService};
pub use strategies::FixedWindow;

/// The decision returned by a rate limiter.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        key: RateKey,
        /// Counter value after this request.
        count: i64,
        limit: u32,
        /// Requests left in this window. Useful for `RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The request is denied.
    Denied {
        key: RateKey,
        count: i64,
        limit: u32,
        /// How long until the window resets. Useful for `Retry-After` headers.
        wait: Duration,
    },
    /// The path is exempt; no counter was touched.
    Bypassed,
}

impl Decision {
    /// Helper to check if allowed (bypass counts as allowed).
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied { .. })
    }
}

/// Core interface for rate limiting logic.
///
/// Decouples the middleware from the counting strategy and the storage.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Count one request from `identity` to `path` and decide.
    async fn check(&self, identity: &str, path: &str) -> Result<Decision, BackendError>;

    /// The configuration this limiter was built from.
    fn config(&self) -> &LimiterConfig;
}
