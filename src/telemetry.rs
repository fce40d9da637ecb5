//! Telemetry for admission decisions.
//!
//! Every stage emits an [`AdmissionEvent`] describing what it decided and why. Events flow
//! through [`TelemetrySink`] implementations, which are plain `tower::Service`s so they
//! compose with standard tower combinators.
//!
//! # Event Types
//!
//! - **Rate limit**: `Admitted`, `RateLimited`, `Bypassed`
//! - **Reputation**: `Blocked`
//! - **All stages**: `FailOpen` (the backend failed and the stage let the request through)
//!
//! ```rust
//! use gatehouse::telemetry::{AdmissionEvent, Stage};
//! use gatehouse::BackendError;
//!
//! let event = AdmissionEvent::FailOpen {
//!     stage: Stage::RateLimit,
//!     error: BackendError::Degraded,
//! };
//! assert!(event.to_string().contains("rate_limit"));
//! ```

pub mod events;
pub mod sinks;

pub use events::{AdmissionEvent, Stage};
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, TelemetrySink};
