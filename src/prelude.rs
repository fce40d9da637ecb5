//! Convenient re-exports for wiring admission control into a service.
pub use crate::{
    backend::{ConnectionState, GuardedBackend, InMemoryBackend, KvBackend},
    policy::LimiterConfig,
    presets,
    rate_limit::{create_limiter, RateLimitLayer, RateLimiter},
    reputation::{ReputationLayer, ReputationStore},
    stack::AdmissionLayer,
    telemetry::{LogSink, MemorySink, NullSink},
    usage::{UsageAccounting, UsageLayer},
    BackendError, ConfigError, Rejection,
};
