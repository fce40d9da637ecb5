//! Error types for admission control.
//!
//! Two families live here:
//! - [`BackendError`]: anything that went wrong talking to the key-value store. Admission
//!   stages never surface these to callers; they log and fail open.
//! - [`ConfigError`]: invalid windows, quotas, or environment values. Returned from
//!   constructors so a misconfigured process fails at startup rather than per request.
//!
//! Policy violations (quota exceeded, identity blocked) are not errors at all; see
//! [`crate::Rejection`].
use std::time::Duration;
use thiserror::Error;

/// Failure talking to the key-value backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Connection refused, reset, or otherwise unreachable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The call did not complete within the configured bound.
    #[error("backend call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The connection is marked degraded; the call was not attempted.
    #[error("backend degraded; call skipped")]
    Degraded,
    /// The backend answered with something we could not interpret.
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    /// Whether this failure should flip the shared connection status to degraded.
    ///
    /// Protocol errors mean the backend is reachable, so they do not.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }

    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Access timeout details as `(elapsed, timeout)`.
    pub fn timeout_details(&self) -> Option<(Duration, Duration)> {
        match self {
            Self::Timeout { elapsed, timeout } => Some((*elapsed, *timeout)),
            _ => None,
        }
    }
}

/// Invalid configuration detected while building a component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("quota must be at least 1")]
    QuotaZero,
    #[error("window must be at least 1s (got {0:?})")]
    WindowTooShort(Duration),
    #[error("key prefix cannot be empty")]
    EmptyPrefix,
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
    #[error("could not parse configuration: {0}")]
    Parse(String),
    #[error("backend timeout must be non-zero and finite")]
    InvalidTimeout,
    #[error("invalid backoff: {0}")]
    Backoff(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_error_display() {
        let err = BackendError::Timeout {
            elapsed: Duration::from_millis(1100),
            timeout: Duration::from_secs(1),
        };
        let msg = err.to_string();
        assert!(msg.contains("timed out"));
        assert!(msg.contains("1.1"));
        assert_eq!(err.timeout_details(), Some((Duration::from_millis(1100), Duration::from_secs(1))));
    }

    #[test]
    fn connectivity_classification() {
        assert!(BackendError::Unavailable("refused".into()).is_connectivity());
        assert!(BackendError::Timeout { elapsed: Duration::ZERO, timeout: Duration::ZERO }
            .is_connectivity());
        assert!(!BackendError::Protocol("WRONGTYPE".into()).is_connectivity());
        assert!(!BackendError::Degraded.is_connectivity());
    }

    #[test]
    fn config_error_display_names_the_variable() {
        let err = ConfigError::InvalidEnv { var: "REDIS_PORT", value: "abc".into() };
        let msg = err.to_string();
        assert!(msg.contains("REDIS_PORT"));
        assert!(msg.contains("abc"));
    }
}
