use crate::error::BackendError;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// The admission stage an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Reputation,
    RateLimit,
    Usage,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Reputation => "reputation",
            Stage::RateLimit => "rate_limit",
            Stage::Usage => "usage",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted while deciding whether to admit a request.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionEvent {
    /// The request fit inside its window.
    Admitted {
        /// Counter key charged for this request.
        key: String,
        /// Counter value after this request.
        count: i64,
        /// Window quota.
        limit: u32,
    },
    /// The request exceeded its window quota.
    RateLimited { key: String, count: i64, limit: u32, retry_after: Duration },
    /// The path is exempt from limiting.
    Bypassed { path: String },
    /// The caller is on the blocklist.
    Blocked { identity: String },
    /// The backend failed; the stage let the request through.
    FailOpen { stage: Stage, error: BackendError },
}

impl AdmissionEvent {
    /// Short, stable name for the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionEvent::Admitted { .. } => "admitted",
            AdmissionEvent::RateLimited { .. } => "rate_limited",
            AdmissionEvent::Bypassed { .. } => "bypassed",
            AdmissionEvent::Blocked { .. } => "blocked",
            AdmissionEvent::FailOpen { .. } => "fail_open",
        }
    }

    /// JSON form for shipping events to log pipelines.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AdmissionEvent::Admitted { key, count, limit } => {
                json!({ "kind": self.kind(), "key": key, "count": count, "limit": limit })
            }
            AdmissionEvent::RateLimited { key, count, limit, retry_after } => json!({
                "kind": self.kind(),
                "key": key,
                "count": count,
                "limit": limit,
                "retry_after_secs": retry_after.as_secs(),
            }),
            AdmissionEvent::Bypassed { path } => json!({ "kind": self.kind(), "path": path }),
            AdmissionEvent::Blocked { identity } => {
                json!({ "kind": self.kind(), "identity": identity })
            }
            AdmissionEvent::FailOpen { stage, error } => json!({
                "kind": self.kind(),
                "stage": stage.as_str(),
                "error": error.to_string(),
            }),
        }
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Admitted { key, count, limit } => {
                write!(f, "Admitted(key={}, {}/{})", key, count, limit)
            }
            AdmissionEvent::RateLimited { key, count, limit, retry_after } => write!(
                f,
                "RateLimited(key={}, {}/{}, retry_after={:?})",
                key, count, limit, retry_after
            ),
            AdmissionEvent::Bypassed { path } => write!(f, "Bypassed(path={})", path),
            AdmissionEvent::Blocked { identity } => write!(f, "Blocked(identity={})", identity),
            AdmissionEvent::FailOpen { stage, error } => {
                write!(f, "FailOpen(stage={}, error={})", stage, error)
            }
        }
    }
}
