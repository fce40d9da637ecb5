//! Bounded backend calls.

use crate::error::{BackendError, ConfigError};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default bound on a single backend round trip.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Caps how long an admission stage waits on the backend before failing open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendTimeout {
    duration: Duration,
}

impl BackendTimeout {
    /// Create a timeout. Zero and `Duration::MAX` are rejected.
    pub fn new(duration: Duration) -> Result<Self, ConfigError> {
        if duration.is_zero() || duration == Duration::MAX {
            return Err(ConfigError::InvalidTimeout);
        }
        Ok(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn run<T, Fut>(&self, call: Fut) -> Result<T, BackendError>
    where
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let start = Instant::now();
        match tokio::time::timeout(self.duration, call).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}

impl Default for BackendTimeout {
    fn default() -> Self {
        Self { duration: DEFAULT_BACKEND_TIMEOUT }
    }
}
