//! Reconnect backoff for the backend supervisor.
//!
//! Attempt semantics: attempt `0` is the probe made the moment the connection degrades (no
//! delay); retries start at `attempt = 1`. Delays saturate at the configured cap and never
//! overflow.
//!
//! ```rust
//! use std::time::Duration;
//! use gatehouse::ReconnectBackoff;
//!
//! let backoff = ReconnectBackoff::default();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(50));
//! assert_eq!(backoff.delay(10), Duration::from_millis(500));
//! assert_eq!(backoff.delay(100), Duration::from_secs(2)); // capped
//! ```

use crate::error::ConfigError;
use std::time::Duration;

/// Step between reconnect attempts (`attempt * 50ms`).
pub const DEFAULT_RECONNECT_STEP: Duration = Duration::from_millis(50);
/// Upper bound on the delay between reconnect attempts.
pub const DEFAULT_RECONNECT_CAP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Growth {
    Linear,
    Exponential,
}

/// Capped backoff schedule, applied indefinitely by the reconnect supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    growth: Growth,
    base: Duration,
    max: Duration,
}

impl ReconnectBackoff {
    /// `min(attempt * base, max)`.
    pub fn linear(base: Duration, max: Duration) -> Result<Self, ConfigError> {
        Self::validated(Growth::Linear, base, max)
    }

    /// `min(base * 2^(attempt - 1), max)`.
    pub fn exponential(base: Duration, max: Duration) -> Result<Self, ConfigError> {
        Self::validated(Growth::Exponential, base, max)
    }

    fn validated(growth: Growth, base: Duration, max: Duration) -> Result<Self, ConfigError> {
        if max.is_zero() {
            return Err(ConfigError::Backoff("max must be greater than zero".into()));
        }
        if max < base {
            return Err(ConfigError::Backoff(format!("max ({max:?}) must be >= base ({base:?})")));
        }
        Ok(Self { growth, base, max })
    }

    /// The configured cap.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the given attempt (0 = immediate probe).
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.growth {
            Growth::Linear => {
                let attempt_u32 = attempt.min(u32::MAX as usize) as u32;
                self.base.checked_mul(attempt_u32).unwrap_or(self.max)
            }
            Growth::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u128.saturating_pow(exponent);
                let nanos = self.base.as_nanos().saturating_mul(multiplier);
                let capped = nanos.min(self.max.as_nanos());
                u64::try_from(capped).map(Duration::from_nanos).unwrap_or(self.max)
            }
        };
        raw.min(self.max)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self { growth: Growth::Linear, base: DEFAULT_RECONNECT_STEP, max: DEFAULT_RECONNECT_CAP }
    }
}
