use crate::backend::KvBackend;
use crate::error::{BackendError, ConfigError};
use crate::policy::{LimiterConfig, RateKey, RateWindow};
use crate::rate_limit::{Decision, RateLimiter};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

// Shortest wait reported to a denied caller.
const MIN_WAIT: Duration = Duration::from_secs(1);

/// A fixed-window rate limiter.
///
/// Each `(identity, path)` key gets a counter that lives for one window. The first request
/// creates it and starts its expiry; later requests only increment. When the key expires
/// the next request starts a fresh window.
pub struct FixedWindow<B: ?Sized> {
    backend: Arc<B>,
    config: LimiterConfig,
    window: ArcSwap<RateWindow>,
}

impl<B> FixedWindow<B>
where
    B: KvBackend + ?Sized + 'static,
{
    /// Create a limiter backed by `backend`. Invalid windows or quotas are rejected here.
    pub fn new(backend: Arc<B>, config: LimiterConfig) -> Result<Self, ConfigError> {
        let window = config.rate_window()?;
        Ok(Self { backend, config, window: ArcSwap::from_pointee(window) })
    }

    /// Current window and quota.
    pub fn window(&self) -> RateWindow {
        **self.window.load()
    }

    /// Swap the window live. Counters already running keep their original expiry.
    pub fn set_window(&self, window: RateWindow) {
        self.window.store(Arc::new(window));
    }

    /// Forget the counter for one caller and path.
    pub async fn reset(&self, identity: &str, path: &str) -> Result<(), BackendError> {
        let key = self.config.derive_key(identity, path);
        self.backend.delete(key.as_str()).await
    }

    /// Time until `key`'s window ends.
    ///
    /// A counter without an expiry (its `EXPIRE` was lost) gets one here, so it cannot
    /// block the caller forever. A counter about to expire reports the minimum wait and is
    /// left alone.
    async fn time_to_reset(&self, key: &RateKey, window: RateWindow) -> Duration {
        match self.backend.ttl(key.as_str()).await {
            Ok(Some(ttl)) => ttl.max(MIN_WAIT),
            Ok(None) => {
                tracing::debug!(target: "gatehouse::rate_limit", key = %key, "counter had no expiry; repairing");
                if let Err(e) = self.backend.set_expiry(key.as_str(), window.window()).await {
                    tracing::debug!(target: "gatehouse::rate_limit", key = %key, error = %e, "expiry repair failed");
                }
                window.window()
            }
            Err(e) => {
                tracing::debug!(target: "gatehouse::rate_limit", key = %key, error = %e, "ttl lookup failed");
                window.window()
            }
        }
    }
}

#[async_trait]
impl<B> RateLimiter for FixedWindow<B>
where
    B: KvBackend + ?Sized + 'static,
{
    async fn check(&self, identity: &str, path: &str) -> Result<Decision, BackendError> {
        if self.config.is_bypassed(path) {
            return Ok(Decision::Bypassed);
        }

        let window = self.window();
        let key = self.config.derive_key(identity, path);
        let count = self.backend.increment_window(key.as_str(), window.window()).await?;
        let limit = window.quota();

        if count <= i64::from(limit) {
            let remaining = u32::try_from(i64::from(limit) - count).unwrap_or(0);
            return Ok(Decision::Allowed { key, count, limit, remaining });
        }

        let wait = self.time_to_reset(&key, window).await;
        Ok(Decision::Denied { key, count, limit, wait })
    }

    fn config(&self) -> &LimiterConfig {
        &self.config
    }
}
