//! Admission policy: window/quota pairs and per-limiter configuration.
//!
//! [`LimiterConfig`] is what services write (by hand, from a [`presets`](crate::presets)
//! constructor, or from JSON). [`RateWindow`] is the validated core the limiter runs on;
//! building one is where bad values are rejected, so a misconfigured process fails at
//! startup.
//!
//! ```rust
//! use gatehouse::LimiterConfig;
//!
//! let config = LimiterConfig::from_json(r#"{ "window_ms": 60000, "quota": 10, "extra": 1 }"#)
//!     .unwrap();
//! assert_eq!(config.quota, 10);
//! assert!(config.is_bypassed("/health")); // missing fields keep their defaults
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default window: 15 minutes.
pub const DEFAULT_WINDOW_MS: u64 = 15 * 60 * 1000;
/// Default quota per window.
pub const DEFAULT_QUOTA: u32 = 100;
/// Path exempt from limiting unless configured otherwise.
pub const DEFAULT_BYPASS_PATH: &str = "/health";
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Custom key derivation: `(identity, path) -> key`.
pub type KeyFn = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// A validated fixed window: at most `quota` requests per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    window: Duration,
    quota: u32,
}

impl RateWindow {
    /// Shortest window the limiter accepts.
    pub const MIN_WINDOW: Duration = Duration::from_secs(1);

    pub fn new(window: Duration, quota: u32) -> Result<Self, ConfigError> {
        if quota == 0 {
            return Err(ConfigError::QuotaZero);
        }
        if window < Self::MIN_WINDOW {
            return Err(ConfigError::WindowTooShort(window));
        }
        Ok(Self { window, quota })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn quota(&self) -> u32 {
        self.quota
    }
}

/// Counter key for one `(identity, path)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateKey(String);

impl RateKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration for one rate limiter instance.
///
/// Deserializes with every field optional; unknown fields are ignored.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    #[serde(alias = "windowMs")]
    pub window_ms: u64,
    pub quota: u32,
    /// Paths never limited by this instance.
    #[serde(alias = "bypassPaths")]
    pub bypass_paths: BTreeSet<String>,
    /// Message returned in the 429 body.
    pub message: String,
    /// Namespace for counter keys, so different limiters never share counters.
    #[serde(alias = "keyPrefix")]
    pub key_prefix: String,
    /// Honour `X-Forwarded-For` / `X-Real-IP` when identifying callers.
    #[serde(alias = "trustProxy")]
    pub trust_proxy: bool,
    #[serde(skip)]
    pub key_fn: Option<KeyFn>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: DEFAULT_WINDOW_MS,
            quota: DEFAULT_QUOTA,
            bypass_paths: BTreeSet::from([DEFAULT_BYPASS_PATH.to_string()]),
            message: DEFAULT_MESSAGE.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            trust_proxy: false,
            key_fn: None,
        }
    }
}

impl fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("window_ms", &self.window_ms)
            .field("quota", &self.quota)
            .field("bypass_paths", &self.bypass_paths)
            .field("message", &self.message)
            .field("key_prefix", &self.key_prefix)
            .field("trust_proxy", &self.trust_proxy)
            .field("key_fn", &self.key_fn.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl LimiterConfig {
    pub fn new(window: Duration, quota: u32) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            quota,
            ..Self::default()
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn bypass(mut self, path: impl Into<String>) -> Self {
        self.bypass_paths.insert(path.into());
        self
    }

    pub fn without_bypass(mut self) -> Self {
        self.bypass_paths.clear();
        self
    }

    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.trust_proxy = trust;
        self
    }

    pub fn with_key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    /// Validate and return the window this config describes.
    pub fn rate_window(&self) -> Result<RateWindow, ConfigError> {
        if self.key_prefix.trim().is_empty() && self.key_fn.is_none() {
            return Err(ConfigError::EmptyPrefix);
        }
        RateWindow::new(Duration::from_millis(self.window_ms), self.quota)
    }

    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass_paths.contains(path)
    }

    /// `{prefix}:{identity}:{path}` unless a custom `key_fn` is set.
    pub fn derive_key(&self, identity: &str, path: &str) -> RateKey {
        match &self.key_fn {
            Some(key_fn) => RateKey(key_fn(identity, path)),
            None => RateKey(format!("{}:{}:{}", self.key_prefix, identity, path)),
        }
    }
}
