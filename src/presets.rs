//! Named limiter policies.
//!
//! Each preset is a [`LimiterConfig`] differing only in window, quota, message, and key
//! prefix (so two presets mounted on overlapping routes never share a counter). Adjust them
//! with the builder methods before building a limiter:
//!
//! ```rust
//! use gatehouse::presets;
//!
//! let login = presets::auth().bypass("/auth/status");
//! assert_eq!(login.quota, 5);
//! assert!(login.is_bypassed("/auth/status"));
//! ```
//!
//! | preset | window | quota |
//! |--------|--------|-------|
//! | [`auth`] | 1 h | 5 |
//! | [`registration`] | 24 h | 3 |
//! | [`api`] | 15 min | 100 |
//! | [`webhook`] | 1 min | 60 |
//! | [`search`] | 5 min | 30 |

use crate::policy::LimiterConfig;
use std::time::Duration;

const HOUR: Duration = Duration::from_secs(60 * 60);
const MINUTE: Duration = Duration::from_secs(60);

const AUTH_QUOTA: u32 = 5;
const REGISTRATION_QUOTA: u32 = 3;
const API_QUOTA: u32 = 100;
const WEBHOOK_QUOTA: u32 = 60;
const SEARCH_QUOTA: u32 = 30;

/// Login and credential endpoints: 5 attempts per hour.
pub fn auth() -> LimiterConfig {
    LimiterConfig::new(HOUR, AUTH_QUOTA)
        .with_key_prefix("rl:auth")
        .with_message("Too many authentication attempts, please try again after an hour.")
}

/// Account creation: 3 per day.
pub fn registration() -> LimiterConfig {
    LimiterConfig::new(24 * HOUR, REGISTRATION_QUOTA)
        .with_key_prefix("rl:register")
        .with_message("Too many accounts created from this IP, please try again tomorrow.")
}

/// General API traffic: 100 per 15 minutes.
pub fn api() -> LimiterConfig {
    LimiterConfig::new(15 * MINUTE, API_QUOTA)
        .with_key_prefix("rl:api")
        .with_message("Too many requests from this IP, please try again later.")
}

/// Inbound webhooks from payment providers and the like: 60 per minute.
pub fn webhook() -> LimiterConfig {
    LimiterConfig::new(MINUTE, WEBHOOK_QUOTA)
        .with_key_prefix("rl:webhook")
        .with_message("Webhook rate limit exceeded.")
}

/// Search endpoints: 30 per 5 minutes.
pub fn search() -> LimiterConfig {
    LimiterConfig::new(5 * MINUTE, SEARCH_QUOTA)
        .with_key_prefix("rl:search")
        .with_message("Too many search requests, please slow down.")
}

/// Every preset with its name, for wiring loops and config dumps.
pub fn all() -> Vec<(&'static str, LimiterConfig)> {
    vec![
        ("auth", auth()),
        ("registration", registration()),
        ("api", api()),
        ("webhook", webhook()),
        ("search", search()),
    ]
}
