//! Policy-violation responses.
//!
//! A rejected request is not an error in this crate: stages return a [`Rejection`], which
//! renders as the structured JSON body clients expect.

use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;

/// Message sent with 403 responses for blocked callers.
pub const BLOCKED_MESSAGE: &str = "Access denied";

pub(crate) const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub(crate) const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Quota for the current window is used up (HTTP 429).
    RateLimited { message: String, retry_after: Duration, limit: u32 },
    /// The caller is on the blocklist (HTTP 403).
    Blocked { message: String },
}

impl Rejection {
    pub fn blocked() -> Self {
        Rejection::Blocked { message: BLOCKED_MESSAGE.to_string() }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Rejection::Blocked { .. } => StatusCode::FORBIDDEN,
        }
    }

    /// Whole seconds until retrying makes sense (rate limits only).
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Rejection::RateLimited { retry_after, .. } => Some(ceil_secs(*retry_after)),
            Rejection::Blocked { .. } => None,
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    (d.as_secs() + u64::from(d.subsec_nanos() > 0)).max(1)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionBody<'a> {
    status: &'static str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after_secs();
        let message = match &self {
            Rejection::RateLimited { message, .. } | Rejection::Blocked { message } => message,
        };
        let body = RejectionBody { status: "error", message, retry_after };
        let mut response = (status, Json(body)).into_response();

        if let Rejection::RateLimited { limit, .. } = &self {
            let headers = response.headers_mut();
            if let Some(secs) = retry_after {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            headers.insert(RATELIMIT_LIMIT, HeaderValue::from(*limit));
            headers.insert(RATELIMIT_REMAINING, HeaderValue::from(0u32));
        }
        response
    }
}
