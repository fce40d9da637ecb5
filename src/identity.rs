//! Caller identity extraction.

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, Request};
use std::net::SocketAddr;

/// Identity used when nothing identifies the caller.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Resolve the caller's identity (normally its IP address) from a request.
///
/// Order: first `X-Forwarded-For` entry, then `X-Real-IP` (both only when `trust_proxy`),
/// then the peer address from axum's `ConnectInfo`, then [`UNKNOWN_IDENTITY`].
pub fn caller_identity<B>(req: &Request<B>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = forwarded_identity(req.headers()) {
            return ip;
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_IDENTITY.to_string())
}

fn forwarded_identity(headers: &HeaderMap) -> Option<String> {
    let from_forwarded_for = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let from_real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    from_forwarded_for.or_else(from_real_ip).map(str::to_string)
}
