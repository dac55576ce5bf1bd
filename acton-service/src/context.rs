//! Per-request context: correlation id, matched route, principal, and the
//! checkpoints the observability stage needs to compute durations.
//!
//! A [`RequestContext`] is created once by the correlation stage and carried
//! through the rest of the pipeline via [`axum::http::Extensions`]. It is
//! append-only: later stages add fields, none rewrite what an earlier stage
//! set.

use std::time::Instant;

use axum::http::HeaderMap;
use rand::RngCore;

use crate::auth::Principal;
use crate::router::CompiledRoute;

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_CORRELATION_ID_LEN: usize = 128;

/// Outcome of the rate-limit stage, carried into the response-log record.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub key: String,
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_seconds: u64,
}

/// Per-request record threaded through the pipeline via request extensions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub correlation_id: String,
    pub arrival: Instant,
    pub route: Option<CompiledRoute>,
    pub path_params: Vec<(String, String)>,
    pub principal: Option<Principal>,
    pub rate_limit: Option<RateLimitDecision>,
    pub upstream_start: Option<Instant>,
    pub upstream_end: Option<Instant>,
    /// Set when the token validator rotated a near-expiry session; the
    /// finishing stage emits this as the response's `Set-Cookie`.
    pub refreshed_session_cookie: Option<String>,
}

impl RequestContext {
    /// Build a new context, extracting or minting the correlation id per
    /// the stage pipeline's contract: use `X-Request-ID` if present and
    /// syntactically valid (printable ASCII, <=128 chars), else a fresh
    /// random 128-bit id, URL-safe base64 encoded.
    pub fn new(headers: &HeaderMap) -> Self {
        let correlation_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|s| is_valid_correlation_id(s))
            .map(|s| s.to_string())
            .unwrap_or_else(generate_correlation_id);

        Self {
            correlation_id,
            arrival: Instant::now(),
            route: None,
            path_params: Vec::new(),
            principal: None,
            rate_limit: None,
            upstream_start: None,
            upstream_end: None,
            refreshed_session_cookie: None,
        }
    }

    pub fn route_id(&self) -> Option<&str> {
        self.route.as_ref().map(|r| r.id.as_str())
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn total_duration_ms(&self) -> u128 {
        self.arrival.elapsed().as_millis()
    }

    pub fn upstream_duration_ms(&self) -> Option<u128> {
        match (self.upstream_start, self.upstream_end) {
            (Some(start), Some(end)) => Some(end.duration_since(start).as_millis()),
            _ => None,
        }
    }
}

fn is_valid_correlation_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_CORRELATION_ID_LEN
        && s.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

fn generate_correlation_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    base64_url_no_pad(&bytes)
}

fn base64_url_no_pad(bytes: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn accepts_valid_incoming_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("abc-123"));
        let ctx = RequestContext::new(&headers);
        assert_eq!(ctx.correlation_id, "abc-123");
    }

    #[test]
    fn rejects_oversized_incoming_request_id() {
        let mut headers = HeaderMap::new();
        let huge = "a".repeat(200);
        headers.insert(
            REQUEST_ID_HEADER,
            HeaderValue::from_str(&huge).unwrap(),
        );
        let ctx = RequestContext::new(&headers);
        assert_ne!(ctx.correlation_id, huge);
        assert!(ctx.correlation_id.len() <= MAX_CORRELATION_ID_LEN);
    }

    #[test]
    fn generates_fresh_id_when_absent() {
        let headers = HeaderMap::new();
        let a = RequestContext::new(&headers);
        let b = RequestContext::new(&headers);
        assert_ne!(a.correlation_id, b.correlation_id);
        assert!(!a.correlation_id.is_empty());
    }

    #[test]
    fn rejects_control_characters() {
        let mut headers = HeaderMap::new();
        // HeaderValue rejects raw control bytes at construction already,
        // but a tab is a valid header byte and not printable-graphic.
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("a\tb"));
        let ctx = RequestContext::new(&headers);
        assert_ne!(ctx.correlation_id, "a\tb");
    }
}
