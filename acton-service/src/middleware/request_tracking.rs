//! Sensitive-header masking for trace spans. Request-ID assignment itself
//! lives in [`crate::context`], which validates or generates the
//! correlation id per the gateway's own rules rather than a generic layer.

use tower_http::sensitive_headers::{SetSensitiveRequestHeadersLayer, SetSensitiveResponseHeadersLayer};

/// Headers masked from trace spans and structured logs by default.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "proxy-authorization",
];

pub fn sensitive_headers_layer() -> SetSensitiveRequestHeadersLayer {
    let headers = SENSITIVE_HEADERS
        .iter()
        .map(|h| h.parse().expect("valid header name"))
        .collect::<Vec<_>>();

    SetSensitiveRequestHeadersLayer::new(headers)
}

/// `set-cookie` is a response header, so masking it from spans needs the
/// response-side counterpart to [`sensitive_headers_layer`] as well.
pub fn sensitive_response_headers_layer() -> SetSensitiveResponseHeadersLayer {
    let headers = SENSITIVE_HEADERS
        .iter()
        .map(|h| h.parse().expect("valid header name"))
        .collect::<Vec<_>>();

    SetSensitiveResponseHeadersLayer::new(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensitive_headers_constant_covers_credentials() {
        assert!(SENSITIVE_HEADERS.contains(&"authorization"));
        assert!(SENSITIVE_HEADERS.contains(&"cookie"));
    }
}
