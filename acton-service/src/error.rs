//! Error taxonomy for the gateway.
//!
//! Every stage in the pipeline returns `Result<T>` and converts failures into
//! an [`Error`] variant. The recovery stage (the outermost layer) is the only
//! place an `Error` becomes an HTTP response, via [`IntoResponse`]. No error
//! path logs the token itself; all error paths log the correlation id,
//! client IP, route id (if known), and error kind.

use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error taxonomy, per the error handling design: kind maps to a
/// status code and a stable client-facing code.
#[derive(Debug, Error)]
pub enum Error {
    /// No token present where one was required.
    #[error("missing token")]
    MissingToken,

    /// Token present but malformed, unparseable, or signature mismatch.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// Token parsed and verified but its expiry has passed.
    #[error("token expired")]
    TokenExpired,

    /// Opaque token's session has been revoked.
    #[error("token revoked")]
    TokenRevoked,

    /// Principal authenticated but lacks a required permission.
    #[error("permission denied")]
    PermissionDenied,

    /// No route matched `(method, path)`.
    #[error("route not found")]
    RouteNotFound,

    /// A route matched the path but not the method.
    #[error("method not allowed")]
    MethodNotAllowed(Vec<Method>),

    /// Request body exceeded `server.request_body_max`.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Rate limit rule denied the request.
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        limit: u64,
        remaining: u64,
        reset_seconds: u64,
    },

    /// Malformed headers, invalid path params, header injection attempt.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Configuration failed to load or validate.
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// I/O failure (listener bind, TLS cert read, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session Store or Rate-Limit Store backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// Upstream connection refused, reset, or otherwise failed before a
    /// response was received.
    #[error("bad gateway: {0}")]
    BadGateway(String),

    /// Upstream did not respond within the configured deadline.
    #[error("gateway timeout")]
    GatewayTimeout,

    /// Server cannot currently serve the request (admission control full,
    /// a required store unreachable).
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Anything else, not expected to be reached in normal operation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error response body, per the external interface: exactly these four
/// fields, nothing that could leak internal detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
    pub timestamp: String,
}

impl ErrorResponse {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            error: code.into(),
            message: message.into(),
            correlation_id: correlation_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Error {
    /// Stable client-facing code for this error kind, per the taxonomy table.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MissingToken | Error::InvalidToken(_) => "invalid_token",
            Error::TokenExpired => "token_expired",
            Error::TokenRevoked => "token_revoked",
            Error::PermissionDenied => "forbidden",
            Error::RouteNotFound => "not_found",
            Error::MethodNotAllowed(_) => "method_not_allowed",
            Error::PayloadTooLarge => "payload_too_large",
            Error::RateLimitExceeded { .. } => "rate_limited",
            Error::BadRequest(_) => "bad_request",
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => "internal_error",
            Error::Store(_) => "service_unavailable",
            Error::BadGateway(_) => "bad_gateway",
            Error::GatewayTimeout => "gateway_timeout",
            Error::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::MissingToken
            | Error::InvalidToken(_)
            | Error::TokenExpired
            | Error::TokenRevoked => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::RouteNotFound => StatusCode::NOT_FOUND,
            Error::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Error::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Error::Store(_) | Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Error::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// User-facing message. Never the raw underlying cause for anything that
    /// could carry internal detail (store errors, config errors, I/O).
    fn public_message(&self) -> String {
        match self {
            Error::MissingToken => "authentication required".to_string(),
            Error::InvalidToken(_) => "invalid or malformed token".to_string(),
            Error::TokenExpired => "token has expired".to_string(),
            Error::TokenRevoked => "token has been revoked".to_string(),
            Error::PermissionDenied => {
                "you do not have permission to access this resource".to_string()
            }
            Error::RouteNotFound => "no route matches this request".to_string(),
            Error::MethodNotAllowed(_) => "method not allowed for this route".to_string(),
            Error::PayloadTooLarge => "request body exceeds the allowed size".to_string(),
            Error::RateLimitExceeded { .. } => "rate limit exceeded".to_string(),
            Error::BadRequest(msg) => msg.clone(),
            Error::Config(_) | Error::Io(_) | Error::Internal(_) => {
                "an internal error occurred".to_string()
            }
            Error::Store(_) | Error::ServiceUnavailable(_) => {
                "service temporarily unavailable".to_string()
            }
            Error::BadGateway(_) => "upstream returned an invalid response".to_string(),
            Error::GatewayTimeout => "upstream did not respond in time".to_string(),
        }
    }

    /// Log this error with the fields the propagation rule requires:
    /// correlation id, client IP, route id, error kind. Never the token.
    pub fn log(&self, correlation_id: &str, client_ip: &str, route_id: Option<&str>) {
        let route_id = route_id.unwrap_or("-");
        match self.status() {
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::GATEWAY_TIMEOUT => {
                tracing::error!(
                    correlation_id,
                    client_ip,
                    route_id,
                    code = self.code(),
                    "{}",
                    self
                );
            }
            _ => {
                tracing::warn!(
                    correlation_id,
                    client_ip,
                    route_id,
                    code = self.code(),
                    "{}",
                    self
                );
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Without a RequestContext extracted at this point we still owe the
        // client a correlation id; the recovery stage wraps this response
        // and rewrites the correlation_id field once it knows one. This
        // fallback only fires for errors constructed outside the pipeline.
        self.log("-", "-", None);

        let status = self.status();
        let body = ErrorResponse::new(self.code(), self.public_message(), "-");
        let mut response = (status, axum::Json(body)).into_response();

        if let Error::MethodNotAllowed(allowed) = &self {
            let joined = allowed
                .iter()
                .map(|m| m.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            if let Ok(value) = HeaderValue::from_str(&joined) {
                response
                    .headers_mut()
                    .insert(axum::http::header::ALLOW, value);
            }
        }

        if let Error::RateLimitExceeded {
            limit,
            remaining,
            reset_seconds,
        } = &self
        {
            let headers = response.headers_mut();
            headers.insert(
                "x-ratelimit-limit",
                HeaderValue::from_str(&limit.to_string()).unwrap(),
            );
            headers.insert(
                "x-ratelimit-remaining",
                HeaderValue::from_str(&remaining.to_string()).unwrap(),
            );
            headers.insert(
                "x-ratelimit-reset",
                HeaderValue::from_str(&reset_seconds.to_string()).unwrap(),
            );
            headers.insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from_str(&reset_seconds.to_string()).unwrap(),
            );
        }

        if matches!(self, Error::ServiceUnavailable(_)) {
            response
                .headers_mut()
                .insert(axum::http::header::RETRY_AFTER, HeaderValue::from_static("1"));
        }

        response
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Error::Config(Box::new(e))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::GatewayTimeout
        } else {
            Error::BadGateway(e.to_string())
        }
    }
}

#[cfg(feature = "cache")]
impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Store(e.to_string())
    }
}

#[cfg(feature = "cache")]
impl From<deadpool_redis::PoolError> for Error {
    fn from(e: deadpool_redis::PoolError) -> Self {
        Error::Store(e.to_string())
    }
}
