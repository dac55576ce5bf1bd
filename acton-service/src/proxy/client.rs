//! Upstream Client: one pooled `reqwest::Client` per process forwarding
//! requests to the route's upstream, streaming the body both ways.

use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use axum::response::Response;
use futures::StreamExt;

use crate::config::UpstreamConfig;
use crate::context::RequestContext;
use crate::error::{Error, Result};
use crate::router::CompiledRoute;

/// Headers that apply to a single transport hop and must never be forwarded.
/// Any `Proxy-*` header is dropped separately by prefix, not listed here.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const IDEMPOTENT_METHODS: &[Method] = &[
    Method::GET,
    Method::HEAD,
    Method::PUT,
    Method::DELETE,
    Method::OPTIONS,
];

/// Ceiling on a request body that is buffered to make a `PUT` retryable.
/// Bodies larger than this (or with no declared `Content-Length`) forward
/// as a single-attempt stream instead, since a stream can't be replayed.
const MAX_RETRYABLE_BODY_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

/// Forwards a request upstream using one pooled client for the whole
/// process; reqwest handles per-host pooling internally.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    max_request_body_bytes: u64,
    connect_timeout: Duration,
    read_timeout: Duration,
    overall_timeout: Duration,
    retry: Option<RetryPolicy>,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_per_host as usize)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_seconds))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build upstream client: {}", e)))?;

        Ok(Self {
            http,
            max_request_body_bytes: config.max_request_body_bytes,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            read_timeout: Duration::from_millis(config.read_timeout_ms),
            overall_timeout: Duration::from_millis(config.overall_timeout_ms),
            retry: config.retry_idempotent.then_some(RetryPolicy {
                max_attempts: config.retry_max_attempts,
                base_delay_ms: config.retry_base_delay_ms,
            }),
        })
    }

    /// Forward `req` to `route.upstream_base` plus the path suffix after
    /// the matched prefix, preserving the query string. Streams the request
    /// body and enforces the configured size limit while doing so.
    pub async fn forward(
        &self,
        req: Request,
        route: &CompiledRoute,
        ctx: &mut RequestContext,
        client_ip: &str,
        path_suffix: &str,
        query: Option<&str>,
    ) -> Result<Response> {
        let method = req.method().clone();
        let (parts, body) = req.into_parts();

        let url = build_upstream_url(&route.upstream_base, path_suffix, query);
        let upstream_method = to_reqwest_method(&method)?;

        let mut headers = build_forwarded_headers(
            &parts.headers,
            &route.upstream_base,
            client_ip,
            &ctx.correlation_id,
            route.pass_session,
        )?;
        headers.remove(axum::http::header::CONTENT_LENGTH);

        let connect_timeout = route.connect_timeout_ms.map(Duration::from_millis).unwrap_or(self.connect_timeout);
        let read_timeout = route.read_timeout_ms.map(Duration::from_millis).unwrap_or(self.read_timeout);
        let overall_timeout = route.overall_timeout_ms.map(Duration::from_millis).unwrap_or(self.overall_timeout);
        let request_timeout = overall_timeout.min(read_timeout);
        let outer_deadline = connect_timeout.max(request_timeout);

        let has_body = !matches!(method, Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS);
        let idempotent = IDEMPOTENT_METHODS.contains(&method);
        let content_length = parts
            .headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        // A streamed body can only be sent once, so a request carrying one
        // only retries if it's small enough to buffer up front and replay;
        // otherwise a retry after a partially-consumed stream would resend
        // an incomplete or wrong body.
        let buffer_for_retry = has_body
            && idempotent
            && self.retry.is_some()
            && content_length.is_some_and(|len| len <= MAX_RETRYABLE_BODY_BYTES);

        ctx.upstream_start = Some(std::time::Instant::now());

        if has_body && !buffer_for_retry {
            let bounded = bounded_body_stream(body, self.max_request_body_bytes);
            let reqwest_body = reqwest::Body::wrap_stream(bounded.map(|item| {
                item.map_err(|e| std::io::Error::other(e.to_string()))
            }));
            let request = self
                .http
                .request(upstream_method, url)
                .headers(headers)
                .timeout(request_timeout)
                .body(reqwest_body);

            return self.send_once(request, outer_deadline, ctx).await;
        }

        let buffered_body = if buffer_for_retry {
            Some(buffer_body(body, self.max_request_body_bytes).await?)
        } else {
            None
        };

        let attempts = if idempotent {
            self.retry.map(|r| r.max_attempts).unwrap_or(1)
        } else {
            1
        };

        let mut last_err = None;
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                let delay = self.retry.map(|r| r.base_delay_ms).unwrap_or(0) * 2u64.pow(attempt - 1);
                let jitter = rand::random::<u64>() % (delay.max(1));
                tokio::time::sleep(Duration::from_millis(delay + jitter)).await;
            }

            let mut request = self
                .http
                .request(upstream_method.clone(), url.clone())
                .headers(headers.clone())
                .timeout(request_timeout);
            if let Some(bytes) = &buffered_body {
                request = request.body(bytes.clone());
            }

            match self.send_once(request, outer_deadline, ctx).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(Error::BadGateway("upstream request failed".into())))
    }

    async fn send_once(
        &self,
        request: reqwest::RequestBuilder,
        outer_deadline: Duration,
        ctx: &mut RequestContext,
    ) -> Result<Response> {
        match tokio::time::timeout(outer_deadline, request.send()).await {
            Ok(Ok(response)) => {
                ctx.upstream_end = Some(std::time::Instant::now());
                build_client_response(response).await
            }
            Ok(Err(e)) => {
                ctx.upstream_end = Some(std::time::Instant::now());
                Err(Error::from(e))
            }
            Err(_) => {
                ctx.upstream_end = Some(std::time::Instant::now());
                Err(Error::GatewayTimeout)
            }
        }
    }
}

/// Buffer a request body fully so it can be replayed across retry attempts.
/// Still enforced against the overall per-request size limit.
async fn buffer_body(body: Body, max_bytes: u64) -> Result<Bytes> {
    use http_body_util::BodyExt;

    let collected = body
        .collect()
        .await
        .map_err(|e| Error::BadRequest(format!("failed to read request body: {}", e)))?;
    let bytes = collected.to_bytes();
    if bytes.len() as u64 > max_bytes {
        return Err(Error::PayloadTooLarge);
    }
    Ok(bytes)
}

fn to_reqwest_method(method: &Method) -> Result<reqwest::Method> {
    reqwest::Method::from_bytes(method.as_str().as_bytes())
        .map_err(|_| Error::BadRequest("unsupported method".into()))
}

fn build_upstream_url(upstream_base: &str, path_suffix: &str, query: Option<&str>) -> String {
    let base = upstream_base.trim_end_matches('/');
    let suffix = if path_suffix.starts_with('/') {
        path_suffix.to_string()
    } else {
        format!("/{}", path_suffix)
    };
    match query {
        Some(q) if !q.is_empty() => format!("{}{}?{}", base, suffix, q),
        _ => format!("{}{}", base, suffix),
    }
}

/// Drop hop-by-hop headers (including any named in `Connection`), rewrite
/// `Host`, append `X-Forwarded-For`, set `X-Forwarded-Proto`/`X-Request-ID`,
/// strip the session cookie unless the route passes it through, and reject
/// any header whose name or value contains CR/LF.
fn build_forwarded_headers(
    inbound: &HeaderMap,
    upstream_base: &str,
    client_ip: &str,
    correlation_id: &str,
    pass_session: bool,
) -> Result<HeaderMap> {
    let mut drop_names: Vec<String> = HOP_BY_HOP.iter().map(|s| s.to_string()).collect();
    if let Some(connection) = inbound.get(axum::http::header::CONNECTION) {
        if let Ok(value) = connection.to_str() {
            drop_names.extend(value.split(',').map(|s| s.trim().to_lowercase()));
        }
    }

    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        let lower = name.as_str().to_lowercase();
        if lower.starts_with("proxy-") || drop_names.iter().any(|d| d == &lower) {
            continue;
        }
        if lower == "cookie" && !pass_session {
            // Session cookie stripped; non-session cookies would need a
            // per-cookie allowlist, out of scope for this gateway's cookie
            // of interest.
            continue;
        }
        let bytes = value.as_bytes();
        if bytes.contains(&b'\r') || bytes.contains(&b'\n') {
            return Err(Error::BadRequest("header value contains CR/LF".into()));
        }
        out.append(name.clone(), value.clone());
    }

    if let Ok(host) = extract_authority(upstream_base) {
        out.insert(axum::http::header::HOST, HeaderValue::from_str(&host)
            .map_err(|_| Error::BadRequest("invalid upstream host".into()))?);
    }

    let forwarded_for = match out.get("x-forwarded-for") {
        Some(existing) => format!("{}, {}", existing.to_str().unwrap_or(""), client_ip),
        None => client_ip.to_string(),
    };
    out.insert(
        HeaderName::from_static("x-forwarded-for"),
        HeaderValue::from_str(&forwarded_for)
            .map_err(|_| Error::BadRequest("invalid client IP".into()))?,
    );
    let proto = if upstream_base.starts_with("https") { "https" } else { "http" };
    out.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static(proto),
    );
    out.insert(
        HeaderName::from_static("x-request-id"),
        HeaderValue::from_str(correlation_id)
            .map_err(|_| Error::Internal("correlation id not a valid header value".into()))?,
    );

    Ok(out)
}

fn extract_authority(upstream_base: &str) -> std::result::Result<String, ()> {
    let without_scheme = upstream_base
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(upstream_base);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    if authority.is_empty() {
        Err(())
    } else {
        Ok(authority.to_string())
    }
}

/// Wraps the incoming body so that exceeding `max_bytes` produces a
/// `PayloadTooLarge` without buffering the whole request first.
fn bounded_body_stream(
    body: Body,
    max_bytes: u64,
) -> impl futures::Stream<Item = Result<Bytes>> + Send + 'static {
    use http_body_util::BodyStream;

    let mut seen: u64 = 0;
    BodyStream::new(body).filter_map(move |frame| {
        let max_bytes = max_bytes;
        let result = frame
            .map_err(|e| Error::BadRequest(format!("failed to read request body: {}", e)))
            .and_then(|frame| {
                frame
                    .into_data()
                    .map_err(|_| Error::BadRequest("unsupported trailer frame".into()))
            })
            .and_then(|data| {
                seen += data.len() as u64;
                if seen > max_bytes {
                    Err(Error::PayloadTooLarge)
                } else {
                    Ok(data)
                }
            });
        futures::future::ready(Some(result))
    })
}

/// Stream status, headers, and body back, adding gateway-owned security
/// headers where upstream did not already set them.
async fn build_client_response(upstream: reqwest::Response) -> Result<Response> {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let stream = upstream.bytes_stream();
    let body = Body::from_stream(stream.map(|r| {
        r.map_err(|e| std::io::Error::other(e.to_string()))
    }));

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in headers.iter() {
        let lower = name.as_str().to_lowercase();
        if lower.starts_with("proxy-") || HOP_BY_HOP.iter().any(|h| *h == lower) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    builder
        .body(body)
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}
