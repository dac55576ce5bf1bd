//! Stage Pipeline: every request that reaches the entry port passes through
//! this fixed sequence — correlation, route resolution, authentication,
//! authorization, rate limiting, then the upstream proxy. Each stage can
//! short-circuit with an [`Error`], which the recovery step at the bottom
//! is the single place that turns into an HTTP response.
//!
//! The gateway's routing table is a runtime-configured list of regex
//! patterns (see [`crate::router`]), not a static tree axum can dispatch
//! on directly, so the whole pipeline runs as one fallback handler rather
//! than a chain of `axum::middleware::from_fn` layers over named routes.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};

use crate::auth::{extract_token, Principal};
use crate::context::RequestContext;
use crate::error::Error;
use crate::router::normalize_path;
use crate::state::AppState;

pub async fn handle(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    let mut ctx = RequestContext::new(req.headers());
    let client_ip = peer.ip().to_string();
    let method = req.method().clone();
    let path = normalize_path(req.uri().path());
    let query = req.uri().query().map(|q| q.to_string());

    state.metrics.in_flight_inc();
    let outcome = run(&state, &mut ctx, &client_ip, &method, &path, query.as_deref(), req).await;
    state.metrics.in_flight_dec();

    match outcome {
        Ok(response) => finish(&state, &ctx, &method, response),
        Err(error) => {
            error.log(&ctx.correlation_id, &client_ip, ctx.route_id());
            if matches!(error, Error::BadGateway(_) | Error::GatewayTimeout | Error::ServiceUnavailable(_)) {
                state.metrics.record_upstream_error(error.code());
            }
            finish(&state, &ctx, &method, error.into_response())
        }
    }
}

async fn run(
    state: &AppState,
    ctx: &mut RequestContext,
    client_ip: &str,
    method: &axum::http::Method,
    path: &str,
    query: Option<&str>,
    req: Request,
) -> Result<Response, Error> {
    let (route, params) = state.router.resolve(method, path)?;
    ctx.route = Some(route.clone());
    ctx.path_params = params;

    let (principal, refreshed_cookie) = authenticate(state, &route, req.headers(), client_ip).await?;
    crate::authorize::authorize(principal.as_ref(), &route, &state.config.authorization)?;
    ctx.principal = principal;
    ctx.refreshed_session_cookie = refreshed_cookie;

    let rule = route
        .rate_limit_rule
        .clone()
        .unwrap_or_else(|| state.config.default_rate_limit_rule());
    let user_id = ctx.principal.as_ref().map(|p| p.user_id.as_str());
    let decision = state.rate_limiter.check(&rule, client_ip, user_id, &route.id).await?;
    let allowed = decision.allowed;
    let (limit, remaining, reset_seconds) = (decision.limit, decision.remaining, decision.reset_seconds);
    ctx.rate_limit = Some(decision);

    if !allowed {
        state.metrics.record_rate_limit_denial(&route.id);
        return Err(Error::RateLimitExceeded {
            limit,
            remaining,
            reset_seconds,
        });
    }

    let path_suffix = path.to_string();
    state.metrics.upstream_pool_inc();
    let response = state
        .upstream
        .forward(req, &route, ctx, client_ip, &path_suffix, query)
        .await;
    state.metrics.upstream_pool_dec();
    let response = response?;

    if let Some(upstream_ms) = ctx.upstream_duration_ms() {
        state.metrics.record_upstream_latency(upstream_ms as f64);
    }

    Ok(response)
}

/// Extract and validate a token if the route requires auth or permission
/// checks, or if one is present anyway (so `authorize` can still see a
/// principal on an otherwise-public route with optional auth).
async fn authenticate(
    state: &AppState,
    route: &crate::router::CompiledRoute,
    headers: &axum::http::HeaderMap,
    client_ip: &str,
) -> Result<(Option<Principal>, Option<String>), Error> {
    let needs_auth = route.auth_required || !route.permission_sets.is_empty();
    let token = extract_token(headers, &state.config.session.cookie_name);

    match token {
        Some((token, source)) => {
            match state
                .token_validator
                .validate(&token, source, client_ip, route, state.session_store.as_ref())
                .await
            {
                Ok((principal, refreshed)) => Ok((Some(principal), refreshed)),
                Err(e) => {
                    state.metrics.record_auth_failure(e.code());
                    Err(e)
                }
            }
        }
        None if needs_auth => {
            state.metrics.record_auth_failure("missing_token");
            Err(Error::MissingToken)
        }
        None => Ok((None, None)),
    }
}

fn finish(state: &AppState, ctx: &RequestContext, method: &axum::http::Method, mut response: Response) -> Response {
    if let Ok(value) = HeaderValue::from_str(&ctx.correlation_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    if let Some(token) = &ctx.refreshed_session_cookie {
        let cookie_name = &state.config.session.cookie_name;
        let cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", cookie_name, token);
        if let Ok(value) = HeaderValue::from_str(&cookie) {
            response.headers_mut().insert(axum::http::header::SET_COOKIE, value);
        }
    }

    if let Some(route_id) = ctx.route_id() {
        state.metrics.record_request(
            route_id,
            method.as_str(),
            response.status().as_u16(),
            ctx.total_duration_ms() as f64,
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RouteDefinition, SessionConfig};

    fn test_config() -> Config {
        Config {
            server: crate::config::ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 0,
                tls: None,
                max_in_flight: 1024,
                request_body_max: 1024,
                require_store_on_start: false,
                security_headers: Default::default(),
            },
            routes: vec![RouteDefinition {
                id: "ping".to_string(),
                path: "/v1/ping".to_string(),
                methods: vec!["GET".to_string()],
                upstream: "http://127.0.0.1:1".to_string(),
                auth_required: false,
                permissions: vec![],
                rate_limit: None,
                timeouts: Default::default(),
                pass_session: false,
                allow_refresh: true,
                priority: 0,
            }],
            session: SessionConfig {
                cookie_name: "session_token".to_string(),
                token_kind: "opaque".to_string(),
                idle_ttl_secs: None,
                bind_ip: false,
                signing_secret: None,
                refresh_threshold_secs: None,
            },
            rate_limit: Default::default(),
            upstream: Default::default(),
            log: Default::default(),
            metrics: Default::default(),
            health: Default::default(),
            authorization: Default::default(),
            store: Default::default(),
        }
    }

    #[tokio::test]
    async fn missing_token_on_public_route_does_not_block_resolution() {
        let state = AppState::new(test_config()).await.unwrap();
        let headers = axum::http::HeaderMap::new();
        let route = state.router.resolve(&axum::http::Method::GET, "/v1/ping").unwrap().0;
        let (principal, refreshed) = authenticate(&state, &route, &headers, "10.0.0.1").await.unwrap();
        assert!(principal.is_none());
        assert!(refreshed.is_none());
    }

    #[tokio::test]
    async fn missing_token_on_protected_route_is_rejected() {
        let mut config = test_config();
        config.routes[0].auth_required = true;
        let state = AppState::new(config).await.unwrap();
        let headers = axum::http::HeaderMap::new();
        let route = state.router.resolve(&axum::http::Method::GET, "/v1/ping").unwrap().0;
        let result = authenticate(&state, &route, &headers, "10.0.0.1").await;
        assert!(matches!(result, Err(Error::MissingToken)));
    }
}
