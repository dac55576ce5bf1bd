//! Entry server: the main listener runs the Stage Pipeline behind admission
//! control and the tower-http stack; a second listener on the admin bind
//! address serves health and metrics outside that pipeline so a saturated
//! gateway can still answer its own liveness probe.

use std::net::SocketAddr;

use axum::error_handling::HandleErrorLayer;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router as AxumRouter;
use tokio::net::TcpListener;
use tokio::signal;
use tower::limit::ConcurrencyLimitLayer;
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::CorsLayer,
    limit::RequestBodyLimitLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::config::Config;
use crate::error::Result;
use crate::health;
use crate::middleware::security_headers::apply_security_headers;
use crate::middleware::request_tracking::{sensitive_headers_layer, sensitive_response_headers_layer};
use crate::pipeline;
use crate::state::AppState;

/// Entry server instance, built from a loaded configuration and shared state.
pub struct Server {
    config: Config,
    state: AppState,
}

impl Server {
    pub fn new(config: Config, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run both listeners until a shutdown signal arrives, then drain
    /// in-flight requests before returning.
    pub async fn serve(self) -> Result<()> {
        let main_addr: SocketAddr = format!("{}:{}", self.config.server.bind_address, self.config.server.port)
            .parse()
            .map_err(|e| crate::error::Error::Internal(format!("invalid bind address: {e}")))?;
        let admin_addr: SocketAddr = self
            .config
            .health
            .bind_address
            .parse()
            .map_err(|e| crate::error::Error::Internal(format!("invalid admin bind address: {e}")))?;

        let tls_enabled = self.config.server.tls.as_ref().is_some_and(|t| t.enabled);
        let app = self.build_app(tls_enabled);
        let admin_app = build_admin_app(self.state.clone());

        let admin_listener = TcpListener::bind(admin_addr).await?;
        tracing::info!(addr = %admin_addr, "admin server listening");
        let admin_server = axum::serve(admin_listener, admin_app.into_make_service())
            .with_graceful_shutdown(shutdown_signal());

        #[cfg(feature = "tls")]
        {
            if tls_enabled {
                let tls_config = self.config.server.tls.as_ref().expect("checked by tls_enabled");
                let server_config = crate::tls::load_server_config(tls_config)?;
                let tcp = TcpListener::bind(main_addr).await?;
                let listener = crate::tls::TlsListener::new(tcp, server_config);
                tracing::info!(addr = %main_addr, "entry server listening (tls)");
                let main_server = axum::serve(
                    listener,
                    app.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(shutdown_signal());
                let (main_result, admin_result) = tokio::join!(main_server, admin_server);
                main_result?;
                admin_result?;
                tracing::info!("server shutdown complete");
                return Ok(());
            }
        }

        let main_listener = TcpListener::bind(main_addr).await?;
        tracing::info!(addr = %main_addr, "entry server listening");
        let main_server = axum::serve(
            main_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal());

        let (main_result, admin_result) = tokio::join!(main_server, admin_server);
        main_result?;
        admin_result?;

        tracing::info!("server shutdown complete");
        Ok(())
    }

    fn build_app(&self, tls_enabled: bool) -> AxumRouter {
        let body_limit = self.config.server.request_body_max as usize;
        let max_in_flight = self.config.server.max_in_flight;

        let admission = ServiceBuilder::new()
            .layer(HandleErrorLayer::new(overloaded))
            .load_shed()
            .concurrency_limit(max_in_flight);

        let app = AxumRouter::new()
            .fallback(pipeline::handle)
            .with_state(self.state.clone())
            .layer(
                ServiceBuilder::new()
                    .layer(admission)
                    .layer(CatchPanicLayer::new())
                    .layer(sensitive_headers_layer())
                    .layer(
                        TraceLayer::new_for_http()
                            .make_span_with(DefaultMakeSpan::new().include_headers(false))
                            .on_response(DefaultOnResponse::new().include_headers(false)),
                    )
                    .layer(sensitive_response_headers_layer())
                    .layer(RequestBodyLimitLayer::new(body_limit))
                    .layer(CompressionLayer::new())
                    .layer(self.build_cors_layer()),
            );

        apply_security_headers(app, &self.config.server.security_headers, tls_enabled)
    }

    fn build_cors_layer(&self) -> CorsLayer {
        CorsLayer::permissive()
    }
}

async fn overloaded(_err: tower::BoxError) -> (StatusCode, &'static str) {
    (StatusCode::SERVICE_UNAVAILABLE, "too many in-flight requests")
}

/// Cap on concurrent requests to the admin listener, separate from
/// `server.max_in_flight`: a gateway saturated on the entry port should
/// still be able to answer its own probes, but unbounded concurrency here
/// would let a probe storm starve the same tokio runtime.
const ADMIN_CONCURRENCY_LIMIT: usize = 64;

fn build_admin_app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .route("/metrics", get(health::metrics))
        .layer(ConcurrencyLimitLayer::new(ADMIN_CONCURRENCY_LIMIT))
        .with_state(state)
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("received SIGTERM, starting graceful shutdown"),
    }

    tracing::info!("shutdown signal received, draining requests");
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
    async fn builds_app_router_without_panicking() {
        let config = test_config();
        let state = AppState::new(config.clone()).await.unwrap();
        let server = Server::new(config, state);
        let _app = server.build_app(false);
    }

    #[tokio::test]
    async fn admin_app_serves_health_and_metrics_routes() {
        let config = test_config();
        let state = AppState::new(config).await.unwrap();
        let _admin_app = build_admin_app(state);
    }
}
