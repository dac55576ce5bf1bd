//! Application state shared across handlers and pipeline stages.

use std::sync::Arc;

use crate::auth::session_store::{InMemorySessionStore, SessionStore};
use crate::auth::TokenValidator;
use crate::config::Config;
use crate::error::Result;
use crate::observability::Metrics;
use crate::proxy::UpstreamClient;
use crate::rate_limit::store::{InMemoryRateLimitStore, RateLimitStore};
use crate::rate_limit::RateLimiter;
use crate::router::Router;

#[cfg(feature = "cache")]
use crate::auth::session_store::RedisSessionStore;
#[cfg(feature = "cache")]
use crate::rate_limit::store::RedisRateLimitStore;

/// Everything a pipeline stage needs, built once at startup and shared via
/// an `Arc` across every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub router: Arc<Router>,
    pub session_store: Arc<dyn SessionStore>,
    pub token_validator: Arc<TokenValidator>,
    pub rate_limiter: Arc<RateLimiter<dyn RateLimitStore>>,
    pub upstream: Arc<UpstreamClient>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Build state from a loaded configuration: compile routes, select the
    /// Session Store and Rate-Limit Store backend, and construct the
    /// pooled upstream client.
    pub async fn new(config: Config) -> Result<Self> {
        let routes = config.build_routes()?;
        let router = Arc::new(Router::new(routes)?);

        let (session_store, rate_limit_store): (Arc<dyn SessionStore>, Arc<dyn RateLimitStore>) =
            match config.store.backend.as_str() {
                #[cfg(feature = "cache")]
                "redis" => {
                    let redis_url = config
                        .store
                        .redis_url
                        .clone()
                        .expect("validated at config load: redis backend requires redis_url");
                    let cfg = deadpool_redis::Config::from_url(redis_url);
                    let pool = cfg
                        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
                        .map_err(|e| crate::error::Error::Store(e.to_string()))?;
                    (
                        Arc::new(RedisSessionStore::new(pool.clone())),
                        Arc::new(RedisRateLimitStore::new(pool)),
                    )
                }
                #[cfg(not(feature = "cache"))]
                "redis" => {
                    return Err(crate::error::Error::Config(Box::new(figment::Error::from(
                        "store.backend = \"redis\" requires the \"cache\" feature".to_string(),
                    ))));
                }
                _ => (
                    Arc::new(InMemorySessionStore::new()),
                    Arc::new(InMemoryRateLimitStore::new()),
                ),
            };

        let token_validator = Arc::new(TokenValidator::new(config.session.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(rate_limit_store));
        let upstream = Arc::new(UpstreamClient::new(&config.upstream)?);
        let metrics = Arc::new(Metrics::new());

        Ok(Self {
            config: Arc::new(config),
            router,
            session_store,
            token_validator,
            rate_limiter,
            upstream,
            metrics,
        })
    }
}
