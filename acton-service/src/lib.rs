//! # acton-service
//!
//! HTTP reverse-proxy API gateway: a runtime-configured routing table in
//! front of one or more upstream services, with session/signed-token
//! authentication, permission-based authorization, and per-route rate
//! limiting, all driven by a single layered configuration.
//!
//! ## Example
//!
//! ```rust,no_run
//! use acton_service::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let state = AppState::new(config.clone()).await?;
//!     Server::new(config, state).serve().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod authorize;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod middleware;
pub mod observability;
pub mod pipeline;
pub mod proxy;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod state;

#[cfg(feature = "tls")]
pub mod tls;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::auth::{Principal, SessionStore, TokenValidator};
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::error::{Error, ErrorResponse, Result};
    pub use crate::observability::{init_tracing, Metrics};
    pub use crate::proxy::UpstreamClient;
    pub use crate::rate_limit::{RateLimitAlgorithm, RateLimitRule, RateLimitStore, RateLimiter};
    pub use crate::router::{CompiledRoute, Route, Router};
    pub use crate::server::Server;
    pub use crate::state::AppState;

    pub use axum::{
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, Method, StatusCode},
        response::{IntoResponse, Json, Response},
        routing::{delete, get, patch, post, put},
        Router as AxumRouter,
    };

    pub use serde::{Deserialize, Serialize};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}
