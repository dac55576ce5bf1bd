//! Health check handlers, served on the admin port outside the main pipeline.

use std::collections::HashMap;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Liveness response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Readiness response body with per-dependency detail.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub service: String,
    pub dependencies: HashMap<String, DependencyStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Liveness probe: 200 iff the process is running. Never touches the
/// Session Store or Rate-Limit Store, so a slow dependency never flaps
/// liveness and triggers an unnecessary restart.
pub async fn live(State(_state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "alive".to_string(),
        service: "acton-service".to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
    };
    (StatusCode::OK, Json(response))
}

/// Readiness probe: 200 iff the Session Store and Rate-Limit Store both
/// answer a ping. 503 otherwise, so the load balancer stops sending
/// traffic within one probe interval of a dependency outage.
pub async fn ready(State(state): State<AppState>) -> impl IntoResponse {
    let mut dependencies = HashMap::new();
    let mut all_ready = true;

    match state.session_store.ping().await {
        Ok(()) => {
            dependencies.insert(
                "session_store".to_string(),
                DependencyStatus {
                    healthy: true,
                    message: None,
                },
            );
        }
        Err(e) => {
            all_ready = false;
            dependencies.insert(
                "session_store".to_string(),
                DependencyStatus {
                    healthy: false,
                    message: Some(e.to_string()),
                },
            );
        }
    }

    match state.rate_limiter.store_ping().await {
        Ok(()) => {
            dependencies.insert(
                "rate_limit_store".to_string(),
                DependencyStatus {
                    healthy: true,
                    message: None,
                },
            );
        }
        Err(e) => {
            all_ready = false;
            dependencies.insert(
                "rate_limit_store".to_string(),
                DependencyStatus {
                    healthy: false,
                    message: Some(e.to_string()),
                },
            );
        }
    }

    state.metrics.set_store_available(all_ready);

    let response = ReadinessResponse {
        ready: all_ready,
        service: "acton-service".to_string(),
        dependencies,
    };

    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}

/// `/metrics` admin endpoint: Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
