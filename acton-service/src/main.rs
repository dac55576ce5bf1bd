//! Gateway process entry point.
//!
//! Loads configuration, optionally verifies the configured stores are
//! reachable, then runs the entry server until a shutdown signal arrives.
//! Exit codes follow the documented contract: 0 normal shutdown, 1 config
//! invalid, 2 bind failure, 3 store unreachable at startup (only checked
//! when `server.require_store_on_start` is set).

use acton_service::config::Config;
use acton_service::observability::init_tracing;
use acton_service::server::Server;
use acton_service::state::AppState;

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_tracing(&config) {
        eprintln!("failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    tracing::info!(
        bind_address = %config.server.bind_address,
        port = config.server.port,
        routes = config.routes.len(),
        "starting gateway"
    );

    let require_store_on_start = config.server.require_store_on_start;

    let state = match AppState::new(config.clone()).await {
        Ok(state) => state,
        Err(e) => {
            eprintln!("failed to initialize application state: {e}");
            std::process::exit(1);
        }
    };

    if require_store_on_start {
        let session_ready = state.session_store.ping().await.is_ok();
        let rate_limit_ready = state.rate_limiter.store_ping().await.is_ok();
        if !session_ready || !rate_limit_ready {
            eprintln!("store unreachable at startup (require_store_on_start is set)");
            std::process::exit(3);
        }
    }

    let server = Server::new(config, state);
    match server.serve().await {
        Ok(()) => std::process::exit(0),
        Err(e @ acton_service::error::Error::Io(_)) => {
            eprintln!("failed to bind listener: {e}");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("server error: {e}");
            std::process::exit(1);
        }
    }
}
