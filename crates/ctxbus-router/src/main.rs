//! ctxbus hub binary.
//!
//! - Peer WebSocket endpoint: /v1/peer?tab=<id>
//! - Config: `$CTXBUS_CONFIG` or `./ctxbus.yaml` (strict YAML)
//! - Graceful shutdown on ctrl-c (readiness flips to draining first)

use std::net::SocketAddr;

use tracing_subscriber::{fmt, EnvFilter};

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::Environment;
use ctxbus_router::{app_state, config, router};

const DEFAULT_CONFIG: &str = "ctxbus.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let environment = Environment::current();
    if !environment.contains(Environment::HUB) {
        tracing::warn!(%environment, "process context does not classify as hub (CTXBUS_ROLE); serving as hub anyway");
    }

    let path = std::env::var("CTXBUS_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let cfg = config::load_from_file(&path)?;
    let listen: SocketAddr = cfg
        .hub
        .listen
        .parse()
        .map_err(|e| RouteError::BadConfig(format!("hub.listen must be a socket address: {e}")))?;

    let state = app_state::AppState::new(cfg)?;
    let app = router::build_router(state.clone());

    tracing::info!(%listen, config = %path, %environment, hub = %state.hub().local_peer_id(), "ctxbus-hub starting");
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| RouteError::Transport(format!("bind {listen} failed: {e}")))?;

    let draining = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            draining.set_draining(true);
            tracing::info!("shutdown requested; draining");
        })
        .await
        .map_err(|e| RouteError::Internal(format!("server failed: {e}")))?;

    tracing::info!("ctxbus-hub stopped");
    Ok(())
}
