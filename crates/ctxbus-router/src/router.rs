//! Axum router wiring: peer WebSocket upgrade plus ops endpoints.

use axum::{routing::get, Router};

use crate::{app_state::AppState, ops, transport};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/peer", get(transport::ws::peer_upgrade))
        .route("/v1/peers", get(ops::peers))
        .route("/healthz", get(ops::healthz))
        .route("/readyz", get(ops::readyz))
        .with_state(state)
}
