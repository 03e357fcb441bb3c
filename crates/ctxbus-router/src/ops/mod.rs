//! Operational HTTP endpoints.
//!
//! - `/healthz` : liveness
//! - `/readyz`  : readiness (503 when draining)
//! - `/v1/peers`: peer table snapshot (JSON)

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use ctxbus_core::{Environment, PeerId, TabId};

use crate::app_state::AppState;
use crate::hub::PeerStatus;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::OK, "ready")
    }
}

#[derive(Debug, Serialize)]
pub struct PeerEntry {
    pub peer_id: PeerId,
    pub environment: Environment,
    pub tab_id: TabId,
    pub live: bool,
    pub queued: usize,
}

#[derive(Debug, Serialize)]
pub struct PeersReport {
    pub hub_id: PeerId,
    pub peers: Vec<PeerEntry>,
}

pub async fn peers(State(state): State<AppState>) -> Json<PeersReport> {
    let hub = state.hub();
    let peers = hub
        .peers()
        .into_iter()
        .map(|p| PeerEntry {
            peer_id: p.peer_id,
            environment: p.environment,
            tab_id: p.tab_id,
            live: p.live,
            queued: match hub.peer_status(p.peer_id) {
                Some(PeerStatus::Pending { queued }) => queued,
                _ => 0,
            },
        })
        .collect();
    Json(PeersReport {
        hub_id: hub.local_peer_id(),
        peers,
    })
}
