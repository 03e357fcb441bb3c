//! Per-peer session on the hub: handshake, then read loop until farewell or
//! transport loss.

use std::time::Duration;

use tokio::time::timeout;
use tracing::Instrument;

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::{ClientHello, Frame, TabId};

use super::Hub;
use crate::transport::{Endpoint, Packet, PacketRx};

pub(super) async fn run(hub: Hub, endpoint: Endpoint, tab_id: TabId) {
    let Endpoint { tx, mut rx } = endpoint;

    let hello = match handshake(&mut rx, hub.config().handshake_timeout()).await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(tab = tab_id, class = e.class().as_str(), error = %e, "handshake failed; closing");
            return;
        }
    };

    let attached = hub.table().attach(&hello, tab_id, tx);
    let peer_id = attached.peer_id;
    let generation = attached.generation;
    tracing::info!(
        peer = %peer_id,
        environment = %hello.environment,
        tab = tab_id,
        restored = attached.restored,
        flushed = attached.flushed,
        "peer attached"
    );

    let span = tracing::info_span!("peer", peer = %peer_id);
    async move {
        loop {
            match rx.recv().await {
                Some(Packet::Frame(Frame::Route(env))) => hub.route_from(peer_id, env).await,
                Some(Packet::Frame(Frame::Farewell)) => {
                    hub.farewell(peer_id, generation);
                    return;
                }
                Some(Packet::Frame(other)) => {
                    tracing::debug!(op = other.op(), "unexpected frame after handshake; ignored");
                }
                Some(Packet::Link(_)) => {
                    tracing::debug!("links are brokered by the hub only; ignored");
                }
                None => {
                    hub.detach(peer_id, generation);
                    return;
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn handshake(rx: &mut PacketRx, within: Duration) -> Result<ClientHello> {
    match timeout(within, rx.recv()).await {
        Ok(Some(Packet::Frame(Frame::ClientHello(hello)))) => Ok(hello),
        Ok(Some(Packet::Frame(other))) => Err(RouteError::Handshake(format!(
            "expected client_hello, got {}",
            other.op()
        ))),
        Ok(Some(Packet::Link(_))) => Err(RouteError::Handshake("link offered before client_hello".into())),
        Ok(None) => Err(RouteError::Handshake("transport closed before client_hello".into())),
        Err(_) => Err(RouteError::Handshake(format!(
            "no client_hello within {}ms",
            within.as_millis()
        ))),
    }
}
