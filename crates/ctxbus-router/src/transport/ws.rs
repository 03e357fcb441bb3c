//! WebSocket transport.
//!
//! Hub side: `GET /v1/peer?tab=<id>` upgrades and bridges the socket into a
//! hub session. Satellite side: [`WsConnector`] dials the hub with
//! tokio-tungstenite. Both sides pump JSON text frames; direct links cannot
//! cross a socket and are skipped.

use axum::{
    extract::{ws::WebSocket, ws::WebSocketUpgrade, Query, State},
    response::Response,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::{Frame, TabId, NO_TAB};

use super::codec::{self, Inbound};
use super::{pipe, Connect, Endpoint, Packet};
use crate::app_state::AppState;
use crate::hub::Hub;

#[derive(Debug, Deserialize)]
pub struct PeerQuery {
    #[serde(default = "no_tab")]
    pub tab: TabId,
}

fn no_tab() -> TabId {
    NO_TAB
}

pub async fn peer_upgrade(
    State(app): State<AppState>,
    ws: WebSocketUpgrade,
    Query(q): Query<PeerQuery>,
) -> Response {
    let hub = app.hub().clone();
    ws.on_upgrade(move |socket| serve_socket(hub, socket, q.tab))
}

async fn serve_socket(hub: Hub, socket: WebSocket, tab_id: TabId) {
    let (near, far) = pipe();
    hub.accept(far, tab_id);

    let Endpoint { tx, mut rx } = near;
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            // hub -> socket
            out = rx.recv() => {
                match out {
                    Some(Packet::Frame(frame)) => {
                        let msg = match codec::encode_server(&frame) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!(error = %e, op = frame.op(), "frame encode failed");
                                continue;
                            }
                        };
                        if ws_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Some(Packet::Link(link)) => {
                        tracing::debug!(peer = %link.peer_id, "websocket cannot carry a direct link; offer skipped");
                    }
                    None => break,
                }
            }

            // socket -> hub
            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match codec::decode_server(msg) {
                    Ok(Inbound::Frame(frame)) => {
                        if tx.send(Packet::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(Inbound::Control) => {}
                    Ok(Inbound::Close) => break,
                    Err(e) => tracing::debug!(error = %e, "malformed frame dropped"),
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}

/// Dials the hub over WebSocket, announcing the tab binding in the query.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(hub_url: &str, tab_id: TabId) -> Self {
        let sep = if hub_url.contains('?') { '&' } else { '?' };
        Self {
            url: format!("{hub_url}{sep}tab={tab_id}"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connect for WsConnector {
    async fn connect(&self) -> Result<Endpoint> {
        let (stream, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| RouteError::Transport(format!("connect {} failed: {e}", self.url)))?;

        let (near, far) = pipe();
        tokio::spawn(pump_client(stream, far));
        Ok(near)
    }
}

async fn pump_client(stream: WebSocketStream<MaybeTlsStream<TcpStream>>, endpoint: Endpoint) {
    let Endpoint { tx, mut rx } = endpoint;
    let (mut ws_tx, mut ws_rx) = stream.split();

    loop {
        tokio::select! {
            out = rx.recv() => {
                match out {
                    Some(Packet::Frame(frame)) => {
                        let farewell = matches!(frame, Frame::Farewell);
                        let msg = match codec::encode_client(&frame) {
                            Ok(m) => m,
                            Err(e) => {
                                tracing::warn!(error = %e, op = frame.op(), "frame encode failed");
                                continue;
                            }
                        };
                        if ws_tx.send(msg).await.is_err() || farewell {
                            break;
                        }
                    }
                    Some(Packet::Link(_)) => {}
                    None => break,
                }
            }

            incoming = ws_rx.next() => {
                let Some(Ok(msg)) = incoming else { break };
                match codec::decode_client(msg) {
                    Ok(Inbound::Frame(frame)) => {
                        if tx.send(Packet::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(Inbound::Control) => {}
                    Ok(Inbound::Close) => break,
                    Err(e) => tracing::debug!(error = %e, "malformed frame dropped"),
                }
            }
        }
    }
    let _ = ws_tx.close().await;
}
