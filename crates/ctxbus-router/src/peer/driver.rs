//! Connection driver: connect, handshake, read, reconnect.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::{ClientHello, Frame, ServerHello};

use super::{PeerConnector, Phase};
use crate::transport::{Connect, Endpoint, Packet, PacketRx};

enum SessionEnd {
    /// Transport closed after a completed handshake; reconnect right away.
    Lost,
    /// Handshake did not complete; back off before retrying.
    Failed,
    Shutdown,
}

pub(super) async fn run(conn: PeerConnector, connect: Arc<dyn Connect>, mut shutdown: watch::Receiver<bool>) {
    let initial = Duration::from_millis(conn.config().backoff_initial_ms);
    let max = Duration::from_millis(conn.config().backoff_max_ms);
    let mut backoff = initial;

    loop {
        if *shutdown.borrow() {
            break;
        }
        conn.set_phase(Phase::Connecting);

        let opened = tokio::select! {
            r = connect.connect() => r,
            _ = shutdown.changed() => break,
        };

        let end = match opened {
            Ok(endpoint) => session(&conn, endpoint, &mut shutdown).await,
            Err(e) => {
                tracing::debug!(error = %e, backoff_ms = backoff.as_millis() as u64, "connect failed");
                SessionEnd::Failed
            }
        };

        match end {
            SessionEnd::Shutdown => break,
            SessionEnd::Lost => {
                backoff = initial;
                tracing::info!(peer = ?conn.peer_id(), "transport lost; reconnecting");
            }
            SessionEnd::Failed => {
                conn.set_phase(Phase::Disconnected);
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = shutdown.changed() => break,
                }
                backoff = (backoff * 2).min(max);
            }
        }
    }

    conn.on_lost();
    tracing::debug!("connector driver stopped");
}

async fn session(conn: &PeerConnector, endpoint: Endpoint, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
    let Endpoint { tx, mut rx } = endpoint;
    conn.set_phase(Phase::Handshaking);

    let hello = ClientHello {
        environment: conn.environment(),
        peer_id: conn.peer_id(),
    };
    if tx.send(Packet::Frame(Frame::ClientHello(hello))).is_err() {
        return SessionEnd::Failed;
    }

    let reply = tokio::select! {
        r = handshake(&mut rx, conn.config().handshake_timeout()) => r,
        _ = shutdown.changed() => {
            let _ = tx.send(Packet::Frame(Frame::Farewell));
            return SessionEnd::Shutdown;
        }
    };
    let hello = match reply {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(class = e.class().as_str(), error = %e, "handshake failed");
            return SessionEnd::Failed;
        }
    };

    let flushed = conn.on_connected(hello.peer_id, hello.tab_id, tx.clone());
    tracing::info!(peer = %hello.peer_id, tab = hello.tab_id, flushed, "connected to hub");

    loop {
        tokio::select! {
            packet = rx.recv() => match packet {
                Some(Packet::Frame(Frame::Route(env))) => conn.receive(env, None).await,
                Some(Packet::Link(link)) => conn.install_link(link),
                Some(Packet::Frame(other)) => {
                    tracing::debug!(op = other.op(), "unexpected frame from hub; ignored");
                }
                None => {
                    conn.on_lost();
                    return SessionEnd::Lost;
                }
            },
            _ = shutdown.changed() => {
                let _ = tx.send(Packet::Frame(Frame::Farewell));
                return SessionEnd::Shutdown;
            }
        }
    }
}

async fn handshake(rx: &mut PacketRx, within: Duration) -> Result<ServerHello> {
    match timeout(within, server_hello(rx)).await {
        Ok(Some(hello)) => Ok(hello),
        Ok(None) => Err(RouteError::Handshake("transport closed before server_hello".into())),
        Err(_) => Err(RouteError::Handshake(format!(
            "no server_hello within {}ms",
            within.as_millis()
        ))),
    }
}

/// Skip anything that is not the reply to our hello.
async fn server_hello(rx: &mut PacketRx) -> Option<ServerHello> {
    loop {
        match rx.recv().await? {
            Packet::Frame(Frame::ServerHello(h)) => return Some(h),
            Packet::Frame(other) => {
                tracing::debug!(op = other.op(), "frame before server_hello; ignored");
            }
            Packet::Link(_) => {}
        }
    }
}
