//! In-process transport: satellites living in the hub's own process.
//!
//! Each `connect` builds two pipes joined by a relay task. Severing
//! ([`MemoryConnector::sever`]) stops the relay: it stops accepting, hands on
//! whatever was already in flight, then drops both halves, which both sides
//! observe as a transport loss. Direct links can travel over this transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::TabId;

use super::{pipe, Connect, Endpoint};
use crate::hub::Hub;

pub struct MemoryConnector {
    hub: Hub,
    tab_id: TabId,
    reachable: AtomicBool,
    relay: Mutex<Option<oneshot::Sender<()>>>,
}

impl MemoryConnector {
    pub fn new(hub: Hub, tab_id: TabId) -> Self {
        Self {
            hub,
            tab_id,
            reachable: AtomicBool::new(true),
            relay: Mutex::new(None),
        }
    }

    /// While unreachable, `connect` fails and the connector keeps backing off.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Drop the current connection, if any.
    pub fn sever(&self) {
        let relay = self.relay.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stop) = relay {
            let _ = stop.send(());
        }
    }
}

#[async_trait]
impl Connect for MemoryConnector {
    async fn connect(&self) -> Result<Endpoint> {
        if !self.reachable.load(Ordering::Acquire) {
            return Err(RouteError::Transport("hub unreachable".into()));
        }

        let (client, near) = pipe();
        let (far, server) = pipe();
        self.hub.accept(server, self.tab_id);

        let (stop, stopped) = oneshot::channel();
        tokio::spawn(relay(near, far, stopped));
        let previous = self
            .relay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(stop);
        if let Some(previous) = previous {
            let _ = previous.send(());
        }
        Ok(client)
    }
}

async fn relay(near: Endpoint, far: Endpoint, mut stop: oneshot::Receiver<()>) {
    let Endpoint { tx: near_tx, rx: mut near_rx } = near;
    let Endpoint { tx: far_tx, rx: mut far_rx } = far;
    loop {
        tokio::select! {
            up = near_rx.recv() => {
                let Some(p) = up else { break };
                if far_tx.send(p).is_err() { break; }
            }
            down = far_rx.recv() => {
                let Some(p) = down else { break };
                if near_tx.send(p).is_err() { break; }
            }
            _ = &mut stop => {
                // New sends fail at once; what is already buffered still arrives.
                near_rx.close();
                far_rx.close();
                while let Some(p) = near_rx.recv().await {
                    let _ = far_tx.send(p);
                }
                while let Some(p) = far_rx.recv().await {
                    let _ = near_tx.send(p);
                }
                break;
            }
        }
    }
}
