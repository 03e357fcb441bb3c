//! Satellite side: one connector per peer process.
//!
//! The connector owns the transport to the hub and the process's local
//! registry. Sends made while the transport is down wait in an outbox and go
//! out, in submission order, right after the next handshake.

mod driver;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};

use ctxbus_core::error::Result;
use ctxbus_core::{
    matches, Envelope, Environment, Frame, LocalView, PeerId, Presentation, TabId, TargetSpec,
};

use crate::channel::Channels;
use crate::config::PeerSection;
use crate::dispatch::Dispatch;
use crate::payload::{IdentityCodec, PayloadCodec};
use crate::registry::{Delivery, DomainRegistry};
use crate::transport::{Connect, DirectLink, Packet, PacketTx};

/// Connection lifecycle, observable with [`PeerConnector::phase`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Handshaking => "handshaking",
            Phase::Connected => "connected",
        }
    }
}

struct DirectPeer {
    tx: PacketTx,
    seq: u64,
    reader: AbortHandle,
}

struct LinkState {
    peer_id: Option<PeerId>,
    tab_id: TabId,
    presentation: Presentation,
    hub_tx: Option<PacketTx>,
    outbox: VecDeque<Envelope>,
    direct: HashMap<PeerId, DirectPeer>,
    link_seq: u64,
}

struct PeerInner {
    cfg: PeerSection,
    environment: Environment,
    registry: Arc<DomainRegistry>,
    codec: Arc<dyn PayloadCodec>,
    state: Mutex<LinkState>,
    phase: watch::Sender<Phase>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PeerConnector {
    inner: Arc<PeerInner>,
}

impl PeerConnector {
    /// Spawn the connection driver. Must run inside a tokio runtime.
    pub fn start(cfg: PeerSection, environment: Environment, connect: Arc<dyn Connect>) -> Self {
        Self::with_codec(cfg, environment, connect, Arc::new(IdentityCodec))
    }

    pub fn with_codec(
        cfg: PeerSection,
        environment: Environment,
        connect: Arc<dyn Connect>,
        codec: Arc<dyn PayloadCodec>,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Disconnected);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let tab_id = cfg.tab_id;
        let conn = Self {
            inner: Arc::new(PeerInner {
                cfg,
                environment,
                registry: Arc::new(DomainRegistry::new()),
                codec,
                state: Mutex::new(LinkState {
                    peer_id: None,
                    tab_id,
                    presentation: Presentation::default(),
                    hub_tx: None,
                    outbox: VecDeque::new(),
                    direct: HashMap::new(),
                    link_seq: 0,
                }),
                phase,
                shutdown,
                driver: Mutex::new(None),
            }),
        };

        let handle = tokio::spawn(driver::run(conn.clone(), connect, shutdown_rx));
        *conn.inner.driver.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        conn
    }

    pub fn environment(&self) -> Environment {
        self.inner.environment
    }

    /// Issued by the hub; `None` until the first handshake completes.
    pub fn peer_id(&self) -> Option<PeerId> {
        self.lock_state().peer_id
    }

    pub fn tab_id(&self) -> TabId {
        self.lock_state().tab_id
    }

    pub fn set_presentation(&self, presentation: Presentation) {
        self.lock_state().presentation = presentation;
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// Wait until the connector reaches `want`. Returns false on timeout.
    pub async fn wait_for_phase(&self, want: Phase, within: Duration) -> bool {
        let mut rx = self.inner.phase.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == want {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(within, wait).await.unwrap_or(false)
    }

    /// Number of sends held while disconnected.
    pub fn pending_sends(&self) -> usize {
        self.lock_state().outbox.len()
    }

    pub fn has_direct_link(&self, peer_id: PeerId) -> bool {
        self.lock_state().direct.contains_key(&peer_id)
    }

    pub fn channels(&self, domain: &str) -> Channels {
        Channels::new(domain, Arc::new(self.clone()))
    }

    /// Say farewell to the hub and stop reconnecting.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let mut st = self.lock_state();
        for (_, link) in st.direct.drain() {
            link.reader.abort();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn local_view(&self) -> LocalView {
        let st = self.lock_state();
        LocalView {
            environment: self.inner.environment,
            peer_id: st.peer_id,
            tab_id: st.tab_id,
            presentation: Some(st.presentation),
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.inner.phase.send_replace(phase);
    }

    pub(crate) fn config(&self) -> &PeerSection {
        &self.inner.cfg
    }

    /// Handshake done: adopt the identity and flush the outbox.
    fn on_connected(&self, peer_id: PeerId, tab_id: TabId, tx: PacketTx) -> usize {
        let mut st = self.lock_state();
        if let Some(previous) = st.peer_id.filter(|p| *p != peer_id) {
            tracing::info!(previous = %previous, peer = %peer_id, "hub issued a new identity");
        }
        st.peer_id = Some(peer_id);
        st.tab_id = tab_id;

        let mut flushed = 0;
        while let Some(env) = st.outbox.pop_front() {
            if let Err(e) = tx.send(Packet::Frame(Frame::Route(env))) {
                if let Packet::Frame(Frame::Route(env)) = e.0 {
                    st.outbox.push_front(env);
                }
                return flushed;
            }
            flushed += 1;
        }
        st.hub_tx = Some(tx);
        drop(st);
        self.set_phase(Phase::Connected);
        flushed
    }

    fn on_lost(&self) {
        self.lock_state().hub_tx = None;
        self.set_phase(Phase::Disconnected);
    }

    /// Inbound envelope from the hub or a direct link.
    async fn receive(&self, mut env: Envelope, via_link: Option<PeerId>) {
        if let Some(peer) = via_link {
            env.origin_peer_id = Some(peer);
        }
        if !matches(&self.local_view(), false, &env.target) {
            tracing::debug!(domain = %env.domain, event = %env.event, "not addressed here; dropped");
            return;
        }
        let data = match self.inner.codec.decode(env.data).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, domain = %env.domain, event = %env.event, "payload decode failed; dropped");
                return;
            }
        };
        self.inner.registry.publish(&Delivery {
            domain: env.domain,
            event: env.event,
            data,
            origin: env.origin_peer_id,
            target: env.target,
        });
    }

    /// Take one end of a hub-brokered pipe and start reading from it.
    fn install_link(&self, link: DirectLink) {
        let DirectLink { peer_id, endpoint } = link;
        let mut st = self.lock_state();
        st.link_seq += 1;
        let seq = st.link_seq;

        let conn = self.clone();
        let mut rx = endpoint.rx;
        let reader = tokio::spawn(async move {
            while let Some(packet) = rx.recv().await {
                match packet {
                    Packet::Frame(Frame::Route(env)) => conn.receive(env, Some(peer_id)).await,
                    Packet::Frame(other) => {
                        tracing::debug!(peer = %peer_id, op = other.op(), "non-route frame on direct link; ignored");
                    }
                    Packet::Link(_) => {}
                }
            }
            conn.drop_link(peer_id, seq);
        })
        .abort_handle();

        let installed = DirectPeer {
            tx: endpoint.tx,
            seq,
            reader,
        };
        if let Some(old) = st.direct.insert(peer_id, installed) {
            old.reader.abort();
        }
        tracing::debug!(peer = %peer_id, "direct link installed");
    }

    fn drop_link(&self, peer_id: PeerId, seq: u64) {
        let mut st = self.lock_state();
        if st.direct.get(&peer_id).is_some_and(|l| l.seq == seq) {
            st.direct.remove(&peer_id);
            tracing::debug!(peer = %peer_id, "direct link closed");
        }
    }

    /// Hand an encoded envelope to the best available path.
    fn submit(&self, env: Envelope) {
        let mut st = self.lock_state();

        let mut env = env;
        if let TargetSpec::Peer(to) = env.target {
            if let Some(link) = st.direct.get(&to) {
                match link.tx.send(Packet::Frame(Frame::Route(env))) {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(peer = %to, "direct link send failed; falling back to hub");
                        if let Some(old) = st.direct.remove(&to) {
                            old.reader.abort();
                        }
                        let Packet::Frame(Frame::Route(back)) = e.0 else {
                            return;
                        };
                        env = back;
                    }
                }
            }
        }

        let Some(tx) = st.hub_tx.as_ref() else {
            st.outbox.push_back(env);
            return;
        };
        if let Err(e) = tx.send(Packet::Frame(Frame::Route(env))) {
            // Transport died under us; hold until the next handshake.
            st.hub_tx = None;
            if let Packet::Frame(Frame::Route(env)) = e.0 {
                st.outbox.push_back(env);
            }
        }
    }
}

#[async_trait]
impl Dispatch for PeerConnector {
    fn registry(&self) -> &Arc<DomainRegistry> {
        &self.inner.registry
    }

    async fn dispatch(&self, domain: &str, event: &str, target: TargetSpec, data: Value) -> Result<()> {
        let view = self.local_view();
        let to_self = matches!(target, TargetSpec::Peer(id) if Some(id) == view.peer_id);

        if matches(&view, true, &target) {
            self.inner.registry.publish(&Delivery {
                domain: domain.to_string(),
                event: event.to_string(),
                data: data.clone(),
                origin: view.peer_id,
                target,
            });
        }
        if target.is_local_only() || to_self {
            return Ok(());
        }

        let data = self.inner.codec.encode(data).await?;
        self.submit(Envelope {
            domain: domain.to_string(),
            event: event.to_string(),
            data,
            target,
            origin_peer_id: view.peer_id,
        });
        Ok(())
    }
}
