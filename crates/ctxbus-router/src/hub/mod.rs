//! The hub: peer table owner and global router.
//!
//! Exactly one hub exists per topology. It accepts peer transports, keeps one
//! [`PeerTable`] record per logical peer, and decides for each routed envelope
//! which peers (and whether the hub itself) receive a copy.
//!
//! Routing rules:
//! - `origin_peer_id` is stamped here, never trusted from the sender;
//! - a copy is never sent back to the peer it came from;
//! - a peer in its grace window gets its copies queued, in order;
//! - misses are dropped with a debug log.

mod direct;
mod peers;
mod session;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use ctxbus_core::error::Result;
use ctxbus_core::{
    matches, Envelope, Environment, Frame, LocalView, PeerId, Presentation, TabId, TargetSpec, NO_TAB,
};

pub use direct::DirectLinks;
pub use peers::{DeliverOutcome, PeerStatus, PeerTable, PeerView};

use crate::channel::Channels;
use crate::config::HubSection;
use crate::dispatch::Dispatch;
use crate::payload::{IdentityCodec, PayloadCodec};
use crate::registry::{Delivery, DomainRegistry};
use crate::transport::{pipe, DirectLink, Endpoint, Packet};

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    id: PeerId,
    cfg: HubSection,
    presentation: Mutex<Presentation>,
    registry: Arc<DomainRegistry>,
    codec: Arc<dyn PayloadCodec>,
    peers: PeerTable,
    direct: DirectLinks,
}

impl Hub {
    pub fn new(cfg: HubSection) -> Self {
        Self::with_codec(cfg, Arc::new(IdentityCodec))
    }

    pub fn with_codec(cfg: HubSection, codec: Arc<dyn PayloadCodec>) -> Self {
        let presentation = cfg.presentation;
        Self {
            inner: Arc::new(HubInner {
                id: PeerId::random(),
                cfg,
                presentation: Mutex::new(presentation),
                registry: Arc::new(DomainRegistry::new()),
                codec,
                peers: PeerTable::new(),
                direct: DirectLinks::new(),
            }),
        }
    }

    /// The hub's own identity (addressable with `TargetSpec::Peer`).
    pub fn local_peer_id(&self) -> PeerId {
        self.inner.id
    }

    pub fn set_presentation(&self, presentation: Presentation) {
        *self.lock_presentation() = presentation;
    }

    fn lock_presentation(&self) -> std::sync::MutexGuard<'_, Presentation> {
        self.inner
            .presentation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn local_view(&self) -> LocalView {
        LocalView {
            environment: Environment::HUB,
            peer_id: Some(self.inner.id),
            tab_id: NO_TAB,
            presentation: Some(*self.lock_presentation()),
        }
    }

    /// Start a session on a freshly opened transport. `tab_id` is the binding
    /// the transport reported for this peer (`NO_TAB` if none).
    pub fn accept(&self, endpoint: Endpoint, tab_id: TabId) {
        tokio::spawn(session::run(self.clone(), endpoint, tab_id));
    }

    /// Named-event surface for one domain, routed through this hub.
    pub fn channels(&self, domain: &str) -> Channels {
        Channels::new(domain, Arc::new(self.clone()))
    }

    pub fn peer_status(&self, peer_id: PeerId) -> Option<PeerStatus> {
        self.inner.peers.status(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerView> {
        self.inner.peers.snapshot()
    }

    /// Whether the hub has brokered a direct link between the pair.
    pub fn has_direct_link(&self, a: PeerId, b: PeerId) -> bool {
        self.inner.direct.is_linked(a, b)
    }

    pub(crate) fn table(&self) -> &PeerTable {
        &self.inner.peers
    }

    pub(crate) fn config(&self) -> &HubSection {
        &self.inner.cfg
    }

    /// Transport lost: keep the record for the grace window.
    pub(crate) fn detach(&self, peer_id: PeerId, generation: u64) {
        let grace = self.inner.cfg.grace();
        let hub = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.expire(peer_id, generation);
        })
        .abort_handle();

        if self.inner.peers.mark_pending(peer_id, generation, timer) {
            tracing::info!(peer = %peer_id, grace_ms = grace.as_millis() as u64, "peer disconnected; holding record");
        }
    }

    fn expire(&self, peer_id: PeerId, generation: u64) {
        if let Some(dropped) = self.inner.peers.expire(peer_id, generation) {
            self.inner.direct.forget(peer_id);
            tracing::info!(peer = %peer_id, dropped, "grace window elapsed; peer removed");
        }
    }

    /// Explicit farewell: remove without waiting out the grace window.
    pub(crate) fn farewell(&self, peer_id: PeerId, generation: u64) {
        if self.inner.peers.remove(peer_id, generation) {
            self.inner.direct.forget(peer_id);
            tracing::info!(peer = %peer_id, "peer said farewell; removed");
        }
    }

    /// Ingress from a connected peer.
    pub(crate) async fn route_from(&self, from: PeerId, mut env: Envelope) {
        env.origin_peer_id = Some(from);
        self.route(Some(from), env).await;
    }

    async fn route(&self, from: Option<PeerId>, env: Envelope) {
        // The hub evaluates itself as a receiver only when relaying.
        let relaying = from.is_some();
        let mut recipients: Vec<PeerView> = Vec::new();

        match env.target {
            TargetSpec::Peer(id) => {
                if id == self.inner.id {
                    if relaying {
                        self.publish_remote(&env).await;
                    }
                    return;
                }
                if Some(id) == from {
                    return;
                }
                match self.inner.peers.view(id) {
                    Some(v) => recipients.push(v),
                    None => {
                        tracing::debug!(peer = %id, domain = %env.domain, event = %env.event, "routing miss: peer not found");
                        return;
                    }
                }
            }
            TargetSpec::Tab(_) => {
                recipients = self
                    .inner
                    .peers
                    .snapshot()
                    .into_iter()
                    .filter(|p| Some(p.peer_id) != from && matches(&p.local_view(), false, &env.target))
                    .collect();
                if recipients.is_empty() {
                    tracing::debug!(to = ?env.target, domain = %env.domain, event = %env.event, "routing miss: no peer bound to tab");
                    return;
                }
            }
            TargetSpec::Flags(_) => {
                if env.target.is_local_only() {
                    return;
                }
                if relaying && matches(&self.local_view(), false, &env.target) {
                    self.publish_remote(&env).await;
                }
                recipients = self
                    .inner
                    .peers
                    .snapshot()
                    .into_iter()
                    .filter(|p| Some(p.peer_id) != from && matches(&p.local_view(), false, &env.target))
                    .collect();
            }
        }

        for peer in &recipients {
            let packet = Packet::Frame(Frame::Route(env.clone()));
            self.deliver(peer.peer_id, packet, &env.event);
        }

        if let Some(from) = from {
            if self.inner.cfg.direct_links {
                self.offer_direct_links(from, &recipients);
            }
        }
    }

    fn deliver(&self, peer_id: PeerId, packet: Packet, event: &str) {
        match self.inner.peers.deliver(peer_id, packet) {
            DeliverOutcome::Sent => {}
            DeliverOutcome::Queued => {
                tracing::debug!(peer = %peer_id, event, "peer in grace window; queued");
            }
            DeliverOutcome::Missing => {
                tracing::debug!(peer = %peer_id, event, "routing miss: peer left during routing");
            }
            DeliverOutcome::Failed { generation, packet } => {
                // Transport gone before the session saw it: start the grace
                // window now and keep the packet.
                tracing::debug!(peer = %peer_id, event, "transport send failed; holding for reconnect");
                self.detach(peer_id, generation);
                match self.inner.peers.deliver(peer_id, packet) {
                    DeliverOutcome::Sent | DeliverOutcome::Queued => {}
                    _ => tracing::warn!(peer = %peer_id, event, "transport send failed; dropped"),
                }
            }
        }
    }

    /// Hand both ends of a fresh pipe to direct-capable pairs in the same tab.
    fn offer_direct_links(&self, from: PeerId, recipients: &[PeerView]) {
        let Some(sender) = self.inner.peers.view(from) else {
            return;
        };
        for peer in recipients {
            if !DirectLinks::eligible(&sender, peer) || !self.inner.direct.claim(from, peer.peer_id) {
                continue;
            }
            let (a, b) = pipe();
            let to_sender = Packet::Link(DirectLink { peer_id: peer.peer_id, endpoint: a });
            let to_peer = Packet::Link(DirectLink { peer_id: from, endpoint: b });
            // A link is useless after a reconnect, so pending peers are skipped.
            let ok = self.inner.peers.deliver_live(from, to_sender)
                && self.inner.peers.deliver_live(peer.peer_id, to_peer);
            if ok {
                tracing::debug!(a = %from, b = %peer.peer_id, tab = peer.tab_id, "direct link offered");
            } else {
                self.inner.direct.release(from, peer.peer_id);
            }
        }
    }

    /// Deliver a routed envelope to the hub's own listeners.
    async fn publish_remote(&self, env: &Envelope) {
        let data = match self.inner.codec.decode(env.data.clone()).await {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, domain = %env.domain, event = %env.event, "payload decode failed; dropped");
                return;
            }
        };
        self.inner.registry.publish(&Delivery {
            domain: env.domain.clone(),
            event: env.event.clone(),
            data,
            origin: env.origin_peer_id,
            target: env.target,
        });
    }
}

#[async_trait]
impl Dispatch for Hub {
    fn registry(&self) -> &Arc<DomainRegistry> {
        &self.inner.registry
    }

    async fn dispatch(&self, domain: &str, event: &str, target: TargetSpec, data: Value) -> Result<()> {
        let view = self.local_view();
        let to_self = matches!(target, TargetSpec::Peer(id) if id == self.inner.id);

        if matches(&view, true, &target) {
            self.inner.registry.publish(&Delivery {
                domain: domain.to_string(),
                event: event.to_string(),
                data: data.clone(),
                origin: Some(self.inner.id),
                target,
            });
        }
        if target.is_local_only() || to_self {
            return Ok(());
        }

        let data = self.inner.codec.encode(data).await?;
        let env = Envelope {
            domain: domain.to_string(),
            event: event.to_string(),
            data,
            target,
            origin_peer_id: Some(self.inner.id),
        };
        self.route(None, env).await;
        Ok(())
    }
}
