//! Peer table: one record per logical peer, surviving transport loss for the
//! grace window.

use dashmap::DashMap;
use tokio::sync::mpsc::error::SendError;
use tokio::task::AbortHandle;

use ctxbus_core::{ClientHello, Environment, Frame, LocalView, PeerId, ServerHello, TabId, NO_TAB};

use crate::transport::{Packet, PacketTx};

enum PeerLink {
    Live(PacketTx),
    /// Transport lost; packets wait here until reconnect or expiry.
    Pending {
        queue: Vec<Packet>,
        timer: AbortHandle,
    },
}

struct PeerRecord {
    environment: Environment,
    tab_id: TabId,
    link: PeerLink,
    /// Bumped on every attach so stale sessions cannot touch a newer link.
    generation: u64,
}

/// Externally visible state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Live,
    Pending { queued: usize },
}

/// Routing-time copy of a record.
#[derive(Debug, Clone, Copy)]
pub struct PeerView {
    pub peer_id: PeerId,
    pub environment: Environment,
    pub tab_id: TabId,
    pub live: bool,
}

impl PeerView {
    /// What the matcher knows about this peer from the hub's side.
    pub fn local_view(&self) -> LocalView {
        LocalView {
            environment: self.environment,
            peer_id: Some(self.peer_id),
            tab_id: self.tab_id,
            presentation: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Attached {
    pub peer_id: PeerId,
    pub generation: u64,
    pub restored: bool,
    pub flushed: usize,
}

#[derive(Debug)]
pub enum DeliverOutcome {
    Sent,
    Queued,
    Missing,
    /// The live transport is closed but the session has not noticed yet.
    /// The packet comes back so the caller can queue it.
    Failed { generation: u64, packet: Packet },
}

#[derive(Default)]
pub struct PeerTable {
    records: DashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Complete a handshake: restore or create the record, send `ServerHello`,
    /// then flush anything queued while the peer was away.
    pub fn attach(&self, hello: &ClientHello, tab_id: TabId, tx: PacketTx) -> Attached {
        if let Some(id) = hello.peer_id {
            if let Some(mut rec) = self.records.get_mut(&id) {
                rec.generation += 1;
                rec.environment = hello.environment;
                if tab_id != NO_TAB {
                    rec.tab_id = tab_id;
                }
                send_hello(&tx, id, rec.tab_id);

                let previous = std::mem::replace(&mut rec.link, PeerLink::Live(tx.clone()));
                let flushed = match previous {
                    PeerLink::Pending { queue, timer } => {
                        timer.abort();
                        let n = queue.len();
                        for p in queue {
                            if tx.send(p).is_err() {
                                break;
                            }
                        }
                        n
                    }
                    // Takeover: the old session is still open but stale now.
                    PeerLink::Live(_) => 0,
                };
                return Attached {
                    peer_id: id,
                    generation: rec.generation,
                    restored: true,
                    flushed,
                };
            }
        }

        let id = PeerId::random();
        send_hello(&tx, id, tab_id);
        self.records.insert(
            id,
            PeerRecord {
                environment: hello.environment,
                tab_id,
                link: PeerLink::Live(tx),
                generation: 1,
            },
        );
        Attached {
            peer_id: id,
            generation: 1,
            restored: false,
            flushed: 0,
        }
    }

    /// Switch a live record to pending. The timer is aborted if the record
    /// moved on (newer generation, already gone).
    pub fn mark_pending(&self, peer_id: PeerId, generation: u64, timer: AbortHandle) -> bool {
        match self.records.get_mut(&peer_id) {
            Some(mut rec) if rec.generation == generation && matches!(rec.link, PeerLink::Live(_)) => {
                rec.link = PeerLink::Pending {
                    queue: Vec::new(),
                    timer,
                };
                true
            }
            _ => {
                timer.abort();
                false
            }
        }
    }

    /// Grace window elapsed. Returns the number of dropped packets, or `None`
    /// if the peer came back (or left) in the meantime.
    pub fn expire(&self, peer_id: PeerId, generation: u64) -> Option<usize> {
        let (_, rec) = self.records.remove_if(&peer_id, |_, r| {
            r.generation == generation && matches!(r.link, PeerLink::Pending { .. })
        })?;
        match rec.link {
            PeerLink::Pending { queue, .. } => Some(queue.len()),
            PeerLink::Live(_) => Some(0),
        }
    }

    /// Explicit farewell from the session that owns `generation`.
    pub fn remove(&self, peer_id: PeerId, generation: u64) -> bool {
        let removed = self
            .records
            .remove_if(&peer_id, |_, r| r.generation == generation);
        if let Some((_, PeerRecord { link: PeerLink::Pending { timer, .. }, .. })) = &removed {
            timer.abort();
        }
        removed.is_some()
    }

    pub fn deliver(&self, peer_id: PeerId, packet: Packet) -> DeliverOutcome {
        let Some(mut rec) = self.records.get_mut(&peer_id) else {
            return DeliverOutcome::Missing;
        };
        let generation = rec.generation;
        match &mut rec.link {
            PeerLink::Live(tx) => match tx.send(packet) {
                Ok(()) => DeliverOutcome::Sent,
                Err(SendError(packet)) => DeliverOutcome::Failed { generation, packet },
            },
            PeerLink::Pending { queue, .. } => {
                queue.push(packet);
                DeliverOutcome::Queued
            }
        }
    }

    /// Send only over a live transport; never queue. Used for packets that
    /// are worthless after a reconnect (direct links).
    pub fn deliver_live(&self, peer_id: PeerId, packet: Packet) -> bool {
        match self.records.get(&peer_id).as_deref().map(|r| &r.link) {
            Some(PeerLink::Live(tx)) => tx.send(packet).is_ok(),
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<PeerView> {
        self.records
            .iter()
            .map(|r| PeerView {
                peer_id: *r.key(),
                environment: r.environment,
                tab_id: r.tab_id,
                live: matches!(r.link, PeerLink::Live(_)),
            })
            .collect()
    }

    pub fn view(&self, peer_id: PeerId) -> Option<PeerView> {
        self.records.get(&peer_id).map(|r| PeerView {
            peer_id,
            environment: r.environment,
            tab_id: r.tab_id,
            live: matches!(r.link, PeerLink::Live(_)),
        })
    }

    pub fn status(&self, peer_id: PeerId) -> Option<PeerStatus> {
        self.records.get(&peer_id).map(|r| match &r.link {
            PeerLink::Live(_) => PeerStatus::Live,
            PeerLink::Pending { queue, .. } => PeerStatus::Pending {
                queued: queue.len(),
            },
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn send_hello(tx: &PacketTx, peer_id: PeerId, tab_id: TabId) {
    let hello = Frame::ServerHello(ServerHello { tab_id, peer_id });
    // A dead tx here surfaces as a disconnect in the session loop.
    let _ = tx.send(Packet::Frame(hello));
}
