//! Fast-path bookkeeping: which peer pairs already hold a direct link.

use dashmap::DashSet;

use ctxbus_core::{Environment, PeerId, NO_TAB};

use super::peers::PeerView;

#[derive(Default)]
pub struct DirectLinks {
    offered: DashSet<(PeerId, PeerId)>,
}

fn pair(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl DirectLinks {
    pub fn new() -> Self {
        Self {
            offered: DashSet::new(),
        }
    }

    /// Both live, both direct-capable, same real tab.
    pub fn eligible(a: &PeerView, b: &PeerView) -> bool {
        a.peer_id != b.peer_id
            && a.live
            && b.live
            && a.environment.contains(Environment::DIRECT_ACCESS)
            && b.environment.contains(Environment::DIRECT_ACCESS)
            && a.tab_id != NO_TAB
            && a.tab_id == b.tab_id
    }

    /// Claim the pair. Returns false if a link was already handed out.
    pub fn claim(&self, a: PeerId, b: PeerId) -> bool {
        self.offered.insert(pair(a, b))
    }

    pub fn release(&self, a: PeerId, b: PeerId) {
        self.offered.remove(&pair(a, b));
    }

    /// Forget every pair involving a departed peer.
    pub fn forget(&self, peer_id: PeerId) {
        self.offered.retain(|(a, b)| *a != peer_id && *b != peer_id);
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        self.offered.contains(&pair(a, b))
    }
}
