//! Handshake and routed-envelope frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::error::{Result, RouteError};
use crate::id::{PeerId, TabId};
use crate::target::TargetSpec;

/// First frame on every connection, peer -> hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientHello {
    pub environment: Environment,
    /// Present only when reconnecting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

/// Handshake reply, hub -> peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerHello {
    /// Bound tab, or `NO_TAB`.
    pub tab_id: TabId,
    /// Assigned or confirmed identity.
    pub peer_id: PeerId,
}

/// Routed unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    /// Namespace; identical event names in different domains never collide.
    pub domain: String,
    pub event: String,
    /// Payload after the transform hook.
    #[serde(default)]
    pub data: Value,
    pub target: TargetSpec,
    /// Stamped by the hub on ingress. Whatever the sender put here is overwritten.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_peer_id: Option<PeerId>,
}

/// One transport message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    ClientHello(ClientHello),
    ServerHello(ServerHello),
    /// Graceful shutdown: the hub skips the grace window.
    Farewell,
    Route(Envelope),
}

impl Frame {
    /// Decode a text frame.
    pub fn from_text(s: &str) -> Result<Frame> {
        serde_json::from_str(s).map_err(|e| RouteError::Malformed(format!("invalid frame json: {e}")))
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| RouteError::Internal(format!("frame encode failed: {e}")))
    }

    /// Short name for log fields.
    pub fn op(&self) -> &'static str {
        match self {
            Frame::ClientHello(_) => "client_hello",
            Frame::ServerHello(_) => "server_hello",
            Frame::Farewell => "farewell",
            Frame::Route(_) => "route",
        }
    }
}
