//! Transport layer.
//!
//! Everything above this module sees a connection as an [`Endpoint`]: an
//! ordered, message-framed, bidirectional pair of channels. The peer side
//! closing its half is the disconnect signal. Concrete transports
//! (in-process pipe, WebSocket) only adapt their medium to this shape.

pub mod codec;
pub mod memory;
pub mod ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ctxbus_core::error::Result;
use ctxbus_core::{Frame, PeerId};

pub use memory::MemoryConnector;
pub use ws::WsConnector;

/// One unit on a transport.
#[derive(Debug)]
pub enum Packet {
    Frame(Frame),
    /// Hub-brokered fast path to another peer. Only in-process transports
    /// can carry it.
    Link(DirectLink),
}

/// One end of a hub-bypass channel, plus who is on the other end.
#[derive(Debug)]
pub struct DirectLink {
    pub peer_id: PeerId,
    pub endpoint: Endpoint,
}

pub type PacketTx = mpsc::UnboundedSender<Packet>;
pub type PacketRx = mpsc::UnboundedReceiver<Packet>;

#[derive(Debug)]
pub struct Endpoint {
    pub tx: PacketTx,
    pub rx: PacketRx,
}

/// Two connected endpoints: what one sends, the other receives.
pub fn pipe() -> (Endpoint, Endpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        Endpoint { tx: a_tx, rx: b_rx },
        Endpoint { tx: b_tx, rx: a_rx },
    )
}

/// Opens a fresh transport to the hub. Called again after every loss.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<Endpoint>;
}
