//! ctxbus router runtime.
//!
//! Hub and satellite connector, the transports between them, the per-process
//! domain registry and the event channel surface. Used by the `ctxbus-hub`
//! binary and by embedding processes and integration tests.

pub mod app_state;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod hub;
pub mod ops;
pub mod payload;
pub mod peer;
pub mod registry;
pub mod router;
pub mod transport;

pub use channel::{Channels, EventChannel, Resume};
pub use dispatch::Dispatch;
pub use hub::Hub;
pub use peer::{PeerConnector, Phase};
pub use registry::{Delivery, DomainRegistry, Subscription};
