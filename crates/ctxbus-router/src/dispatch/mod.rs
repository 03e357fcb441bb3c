//! The seam between the public event surface and a process's router.
//!
//! Both the [`Hub`](crate::hub::Hub) and a satellite's
//! [`PeerConnector`](crate::peer::PeerConnector) implement [`Dispatch`];
//! `EventChannel` only ever talks to this trait.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use ctxbus_core::error::Result;
use ctxbus_core::TargetSpec;

use crate::registry::DomainRegistry;

#[async_trait]
pub trait Dispatch: Send + Sync {
    /// This process's listener table.
    fn registry(&self) -> &Arc<DomainRegistry>;

    /// Route one value. Fire-and-forget: `Ok` means accepted, not delivered.
    async fn dispatch(&self, domain: &str, event: &str, target: TargetSpec, data: Value) -> Result<()>;
}
