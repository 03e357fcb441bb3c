//! Payload transform hook.
//!
//! Runs exactly once per send (before the envelope leaves the process) and
//! once per receive (before local publish). Local short-circuit deliveries
//! never pass through it.

use async_trait::async_trait;
use serde_json::Value;

use ctxbus_core::error::Result;

#[async_trait]
pub trait PayloadCodec: Send + Sync {
    async fn encode(&self, value: Value) -> Result<Value>;
    async fn decode(&self, value: Value) -> Result<Value>;
}

/// Default: no transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCodec;

#[async_trait]
impl PayloadCodec for IdentityCodec {
    async fn encode(&self, value: Value) -> Result<Value> {
        Ok(value)
    }

    async fn decode(&self, value: Value) -> Result<Value> {
        Ok(value)
    }
}
