use std::time::Duration;

use serde::Deserialize;

use ctxbus_core::error::{Result, RouteError};
use ctxbus_core::{Presentation, TabId, NO_TAB};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouterConfig {
    pub version: u32,

    #[serde(default)]
    pub hub: HubSection,

    #[serde(default)]
    pub peer: PeerSection,
}

impl RouterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RouteError::UnsupportedVersion);
        }
        self.hub.validate()?;
        self.peer.validate()?;
        Ok(())
    }
}

/// Settings for the hub process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HubSection {
    #[serde(default = "default_listen")]
    pub listen: String,

    /// How long a disconnected peer's record survives.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Broker hub-bypass links between direct-access peers in the same tab.
    #[serde(default = "default_direct_links")]
    pub direct_links: bool,

    #[serde(default)]
    pub presentation: Presentation,
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            grace_ms: default_grace_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            direct_links: default_direct_links(),
            presentation: Presentation::default(),
        }
    }
}

impl HubSection {
    pub fn validate(&self) -> Result<()> {
        if !(10..=600_000).contains(&self.grace_ms) {
            return Err(RouteError::BadConfig(
                "hub.grace_ms must be between 10 and 600000".into(),
            ));
        }
        if !(100..=60_000).contains(&self.handshake_timeout_ms) {
            return Err(RouteError::BadConfig(
                "hub.handshake_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        Ok(())
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Settings for a satellite process.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerSection {
    #[serde(default = "default_hub_url")]
    pub hub_url: String,

    /// Tab this satellite belongs to, announced to the hub by the transport.
    #[serde(default = "default_tab_id")]
    pub tab_id: TabId,

    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for PeerSection {
    fn default() -> Self {
        Self {
            hub_url: default_hub_url(),
            tab_id: default_tab_id(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl PeerSection {
    pub fn validate(&self) -> Result<()> {
        if !(self.hub_url.starts_with("ws://") || self.hub_url.starts_with("wss://")) {
            return Err(RouteError::BadConfig(
                "peer.hub_url must be a ws:// or wss:// url".into(),
            ));
        }
        if !(100..=60_000).contains(&self.handshake_timeout_ms) {
            return Err(RouteError::BadConfig(
                "peer.handshake_timeout_ms must be between 100 and 60000".into(),
            ));
        }
        if self.backoff_initial_ms == 0 {
            return Err(RouteError::BadConfig(
                "peer.backoff_initial_ms must be greater than 0".into(),
            ));
        }
        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(RouteError::BadConfig(
                "peer.backoff_max_ms must be >= backoff_initial_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn default_listen() -> String {
    "127.0.0.1:7420".into()
}
fn default_grace_ms() -> u64 {
    1000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_direct_links() -> bool {
    true
}
fn default_hub_url() -> String {
    "ws://127.0.0.1:7420/v1/peer".into()
}
fn default_tab_id() -> TabId {
    NO_TAB
}
fn default_backoff_initial_ms() -> u64 {
    50
}
fn default_backoff_max_ms() -> u64 {
    5000
}
