//! Peer and tab identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RouteError};

/// Logical tab/session id.
pub type TabId = i64;

/// Sentinel for "not bound to a tab".
pub const NO_TAB: TabId = -1;

/// Opaque random peer identity, issued by the hub and kept across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    pub fn random() -> Self {
        PeerId(Uuid::new_v4())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(PeerId)
            .map_err(|e| RouteError::InvalidTarget(format!("invalid peer id {s:?}: {e}")))
    }
}
