//! Router config loader (strict parsing).

pub mod schema;

use std::fs;

use ctxbus_core::error::{Result, RouteError};

pub use schema::{HubSection, PeerSection, RouterConfig};

pub fn load_from_file(path: &str) -> Result<RouterConfig> {
    let s = fs::read_to_string(path)
        .map_err(|e| RouteError::BadConfig(format!("read config failed ({path}): {e}")))?;
    load_from_str(&s)
}

pub fn load_from_str(s: &str) -> Result<RouterConfig> {
    let cfg: RouterConfig = serde_yaml::from_str(s)
        .map_err(|e| RouteError::BadConfig(format!("invalid yaml: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}
