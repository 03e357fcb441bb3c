//! Shared state for the hub binary's HTTP surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ctxbus_core::error::Result;

use crate::config::RouterConfig;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    cfg: RouterConfig,
    hub: Hub,
    draining: AtomicBool,
}

impl AppState {
    /// Validates the config and builds the hub it describes.
    pub fn new(cfg: RouterConfig) -> Result<Self> {
        cfg.validate()?;
        let hub = Hub::new(cfg.hub.clone());
        Ok(Self::with_hub(cfg, hub))
    }

    /// Wrap an existing hub (custom payload codec, tests).
    pub fn with_hub(cfg: RouterConfig, hub: Hub) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                cfg,
                hub,
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn cfg(&self) -> &RouterConfig {
        &self.inner.cfg
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn set_draining(&self, draining: bool) {
        self.inner.draining.store(draining, Ordering::Release);
    }
}
