//! Top-level facade crate for ctxbus.
//!
//! Re-exports the core model and the router so users can depend on a single crate.

pub mod core {
    pub use ctxbus_core::*;
}

pub mod router {
    pub use ctxbus_router::*;
}
