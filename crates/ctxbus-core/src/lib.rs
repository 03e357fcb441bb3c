//! ctxbus core: transport-agnostic addressing model, wire frames and errors.
//!
//! This crate defines the environment bitmask, target specs and their
//! matcher, and the handshake/envelope frames shared by the hub, satellite
//! connectors and tooling. It carries no runtime or transport dependencies so
//! it can be reused in any process role.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here. All fallible paths
//! surface as `RouteError`/`Result` so a malformed frame from one peer cannot
//! take a process down.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod environment;
pub mod error;
pub mod id;
pub mod protocol;
pub mod target;

/// Shared result type.
pub use error::{ErrorClass, Result, RouteError};

pub use environment::{classify, Environment, ExecutionContext};
pub use id::{PeerId, TabId, NO_TAB};
pub use protocol::{ClientHello, Envelope, Frame, ServerHello};
pub use target::{matches, LocalView, Presentation, TargetFlags, TargetSpec};
