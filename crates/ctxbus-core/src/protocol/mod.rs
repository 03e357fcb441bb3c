//! Wire protocol between peers and the hub.
//!
//! Every transport message is one [`Frame`], serialized as a JSON object
//! tagged by `op`. Parsers are panic-free: malformed input is reported as
//! `RouteError` and the caller decides whether to drop or close.

pub mod frame;

pub use frame::{ClientHello, Envelope, Frame, ServerHello};
