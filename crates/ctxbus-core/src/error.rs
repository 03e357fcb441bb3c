//! Shared error type across ctxbus crates.

use thiserror::Error;

/// Error classes (stable API, used in logs and tests).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before reaching any transport (bad target, bad config).
    Configuration,
    /// Transport could not be opened or written.
    Transport,
    /// Peer violated the handshake/frame protocol.
    Protocol,
    /// Payload transform failed.
    Codec,
    /// A local subscriber failed.
    Handler,
    /// Internal error.
    Internal,
}

impl ErrorClass {
    /// String representation used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Configuration => "CONFIGURATION",
            ErrorClass::Transport => "TRANSPORT",
            ErrorClass::Protocol => "PROTOCOL",
            ErrorClass::Codec => "CODEC",
            ErrorClass::Handler => "HANDLER",
            ErrorClass::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, RouteError>;

/// Unified error type used by core and router.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("unsupported config version")]
    UnsupportedVersion,
    #[error("transport: {0}")]
    Transport(String),
    #[error("handshake: {0}")]
    Handshake(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error("handler: {0}")]
    Handler(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RouteError {
    /// Map an error to its stable class.
    pub fn class(&self) -> ErrorClass {
        match self {
            RouteError::InvalidTarget(_)
            | RouteError::BadConfig(_)
            | RouteError::UnsupportedVersion => ErrorClass::Configuration,
            RouteError::Transport(_) => ErrorClass::Transport,
            RouteError::Handshake(_) | RouteError::Malformed(_) => ErrorClass::Protocol,
            RouteError::Codec(_) => ErrorClass::Codec,
            RouteError::Handler(_) => ErrorClass::Handler,
            RouteError::Internal(_) => ErrorClass::Internal,
        }
    }
}
