//! Execution context classification.
//!
//! Every process is assigned an [`Environment`] bitmask once at startup. The
//! value is immutable for the process lifetime and is announced to the hub in
//! the handshake.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Environment bits live in the low 16 bits; target modifiers use the rest.
pub const ENVIRONMENT_BITS: u32 = 0x0000_ffff;

/// Capability bitmask describing a process's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Environment(u32);

impl Environment {
    /// Privileged coordinator.
    pub const HUB: Environment = Environment(1 << 0);
    /// Any non-hub participant.
    pub const SATELLITE: Environment = Environment(1 << 1);
    /// Can talk to other peers without going through the hub.
    pub const DIRECT_ACCESS: Environment = Environment(1 << 2);
    /// Sandboxed or unrecognized context.
    pub const NO_CAPABILITY: Environment = Environment(1 << 3);

    pub const fn empty() -> Self {
        Environment(0)
    }

    /// Build from raw bits, discarding anything outside the environment range.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Environment(bits & ENVIRONMENT_BITS)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Environment) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Environment) -> bool {
        self.0 & other.0 != 0
    }

    /// The environment of the current process, classified once and cached.
    pub fn current() -> Environment {
        static CURRENT: OnceLock<Environment> = OnceLock::new();
        *CURRENT.get_or_init(|| classify(&ExecutionContext::from_env()))
    }
}

impl BitOr for Environment {
    type Output = Environment;
    fn bitor(self, rhs: Self) -> Self {
        Environment(self.0 | rhs.0)
    }
}

impl BitOrAssign for Environment {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Environment {
    type Output = Environment;
    fn bitand(self, rhs: Self) -> Self {
        Environment(self.0 & rhs.0)
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Raw facts about where the process runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Declared role ("hub", "satellite"); anything else is unrecognized.
    pub role: Option<String>,
    pub direct_access: bool,
    pub sandboxed: bool,
}

impl ExecutionContext {
    /// Read `CTXBUS_ROLE`, `CTXBUS_DIRECT` and `CTXBUS_SANDBOXED`.
    pub fn from_env() -> Self {
        Self {
            role: std::env::var("CTXBUS_ROLE").ok(),
            direct_access: env_flag("CTXBUS_DIRECT"),
            sandboxed: env_flag("CTXBUS_SANDBOXED"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).ok().as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}

/// Map an execution context to its environment bitmask.
///
/// Never fails: an unrecognized or sandboxed context resolves to
/// [`Environment::NO_CAPABILITY`].
pub fn classify(ctx: &ExecutionContext) -> Environment {
    if ctx.sandboxed {
        return Environment::NO_CAPABILITY;
    }

    let mut env = match ctx.role.as_deref().map(str::trim) {
        Some(r) if r.eq_ignore_ascii_case("hub") => Environment::HUB,
        Some(r) if r.eq_ignore_ascii_case("satellite") => Environment::SATELLITE,
        _ => return Environment::NO_CAPABILITY,
    };
    if ctx.direct_access {
        env |= Environment::DIRECT_ACCESS;
    }
    env
}
