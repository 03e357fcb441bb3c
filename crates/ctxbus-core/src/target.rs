//! Addressing: target specs and the matcher.
//!
//! A [`TargetSpec`] names a *class* of receivers. [`matches`] is the single
//! predicate used both by the hub (should this peer get a copy?) and by a
//! receiving process (should this envelope reach local listeners?).

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::environment::{Environment, ENVIRONMENT_BITS};
use crate::error::{Result, RouteError};
use crate::id::{PeerId, TabId, NO_TAB};

/// Deliver to the sending process too.
pub const INCLUDE_LOCAL: u32 = 1 << 16;
/// Never deliver to the sending process.
pub const EXCLUDE_LOCAL: u32 = 1 << 17;
/// Deliver only inside the sending process.
pub const LOCAL_ONLY: u32 = 1 << 18;
/// Receiver must currently be visible.
pub const VISIBLE_ONLY: u32 = 1 << 19;
/// Receiver must currently have focus.
pub const FOCUSED_ONLY: u32 = 1 << 20;

const MODIFIER_BITS: u32 = INCLUDE_LOCAL | EXCLUDE_LOCAL | LOCAL_ONLY | VISIBLE_ONLY | FOCUSED_ONLY;

/// Validated flag mask: environment bits plus modifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetFlags(u32);

impl TargetFlags {
    /// Validate a raw mask.
    pub fn new(mask: u32) -> Result<Self> {
        if mask & !(ENVIRONMENT_BITS | MODIFIER_BITS) != 0 {
            return Err(RouteError::InvalidTarget(format!(
                "unknown flag bits in mask {mask:#x}"
            )));
        }
        if mask & EXCLUDE_LOCAL != 0 && mask & (INCLUDE_LOCAL | LOCAL_ONLY) != 0 {
            return Err(RouteError::InvalidTarget(
                "EXCLUDE_LOCAL cannot be combined with INCLUDE_LOCAL or LOCAL_ONLY".into(),
            ));
        }
        Ok(TargetFlags(mask))
    }

    /// Environment part plus modifier bits.
    pub fn of(env: Environment, modifiers: u32) -> Result<Self> {
        Self::new(env.bits() | modifiers)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn environment(self) -> Environment {
        Environment::from_bits_truncate(self.0)
    }

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

/// Addressing mode of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TargetWire", into = "TargetWire")]
pub enum TargetSpec {
    /// Peers bound to a logical tab.
    Tab(TabId),
    /// Exactly one peer (or the local process if it is the local identity).
    Peer(PeerId),
    /// Every peer whose environment intersects the mask.
    Flags(TargetFlags),
}

impl TargetSpec {
    /// Build a flag target, rejecting invalid modifier combinations.
    pub fn flags(mask: u32) -> Result<Self> {
        TargetFlags::new(mask).map(TargetSpec::Flags)
    }

    /// True when delivery must stop after the sender's own registry.
    pub fn is_local_only(&self) -> bool {
        matches!(self, TargetSpec::Flags(f) if f.has(LOCAL_ONLY))
    }
}

/// Textual form: `tab:<id>`, `peer:<uuid>`, `flags:<mask>` (decimal or `0x` hex).
impl FromStr for TargetSpec {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, value) = s
            .split_once(':')
            .ok_or_else(|| RouteError::InvalidTarget(format!("{s:?} (expected kind:value)")))?;
        match kind {
            "tab" => value
                .parse::<TabId>()
                .map(TargetSpec::Tab)
                .map_err(|_| RouteError::InvalidTarget(format!("non-numeric tab id: {value}"))),
            "peer" => value.parse::<PeerId>().map(TargetSpec::Peer),
            "flags" => {
                let mask = match value.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => value.parse::<u32>(),
                }
                .map_err(|_| RouteError::InvalidTarget(format!("non-numeric flag mask: {value}")))?;
                TargetSpec::flags(mask)
            }
            other => Err(RouteError::InvalidTarget(format!("unknown target kind: {other}"))),
        }
    }
}

/// Wire shape of a target (`{"kind": "...", ...}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum TargetWire {
    Tab { id: TabId },
    Peer { id: PeerId },
    Flags { mask: u32 },
}

impl TryFrom<TargetWire> for TargetSpec {
    type Error = RouteError;

    fn try_from(w: TargetWire) -> Result<Self> {
        match w {
            TargetWire::Tab { id } => Ok(TargetSpec::Tab(id)),
            TargetWire::Peer { id } => Ok(TargetSpec::Peer(id)),
            TargetWire::Flags { mask } => TargetSpec::flags(mask),
        }
    }
}

impl From<TargetSpec> for TargetWire {
    fn from(t: TargetSpec) -> Self {
        match t {
            TargetSpec::Tab(id) => TargetWire::Tab { id },
            TargetSpec::Peer(id) => TargetWire::Peer { id },
            TargetSpec::Flags(f) => TargetWire::Flags { mask: f.bits() },
        }
    }
}

/// Presentation state of a process (set by its host).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Presentation {
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub focused: bool,
}

/// What the matcher knows about the process being evaluated.
#[derive(Debug, Clone, Copy)]
pub struct LocalView {
    pub environment: Environment,
    pub peer_id: Option<PeerId>,
    pub tab_id: TabId,
    /// `None` when the evaluator cannot see it (hub looking at a remote peer);
    /// presentation predicates then pass and the receiver resolves them.
    pub presentation: Option<Presentation>,
}

/// Does the process described by `local` receive an envelope for `target`?
pub fn matches(local: &LocalView, is_sender: bool, target: &TargetSpec) -> bool {
    match target {
        TargetSpec::Peer(id) => local.peer_id.as_ref() == Some(id),
        TargetSpec::Tab(id) => *id != NO_TAB && *id == local.tab_id,
        TargetSpec::Flags(flags) => {
            if is_sender {
                // A sender only sees its own broadcast when asked to.
                return flags.has(INCLUDE_LOCAL) || flags.has(LOCAL_ONLY);
            }
            if flags.has(LOCAL_ONLY) {
                return false;
            }
            if local.environment.intersects(flags.environment()) {
                return true;
            }
            presentation_matches(local.presentation, *flags)
        }
    }
}

fn presentation_matches(presentation: Option<Presentation>, flags: TargetFlags) -> bool {
    let wants_focus = flags.has(FOCUSED_ONLY);
    let wants_visible = flags.has(VISIBLE_ONLY);
    if !wants_focus && !wants_visible {
        return false;
    }
    let Some(p) = presentation else {
        return true;
    };
    (wants_focus && p.focused) || (wants_visible && p.visible)
}
