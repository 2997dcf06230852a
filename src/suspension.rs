//! Pause/resume protocol types.
//!
//! A turn that cannot finish on its own reports a batch of suspensions and
//! waits. Each suspension is answered by exactly one decision, and the
//! decisions travel back positionally, in the order the suspensions were
//! reported.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handle for an in-flight external authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationHandle {
    /// Opaque identifier understood by the gateway.
    pub id: String,
    /// URL the user opens to complete the grant.
    pub url: String,
}

/// One paused tool invocation awaiting a decision.
///
/// The set of kinds is closed on purpose: resolution matches exhaustively,
/// and anything that parses to `Unknown` is denied rather than guessed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suspension {
    /// The tool needs an external authorization grant before it may run.
    AuthorizationRequired {
        tool_name: String,
        authorization: AuthorizationHandle,
    },
    /// The tool needs explicit human approval before it may run.
    ApprovalRequired { tool_name: String, input: Value },
    /// A pause kind this build does not recognize.
    #[serde(other)]
    Unknown,
}

impl Suspension {
    /// Name of the paused tool, when the kind carries one.
    pub fn tool_name(&self) -> Option<&str> {
        match self {
            Suspension::AuthorizationRequired { tool_name, .. }
            | Suspension::ApprovalRequired { tool_name, .. } => Some(tool_name),
            Suspension::Unknown => None,
        }
    }
}

/// The resolution of one suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub authorized: bool,
}

impl Decision {
    pub fn allow() -> Self {
        Self { authorized: true }
    }

    pub fn deny() -> Self {
        Self { authorized: false }
    }
}

/// Decisions carried back into a suspended turn.
///
/// One pending suspension resumes with the bare decision; several resume
/// with an ordered list aligned to the report order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResumePayload {
    Single(Decision),
    Many(Vec<Decision>),
}

impl ResumePayload {
    /// Build the payload for a batch of decisions, preserving order.
    pub fn from_decisions(mut decisions: Vec<Decision>) -> Self {
        if decisions.len() == 1 {
            ResumePayload::Single(decisions.remove(0))
        } else {
            ResumePayload::Many(decisions)
        }
    }

    /// The decisions in report order, regardless of payload shape.
    pub fn decisions(&self) -> Vec<Decision> {
        match self {
            ResumePayload::Single(decision) => vec![*decision],
            ResumePayload::Many(decisions) => decisions.clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ResumePayload::Single(_) => 1,
            ResumePayload::Many(decisions) => decisions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Input for one driver invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    /// A fresh user message starting a turn.
    User(String),
    /// Decisions re-entering a suspended turn.
    Resume(ResumePayload),
}
