//! Decision resolution for suspended tool calls.
//!
//! Exactly one decision per suspension. The authorization branch waits on
//! the gateway; the approval branch asks the user; anything unrecognized is
//! denied outright. Resolution never fails: collaborator errors become deny
//! decisions, and every outcome is echoed to the console.

use crate::display;
use crate::registry::ToolGateway;
use crate::suspension::{Decision, Suspension};
use anyhow::Result;

/// Asks the user yes/no questions. The session's line editor implements
/// this; tests script the answers.
pub trait ApprovalPrompt {
    /// The user's answer. Only an explicit yes counts as approval.
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Interpret one line of prompt input. Only `y`/`yes` approve; the `[y/N]`
/// prompt text tells the user that everything else denies.
pub fn parse_confirmation(line: &str) -> bool {
    matches!(line.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Resolve one suspension into exactly one decision.
pub fn resolve(
    suspension: &Suspension,
    gateway: &dyn ToolGateway,
    prompt: &mut dyn ApprovalPrompt,
) -> Decision {
    match suspension {
        Suspension::AuthorizationRequired {
            tool_name,
            authorization,
        } => {
            display::status(&format!("Authorization required for tool call {}", tool_name));
            display::status(&format!("Please authorize in your browser: {}", authorization.url));
            display::status("Waiting for you to complete authorization...");
            match gateway.wait_for_completion(&authorization.id) {
                Ok(()) => {
                    display::status("Authorization granted. Resuming...");
                    Decision::allow()
                }
                Err(e) => {
                    display::warn(&format!(
                        "Authorization did not complete: {:#}. Denying the call.",
                        e
                    ));
                    Decision::deny()
                }
            }
        }
        Suspension::ApprovalRequired { tool_name, input } => {
            display::status(&format!("Approval required for tool call {}", tool_name));
            display::status(&format!(
                "Proposed input: {}",
                serde_json::to_string_pretty(input).unwrap_or_else(|_| input.to_string())
            ));
            match prompt.confirm("Approve this tool call? [y/N] ") {
                Ok(true) => {
                    display::status("Approved. Resuming...");
                    Decision::allow()
                }
                Ok(false) => {
                    display::status("Denied.");
                    Decision::deny()
                }
                Err(e) => {
                    display::warn(&format!("No answer received ({:#}). Denying the call.", e));
                    Decision::deny()
                }
            }
        }
        Suspension::Unknown => {
            display::warn("Unrecognized pause kind. Denying the call.");
            Decision::deny()
        }
    }
}
