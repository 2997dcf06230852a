//! Turn driving.
//!
//! Each turn runs on a worker thread that streams events back over a
//! channel. The receiver is the turn's output: consumed once, in order, and
//! discarded with the turn.

use crate::agent::{Engine, TurnStats};
use crate::suspension::{Suspension, TurnInput};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread;

/// One increment of turn output.
///
/// `Message`, `ToolCall` and `ToolResult` are displayable progress. Exactly
/// one of `Suspended`, `Done` or `Failed` ends the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// Assistant text, shown as it arrives.
    Message(String),
    /// A tool call was dispatched.
    ToolCall { name: String },
    /// A tool call finished.
    ToolResult { name: String, ok: bool },
    /// The turn paused; each entry needs one decision, in report order.
    Suspended(Vec<Suspension>),
    /// The turn finished.
    Done(TurnStats),
    /// The turn failed. No decisions are owed.
    Failed(String),
}

/// Receiving side of a running turn.
pub struct TurnHandle {
    pub events: Receiver<TurnEvent>,
}

/// Starts turns. A trait so the session machinery can be exercised against
/// scripted turns.
pub trait TurnDriver {
    fn start(&self, thread_id: &str, input: TurnInput) -> TurnHandle;
}

/// Drives turns on the real engine, one worker thread per turn.
pub struct EngineDriver {
    engine: Arc<Engine>,
}

impl EngineDriver {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

impl TurnDriver for EngineDriver {
    fn start(&self, thread_id: &str, input: TurnInput) -> TurnHandle {
        let (tx, rx) = mpsc::channel();
        let engine = Arc::clone(&self.engine);
        let thread_id = thread_id.to_string();
        thread::spawn(move || {
            if let Err(e) = engine.run(&thread_id, input, &tx) {
                let _ = tx.send(TurnEvent::Failed(format!("{e:#}")));
            }
        });
        TurnHandle { events: rx }
    }
}
