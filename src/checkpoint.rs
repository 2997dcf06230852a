//! In-memory conversation state, keyed by thread id.
//!
//! Threads live for the process lifetime. Only the engine writes here, and
//! only one turn is ever in flight, so the map sees no contention; it is
//! shared because each turn runs on its own worker thread.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

/// Why a call is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingGate {
    Authorization,
    Approval,
}

/// One suspended tool call, waiting on a decision.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub tool_call_id: String,
    pub tool_name: String,
    pub input: Value,
    pub gate: PendingGate,
}

/// Conversation state for one thread.
#[derive(Debug, Clone)]
pub struct ThreadState {
    /// Ordered transcript in chat-completions message form.
    pub messages: Vec<Value>,
    /// Suspended calls, in the order they were reported.
    pub pending: Vec<PendingCall>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ThreadState {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            messages: Vec::new(),
            pending: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_suspended(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Store of thread states for the process lifetime.
#[derive(Default)]
pub struct ThreadStore {
    threads: DashMap<String, ThreadState>,
}

impl ThreadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A thread's current state, created empty on first use.
    pub fn load(&self, thread_id: &str) -> ThreadState {
        self.threads
            .entry(thread_id.to_string())
            .or_insert_with(ThreadState::new)
            .clone()
    }

    /// Write a thread's state back.
    pub fn save(&self, thread_id: &str, mut state: ThreadState) {
        state.updated_at = Utc::now();
        self.threads.insert(thread_id.to_string(), state);
    }
}
