//! Core engine loop, shared by fresh and resumed turns.
//!
//! Each driver invocation runs the model/tool loop until the assistant stops
//! calling tools, the step limit runs out, or a gated tool call pauses the
//! turn. Gated calls from one model response are reported as a single batch,
//! and the rest of the turn waits in the thread store until decisions come
//! back, in the same order.

use crate::agent::TurnStats;
use crate::checkpoint::{PendingCall, PendingGate, ThreadState, ThreadStore};
use crate::driver::TurnEvent;
use crate::llm::{ChatRequest, LlmClient};
use crate::registry::{ToolDef, ToolGateway};
use crate::suspension::{AuthorizationHandle, Decision, Suspension, TurnInput};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Engine behavior knobs, fixed at startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub model: String,
    pub user_id: String,
    pub system_prompt: String,
    /// Model/tool iterations allowed per driver invocation.
    pub max_steps: usize,
    /// Tools that always need human approval, regardless of gateway metadata.
    pub confirm_tools: Vec<String>,
}

/// Outcome of gating one tool call.
enum Gate {
    Clear,
    Authorization(AuthorizationHandle),
    Approval,
}

pub struct Engine {
    llm: Box<dyn LlmClient>,
    gateway: Arc<dyn ToolGateway>,
    tools: Vec<ToolDef>,
    store: Arc<ThreadStore>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        llm: Box<dyn LlmClient>,
        gateway: Arc<dyn ToolGateway>,
        tools: Vec<ToolDef>,
        store: Arc<ThreadStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            llm,
            gateway,
            tools,
            store,
            config,
        }
    }

    /// Run one driver invocation for `thread_id`.
    ///
    /// Sends progress events on `tx` and ends the stream with exactly one of
    /// `Suspended` or `Done`. Errors are returned to the driver, which
    /// reports them as a failed turn; partial output already sent stands.
    pub fn run(&self, thread_id: &str, input: TurnInput, tx: &Sender<TurnEvent>) -> Result<()> {
        let mut thread = self.store.load(thread_id);
        let mut stats = TurnStats::default();

        match input {
            TurnInput::User(text) => {
                if thread.is_suspended() {
                    bail!(
                        "Thread {} is awaiting decisions; resume it before sending a new message",
                        thread_id
                    );
                }
                thread.messages.push(json!({"role": "user", "content": text}));
            }
            TurnInput::Resume(payload) => {
                self.apply_decisions(&mut thread, payload.decisions(), &mut stats, tx)?;
            }
        }

        for _step in 0..self.config.max_steps {
            let request = ChatRequest {
                model: self.config.model.clone(),
                messages: self.request_messages(&thread),
                tools: self.tools.iter().map(ToolDef::as_function_schema).collect(),
            };
            let response = self.llm.chat(&request)?;
            if let Some(usage) = &response.usage {
                stats.record_usage(usage);
            }

            let Some(choice) = response.choices.into_iter().next() else {
                break;
            };
            let message = choice.message;

            if let Some(content) = &message.content {
                if !content.is_empty() {
                    let _ = tx.send(TurnEvent::Message(content.clone()));
                }
            }

            let tool_calls = match message.tool_calls {
                Some(calls) if !calls.is_empty() => calls,
                _ => {
                    thread
                        .messages
                        .push(json!({"role": "assistant", "content": message.content}));
                    break;
                }
            };

            thread.messages.push(json!({
                "role": "assistant",
                "content": message.content,
                "tool_calls": tool_calls,
            }));

            let mut suspensions = Vec::new();
            let mut pending = Vec::new();
            for call in &tool_calls {
                let name = call.function.name.clone();
                let input: Value =
                    serde_json::from_str(&call.function.arguments).unwrap_or(json!({}));

                match self.gate(&name)? {
                    Gate::Clear => {
                        stats.tool_uses += 1;
                        self.dispatch(&mut thread, &call.id, &name, &input, tx);
                    }
                    Gate::Authorization(handle) => {
                        pending.push(PendingCall {
                            tool_call_id: call.id.clone(),
                            tool_name: name.clone(),
                            input: input.clone(),
                            gate: PendingGate::Authorization,
                        });
                        suspensions.push(Suspension::AuthorizationRequired {
                            tool_name: name,
                            authorization: handle,
                        });
                    }
                    Gate::Approval => {
                        pending.push(PendingCall {
                            tool_call_id: call.id.clone(),
                            tool_name: name.clone(),
                            input: input.clone(),
                            gate: PendingGate::Approval,
                        });
                        suspensions.push(Suspension::ApprovalRequired {
                            tool_name: name,
                            input,
                        });
                    }
                }
            }

            if !suspensions.is_empty() {
                thread.pending = pending;
                self.store.save(thread_id, thread);
                let _ = tx.send(TurnEvent::Suspended(suspensions));
                return Ok(());
            }
        }

        self.store.save(thread_id, thread);
        let _ = tx.send(TurnEvent::Done(stats));
        Ok(())
    }

    /// Inject resume decisions into the suspended calls, positionally.
    fn apply_decisions(
        &self,
        thread: &mut ThreadState,
        decisions: Vec<Decision>,
        stats: &mut TurnStats,
        tx: &Sender<TurnEvent>,
    ) -> Result<()> {
        let pending = std::mem::take(&mut thread.pending);
        if pending.is_empty() {
            bail!("Nothing to resume: no decisions are pending for this thread");
        }
        if decisions.len() != pending.len() {
            bail!(
                "Resume carried {} decisions for {} pending calls",
                decisions.len(),
                pending.len()
            );
        }

        for (call, decision) in pending.into_iter().zip(decisions) {
            if decision.authorized {
                stats.tool_uses += 1;
                self.dispatch(thread, &call.tool_call_id, &call.tool_name, &call.input, tx);
            } else {
                let result = denial_result(call.gate);
                let _ = tx.send(TurnEvent::ToolResult {
                    name: call.tool_name.clone(),
                    ok: false,
                });
                thread
                    .messages
                    .push(tool_message(&call.tool_call_id, &result));
            }
        }
        Ok(())
    }

    /// Decide whether a call may run now or must pause for a decision.
    fn gate(&self, tool_name: &str) -> Result<Gate> {
        let Some(def) = self.tools.iter().find(|t| t.name == tool_name) else {
            // The model named a tool we never offered; let dispatch surface
            // the gateway's error as the tool result.
            return Ok(Gate::Clear);
        };

        if def.requirements.authorization {
            let auth = self
                .gateway
                .authorize(&def.name, &self.config.user_id)
                .with_context(|| format!("Authorization lookup failed for {}", def.name))?;
            if !auth.is_completed() {
                return Ok(Gate::Authorization(auth.handle()));
            }
            // Grant already on file; fall through to the approval check.
        }

        if self.needs_confirmation(def) {
            return Ok(Gate::Approval);
        }
        Ok(Gate::Clear)
    }

    fn needs_confirmation(&self, def: &ToolDef) -> bool {
        def.requirements.approval || self.config.confirm_tools.iter().any(|t| t == &def.name)
    }

    /// Execute one permitted call and record its result in the transcript.
    /// Execution failures become tool results, not turn failures.
    fn dispatch(
        &self,
        thread: &mut ThreadState,
        tool_call_id: &str,
        tool_name: &str,
        input: &Value,
        tx: &Sender<TurnEvent>,
    ) {
        let _ = tx.send(TurnEvent::ToolCall {
            name: tool_name.to_string(),
        });
        let result = match self.gateway.execute(tool_name, input, &self.config.user_id) {
            Ok(output) => json!({"ok": true, "output": output}),
            Err(e) => json!({
                "ok": false,
                "error": {"code": "tool_error", "message": format!("{e:#}")}
            }),
        };
        let ok = result["ok"].as_bool().unwrap_or(false);
        let _ = tx.send(TurnEvent::ToolResult {
            name: tool_name.to_string(),
            ok,
        });
        thread.messages.push(tool_message(tool_call_id, &result));
    }

    fn request_messages(&self, thread: &ThreadState) -> Vec<Value> {
        let mut messages = vec![json!({"role": "system", "content": self.config.system_prompt})];
        messages.extend(thread.messages.iter().cloned());
        messages
    }
}

fn denial_result(gate: PendingGate) -> Value {
    let message = match gate {
        PendingGate::Authorization => "Authorization was not granted",
        PendingGate::Approval => "The user declined this tool call",
    };
    json!({
        "ok": false,
        "error": {"code": "permission_denied", "message": message}
    })
}

fn tool_message(tool_call_id: &str, result: &Value) -> Value {
    json!({
        "role": "tool",
        "tool_call_id": tool_call_id,
        "content": result.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatResponse;
    use crate::registry::{Authorization, AuthorizationStatus};
    use crate::suspension::ResumePayload;
    use std::collections::VecDeque;
    use std::sync::mpsc;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<ChatResponse>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<Value>) -> Self {
            let parsed = responses
                .into_iter()
                .map(|v| serde_json::from_value(v).unwrap())
                .collect();
            Self {
                responses: Mutex::new(parsed),
            }
        }
    }

    impl LlmClient for ScriptedLlm {
        fn chat(&self, _request: &ChatRequest) -> Result<ChatResponse> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    #[derive(Default)]
    struct ScriptedGateway {
        /// Tools whose authorization is already granted.
        granted: Vec<String>,
        executed: Mutex<Vec<String>>,
    }

    impl ToolGateway for ScriptedGateway {
        fn execute(&self, tool_name: &str, _input: &Value, _user_id: &str) -> Result<Value> {
            self.executed.lock().unwrap().push(tool_name.to_string());
            Ok(json!({"result": format!("{} output", tool_name)}))
        }

        fn authorize(&self, tool_name: &str, _user_id: &str) -> Result<Authorization> {
            let status = if self.granted.iter().any(|t| t == tool_name) {
                AuthorizationStatus::Completed
            } else {
                AuthorizationStatus::Pending
            };
            Ok(Authorization {
                id: format!("auth_{}", tool_name),
                url: format!("https://gateway.test/grant/{}", tool_name),
                status,
            })
        }

        fn wait_for_completion(&self, _authorization_id: &str) -> Result<()> {
            unreachable!("the engine never waits; the resolver does")
        }
    }

    fn tool_defs() -> Vec<ToolDef> {
        vec![
            serde_json::from_value(json!({"name": "Drive_Search"})).unwrap(),
            serde_json::from_value(json!({
                "name": "Mail_Send",
                "requirements": {"approval": true}
            }))
            .unwrap(),
            serde_json::from_value(json!({
                "name": "Calendar_Create",
                "requirements": {"authorization": true}
            }))
            .unwrap(),
        ]
    }

    fn engine_with(
        responses: Vec<Value>,
        gateway: ScriptedGateway,
    ) -> (Engine, Arc<ThreadStore>, Arc<ScriptedGateway>) {
        let store = Arc::new(ThreadStore::new());
        let gateway = Arc::new(gateway);
        let engine = Engine::new(
            Box::new(ScriptedLlm::new(responses)),
            Arc::clone(&gateway) as Arc<dyn ToolGateway>,
            tool_defs(),
            Arc::clone(&store),
            EngineConfig {
                model: "test-model".to_string(),
                user_id: "u_1".to_string(),
                system_prompt: "You are a test.".to_string(),
                max_steps: 5,
                confirm_tools: Vec::new(),
            },
        );
        (engine, store, gateway)
    }

    fn tool_call_response(calls: &[(&str, &str)]) -> Value {
        let tool_calls: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(i, (name, args))| {
                json!({
                    "id": format!("call_{}", i),
                    "type": "function",
                    "function": {"name": name, "arguments": args}
                })
            })
            .collect();
        json!({
            "choices": [{"message": {"content": null, "tool_calls": tool_calls}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        })
    }

    fn text_response(content: &str) -> Value {
        json!({"choices": [{"message": {"content": content}}]})
    }

    fn run_collect(
        engine: &Engine,
        thread_id: &str,
        input: TurnInput,
    ) -> (Result<()>, Vec<TurnEvent>) {
        let (tx, rx) = mpsc::channel();
        let outcome = engine.run(thread_id, input, &tx);
        drop(tx);
        (outcome, rx.iter().collect())
    }

    #[test]
    fn test_plain_turn_completes() {
        let (engine, _store, _gateway) = engine_with(vec![text_response("Hello there.")], ScriptedGateway::default());
        let (outcome, events) = run_collect(&engine, "t1", TurnInput::User("hi".to_string()));

        outcome.unwrap();
        assert_eq!(events[0], TurnEvent::Message("Hello there.".to_string()));
        assert!(matches!(events.last(), Some(TurnEvent::Done(_))));
    }

    #[test]
    fn test_ungated_tool_runs_and_loop_continues() {
        let (engine, store, _gateway) = engine_with(
            vec![
                tool_call_response(&[("Drive_Search", r#"{"q":"reports"}"#)]),
                text_response("Found 3 reports."),
            ],
            ScriptedGateway::default(),
        );
        let (outcome, events) =
            run_collect(&engine, "t1", TurnInput::User("find reports".to_string()));

        outcome.unwrap();
        assert!(events.contains(&TurnEvent::ToolCall {
            name: "Drive_Search".to_string()
        }));
        assert!(events.contains(&TurnEvent::ToolResult {
            name: "Drive_Search".to_string(),
            ok: true
        }));
        assert!(matches!(events.last(), Some(TurnEvent::Done(stats)) if stats.tool_uses == 1));
        assert!(!store.load("t1").is_suspended());
    }

    #[test]
    fn test_approval_gated_tool_suspends() {
        let (engine, store, _gateway) = engine_with(
            vec![tool_call_response(&[("Mail_Send", r#"{"to":"a@b.c"}"#)])],
            ScriptedGateway::default(),
        );
        let (outcome, events) =
            run_collect(&engine, "t1", TurnInput::User("send it".to_string()));

        outcome.unwrap();
        let Some(TurnEvent::Suspended(batch)) = events.last() else {
            panic!("expected a suspension, got {:?}", events.last());
        };
        assert_eq!(batch.len(), 1);
        assert_eq!(
            batch[0],
            Suspension::ApprovalRequired {
                tool_name: "Mail_Send".to_string(),
                input: json!({"to": "a@b.c"}),
            }
        );
        assert!(store.load("t1").is_suspended());
    }

    #[test]
    fn test_pending_authorization_suspends_with_handle() {
        let (engine, _store, _gateway) = engine_with(
            vec![tool_call_response(&[("Calendar_Create", "{}")])],
            ScriptedGateway::default(),
        );
        let (outcome, events) =
            run_collect(&engine, "t1", TurnInput::User("book it".to_string()));

        outcome.unwrap();
        let Some(TurnEvent::Suspended(batch)) = events.last() else {
            panic!("expected a suspension");
        };
        assert_eq!(
            batch[0],
            Suspension::AuthorizationRequired {
                tool_name: "Calendar_Create".to_string(),
                authorization: AuthorizationHandle {
                    id: "auth_Calendar_Create".to_string(),
                    url: "https://gateway.test/grant/Calendar_Create".to_string(),
                },
            }
        );
    }

    #[test]
    fn test_granted_authorization_clears_the_gate() {
        let gateway = ScriptedGateway {
            granted: vec!["Calendar_Create".to_string()],
            ..Default::default()
        };
        let (engine, _store, _gateway) = engine_with(
            vec![
                tool_call_response(&[("Calendar_Create", "{}")]),
                text_response("Booked."),
            ],
            gateway,
        );
        let (outcome, events) =
            run_collect(&engine, "t1", TurnInput::User("book it".to_string()));

        outcome.unwrap();
        assert!(events.contains(&TurnEvent::ToolResult {
            name: "Calendar_Create".to_string(),
            ok: true
        }));
        assert!(matches!(events.last(), Some(TurnEvent::Done(_))));
    }

    #[test]
    fn test_mixed_batch_runs_clear_calls_and_suspends_gated_in_order() {
        let (engine, store, _gateway) = engine_with(
            vec![tool_call_response(&[
                ("Drive_Search", "{}"),
                ("Calendar_Create", "{}"),
                ("Mail_Send", "{}"),
            ])],
            ScriptedGateway::default(),
        );
        let (outcome, events) =
            run_collect(&engine, "t1", TurnInput::User("do all three".to_string()));

        outcome.unwrap();
        assert!(events.contains(&TurnEvent::ToolResult {
            name: "Drive_Search".to_string(),
            ok: true
        }));
        let Some(TurnEvent::Suspended(batch)) = events.last() else {
            panic!("expected a suspension");
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].tool_name(), Some("Calendar_Create"));
        assert_eq!(batch[1].tool_name(), Some("Mail_Send"));

        let pending = store.load("t1").pending;
        assert_eq!(pending[0].tool_name, "Calendar_Create");
        assert_eq!(pending[1].tool_name, "Mail_Send");
    }

    #[test]
    fn test_resume_executes_approved_and_denies_rest_in_order() {
        let (engine, store, _gateway) = engine_with(
            vec![
                tool_call_response(&[("Calendar_Create", "{}"), ("Mail_Send", "{}")]),
                text_response("Only the event was created."),
            ],
            ScriptedGateway::default(),
        );
        let (outcome, _) = run_collect(&engine, "t1", TurnInput::User("go".to_string()));
        outcome.unwrap();

        let payload =
            ResumePayload::from_decisions(vec![Decision::allow(), Decision::deny()]);
        let (outcome, events) = run_collect(&engine, "t1", TurnInput::Resume(payload));
        outcome.unwrap();

        assert!(events.contains(&TurnEvent::ToolResult {
            name: "Calendar_Create".to_string(),
            ok: true
        }));
        assert!(events.contains(&TurnEvent::ToolResult {
            name: "Mail_Send".to_string(),
            ok: false
        }));
        assert!(matches!(events.last(), Some(TurnEvent::Done(_))));

        let thread = store.load("t1");
        assert!(!thread.is_suspended());
        let transcript = serde_json::to_string(&thread.messages).unwrap();
        assert!(transcript.contains("permission_denied"));
        assert!(transcript.contains("The user declined this tool call"));
    }

    #[test]
    fn test_resume_decision_count_mismatch_fails() {
        let (engine, _store, _gateway) = engine_with(
            vec![tool_call_response(&[("Calendar_Create", "{}"), ("Mail_Send", "{}")])],
            ScriptedGateway::default(),
        );
        let (outcome, _) = run_collect(&engine, "t1", TurnInput::User("go".to_string()));
        outcome.unwrap();

        let payload = ResumePayload::from_decisions(vec![Decision::allow()]);
        let (outcome, _) = run_collect(&engine, "t1", TurnInput::Resume(payload));
        assert!(outcome.unwrap_err().to_string().contains("1 decisions"));
    }

    #[test]
    fn test_resume_without_pending_fails() {
        let (engine, _store, _gateway) =
            engine_with(vec![text_response("hi")], ScriptedGateway::default());
        let payload = ResumePayload::from_decisions(vec![Decision::allow()]);
        let (outcome, _) = run_collect(&engine, "t1", TurnInput::Resume(payload));
        assert!(outcome.is_err());
    }

    #[test]
    fn test_fresh_message_cannot_preempt_pending_decisions() {
        let (engine, _store, _gateway) = engine_with(
            vec![tool_call_response(&[("Mail_Send", "{}")])],
            ScriptedGateway::default(),
        );
        let (outcome, _) = run_collect(&engine, "t1", TurnInput::User("send".to_string()));
        outcome.unwrap();

        let (outcome, _) = run_collect(&engine, "t1", TurnInput::User("also this".to_string()));
        assert!(outcome.is_err());
    }

    #[test]
    fn test_denied_call_never_reaches_the_gateway() {
        let (engine, store, gateway) = engine_with(
            vec![
                tool_call_response(&[("Mail_Send", "{}")]),
                text_response("Not sent."),
            ],
            ScriptedGateway::default(),
        );
        let (outcome, _) = run_collect(&engine, "t1", TurnInput::User("send".to_string()));
        outcome.unwrap();

        let payload = ResumePayload::from_decisions(vec![Decision::deny()]);
        let (outcome, _) = run_collect(&engine, "t1", TurnInput::Resume(payload));
        outcome.unwrap();

        assert!(gateway.executed.lock().unwrap().is_empty());
        let transcript = serde_json::to_string(&store.load("t1").messages).unwrap();
        assert!(transcript.contains("permission_denied"));
    }
}
