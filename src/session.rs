//! Session loop and the resume controller.
//!
//! One line of input drives one turn all the way to completion, suspensions
//! included. The controller alternates between draining turn output and
//! collecting decisions until a turn finishes without pausing; the session
//! loop feeds it lines until the user exits.

use crate::display;
use crate::driver::{TurnDriver, TurnEvent};
use crate::registry::ToolGateway;
use crate::resolve::{self, ApprovalPrompt};
use crate::suspension::{Decision, ResumePayload, Suspension, TurnInput};
use anyhow::{anyhow, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;

impl ApprovalPrompt for DefaultEditor {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        let line = self.readline(prompt)?;
        Ok(resolve::parse_confirmation(&line))
    }
}

/// Terminates the session loop, case-insensitively.
pub fn is_exit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case("exit")
}

/// Drives one turn to completion, resolving suspensions as they surface.
pub struct ResumeController<'a> {
    driver: &'a dyn TurnDriver,
    gateway: &'a dyn ToolGateway,
    verbose: bool,
}

impl<'a> ResumeController<'a> {
    pub fn new(driver: &'a dyn TurnDriver, gateway: &'a dyn ToolGateway, verbose: bool) -> Self {
        Self {
            driver,
            gateway,
            verbose,
        }
    }

    /// Run until the turn completes without suspending.
    ///
    /// Each round of suspensions is resolved sequentially, in report order,
    /// and handed back as one resume payload on the same thread. There is no
    /// cap on suspend/resume rounds.
    pub fn run(
        &self,
        thread_id: &str,
        message: String,
        prompt: &mut dyn ApprovalPrompt,
    ) -> Result<()> {
        let mut input = TurnInput::User(message);
        loop {
            let suspensions = self.drain_turn(thread_id, input)?;
            if suspensions.is_empty() {
                return Ok(());
            }

            let decisions: Vec<Decision> = suspensions
                .iter()
                .map(|suspension| resolve::resolve(suspension, self.gateway, prompt))
                .collect();
            input = TurnInput::Resume(ResumePayload::from_decisions(decisions));
        }
    }

    /// Start one driver invocation and display its output as it arrives.
    /// Returns the suspensions reported at end of stream, empty when the
    /// turn completed.
    fn drain_turn(&self, thread_id: &str, input: TurnInput) -> Result<Vec<Suspension>> {
        let handle = self.driver.start(thread_id, input);
        let mut suspensions = Vec::new();
        for event in handle.events.iter() {
            match event {
                TurnEvent::Message(text) => display::agent_message(&text),
                TurnEvent::ToolCall { name } => display::tool_call(&name),
                TurnEvent::ToolResult { name, ok } => display::tool_result(&name, ok),
                TurnEvent::Suspended(batch) => suspensions = batch,
                TurnEvent::Done(stats) => {
                    if self.verbose {
                        display::turn_stats(
                            stats.input_tokens,
                            stats.output_tokens,
                            stats.tool_uses,
                        );
                    }
                }
                TurnEvent::Failed(message) => return Err(anyhow!(message)),
            }
        }
        Ok(suspensions)
    }
}

/// Settings for the interactive session.
pub struct SessionOptions {
    pub thread_id: String,
    pub history_path: Option<PathBuf>,
    pub verbose: bool,
}

/// The interactive read/run loop.
pub struct SessionLoop<'a> {
    controller: ResumeController<'a>,
    options: SessionOptions,
}

impl<'a> SessionLoop<'a> {
    pub fn new(
        driver: &'a dyn TurnDriver,
        gateway: &'a dyn ToolGateway,
        options: SessionOptions,
    ) -> Self {
        Self {
            controller: ResumeController::new(driver, gateway, options.verbose),
            options,
        }
    }

    /// Block on stdin until `exit` or end of input.
    ///
    /// A failing turn is reported and abandoned; the next line still starts
    /// a fresh turn against the same thread.
    pub fn run(&self) -> Result<()> {
        let mut editor = DefaultEditor::new()?;
        if let Some(path) = &self.options.history_path {
            let _ = editor.load_history(path);
        }

        loop {
            match editor.readline("> ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(line.as_str());
                    if is_exit_command(&line) {
                        break;
                    }
                    if let Err(e) =
                        self.controller
                            .run(&self.options.thread_id, line, &mut editor)
                    {
                        display::error(&format!("{:#}", e));
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(path) = &self.options.history_path {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = editor.save_history(path);
        }
        Ok(())
    }
}
