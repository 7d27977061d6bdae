// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON input object.
    pub input: Value,
}

/// The terminal result of executing a tool.  Exactly one is produced per
/// execution; progress strings flow separately through the context.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// If true, the tool execution failed non-fatally (returned an error
    /// message the model can react to).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Execution context handed to every tool.
///
/// Exposes the cooperative cancel token, the working directory, a
/// per-session scratch directory, and a progress channel.  Tools check the
/// token at safe points (and between subprocess reads); the queue escalates
/// to forcible termination only after the grace period.
#[derive(Clone)]
pub struct ExecContext {
    pub cancel: CancellationToken,
    pub cwd: PathBuf,
    pub scratch: PathBuf,
    progress: Option<mpsc::UnboundedSender<String>>,
}

impl ExecContext {
    pub fn new(cancel: CancellationToken, cwd: PathBuf, scratch: PathBuf) -> Self {
        Self {
            cancel,
            cwd,
            scratch,
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Emit a progress string.  Dropped silently when nobody listens.
    pub fn progress(&self, message: impl Into<String>) {
        if let Some(tx) = &self.progress {
            let _ = tx.send(message.into());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let scratch = std::env::temp_dir();
        Self::new(CancellationToken::new(), cwd, scratch)
    }
}

/// Trait that every built-in, MCP-discovered, and user-defined tool
/// implements.  Definitions are immutable once registered.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the input object.
    fn input_schema(&self) -> Value;
    /// True when the tool cannot mutate observable state.
    fn read_only(&self) -> bool;
    /// Whether this invocation may run in parallel with other
    /// concurrency-safe invocations.  Read-only tools are safe for any
    /// input; mutating tools may override per input.
    fn concurrency_safe(&self, _input: &Value) -> bool {
        self.read_only()
    }
    /// Default per-invocation timeout; inputs may override with
    /// `timeout_secs`.
    fn timeout_default(&self) -> Duration {
        Duration::from_secs(120)
    }
    /// Execute the tool.  Errors are wrapped in [`ToolOutput::err`]; exactly
    /// one terminal output per execution.
    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct ReadOnlyTool;

    #[async_trait]
    impl Tool for ReadOnlyTool {
        fn name(&self) -> &str {
            "ro"
        }
        fn description(&self) -> &str {
            "a read-only tool"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn read_only(&self) -> bool {
            true
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ExecContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    struct MutatingTool;

    #[async_trait]
    impl Tool for MutatingTool {
        fn name(&self) -> &str {
            "mu"
        }
        fn description(&self) -> &str {
            "a mutating tool"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn read_only(&self) -> bool {
            false
        }
        async fn execute(&self, call: &ToolCall, _ctx: &ExecContext) -> ToolOutput {
            ToolOutput::ok(&call.id, "ok")
        }
    }

    #[test]
    fn read_only_tools_are_concurrency_safe_by_default() {
        assert!(ReadOnlyTool.concurrency_safe(&json!({})));
        assert!(!MutatingTool.concurrency_safe(&json!({})));
    }

    #[test]
    fn default_timeout_is_two_minutes() {
        assert_eq!(ReadOnlyTool.timeout_default(), Duration::from_secs(120));
    }

    #[test]
    fn progress_without_listener_does_not_panic() {
        let ctx = ExecContext::default();
        ctx.progress("working...");
    }

    #[tokio::test]
    async fn progress_reaches_listener() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = ExecContext::default().with_progress(tx);
        ctx.progress("step 1");
        assert_eq!(rx.recv().await.unwrap(), "step 1");
    }

    #[test]
    fn output_constructors_set_error_flag() {
        assert!(!ToolOutput::ok("a", "x").is_error);
        assert!(ToolOutput::err("a", "x").is_error);
    }
}
