// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::tool::ToolOutput;

/// Lifecycle of one queued tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Queued,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// One tool invocation owned by the execution queue.
///
/// Terminal states always carry an output so every tool use in history can
/// be paired with a result, even when the tool never ran (denied, cancelled,
/// sibling error).
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub id: String,
    pub tool_name: String,
    pub input: Value,
    pub state: InvocationState,
    pub output: Option<ToolOutput>,
    pub progress: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            input,
            state: InvocationState::Queued,
            output: None,
            progress: Vec::new(),
            started_at: None,
            ended_at: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.state = InvocationState::Executing;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self, output: ToolOutput) {
        self.state = if output.is_error {
            InvocationState::Failed
        } else {
            InvocationState::Completed
        };
        self.output = Some(output);
        self.ended_at = Some(Utc::now());
    }

    pub(crate) fn cancel(&mut self, reason: &str) {
        self.state = InvocationState::Cancelled;
        self.output = Some(ToolOutput::err(&self.id, reason));
        self.ended_at = Some(Utc::now());
    }

    /// The terminal output; present iff the state is terminal.
    pub fn output(&self) -> Option<&ToolOutput> {
        self.output.as_ref()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
