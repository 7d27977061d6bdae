// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sigrid_agents::Attachment;
use sigrid_model::{StopReason, Usage};

/// Why a submitted prompt stopped driving new turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The assistant finished its answer.
    EndTurn,
    /// The model hit the output-token limit; partial text is in the session.
    MaxTokens,
    /// A configured stop sequence fired.
    StopSequence,
    /// The model refused; recorded as a normal end of turn, never retried.
    Refusal,
    /// The turn budget ran out; the partial conversation is surfaced.
    MaxTurnsExceeded,
    /// The operator cancelled; every dispatched tool was resolved first.
    Cancelled,
}

impl TurnOutcome {
    pub fn from_stop_reason(reason: StopReason) -> Self {
        match reason {
            StopReason::EndTurn | StopReason::ToolUse => Self::EndTurn,
            StopReason::MaxTokens => Self::MaxTokens,
            StopReason::StopSequence => Self::StopSequence,
            StopReason::Refusal => Self::Refusal,
        }
    }
}

/// Events emitted by the conversation loop during one submitted prompt.
/// Consumers (CLI runner, embedding hosts) subscribe to drive their output.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// A text chunk streamed from the model.
    TextDelta(String),
    /// The complete text of one assistant turn.
    TextComplete(String),
    /// A reasoning chunk from the model (extended thinking).
    ThinkingDelta(String),
    /// A tool invocation was dispatched.
    ToolStarted { id: String, name: String },
    /// A progress string from an in-flight tool.
    ToolProgress { id: String, message: String },
    /// A tool invocation reached a terminal state.
    ToolFinished {
        id: String,
        name: String,
        content: String,
        is_error: bool,
    },
    /// Provider-reported usage for one turn, plus the running total.
    TokenUsage { turn: Usage, cumulative: Usage },
    /// The context manager compacted the session.
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
    },
    /// A sub-agent status or progress report was injected.
    TaskAttachment(Attachment),
    /// The prompt finished processing.
    TurnComplete(TurnOutcome),
    /// The operator cancelled; any streamed text was kept.
    Aborted { partial_text: String },
    /// A classified, redacted error summary.
    Error { tag: &'static str, message: String },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
