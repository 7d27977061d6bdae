// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Execution mode of a spawned sub-agent task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// Blocks the conversation loop until the task is terminal.
    Foreground,
    /// Returns a handle immediately; status arrives as attachments.
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What the operator asks the scheduler to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub agent_type: String,
    pub prompt: String,
    /// Higher runs first among ready tasks.
    #[serde(default)]
    pub priority: i32,
    /// Task ids that must complete before this one may start.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Thoroughness hint for the `explore` type.
    #[serde(default)]
    pub thoroughness: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: DateTime<Utc>,
    pub note: String,
}

/// Persistent state of one background task.  Snapshotted on every status
/// transition; reloaded and reconciled after a process restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: String,
    pub agent_type: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub thoroughness: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub intermediate_results: Vec<Value>,
    /// How much of the task's output has already been summarized for the
    /// main loop.
    pub output_offset: usize,
    pub last_reported_output: Option<String>,
    /// Whether the terminal `task_status` attachment has been delivered.
    pub notified: bool,
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BackgroundTask {
    pub fn new(id: impl Into<String>, spec: &TaskSpec) -> Self {
        Self {
            id: id.into(),
            agent_type: spec.agent_type.clone(),
            prompt: spec.prompt.clone(),
            status: TaskStatus::Pending,
            priority: spec.priority,
            depends_on: spec.depends_on.clone(),
            thoroughness: spec.thoroughness.clone(),
            history: Vec::new(),
            intermediate_results: Vec::new(),
            output_offset: 0,
            last_reported_output: None,
            notified: false,
            failure: None,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn note(&mut self, text: impl Into<String>) {
        self.history.push(HistoryEntry {
            ts: Utc::now(),
            note: text.into(),
        });
    }

    pub fn transition(&mut self, status: TaskStatus) {
        self.note(format!("{:?} -> {:?}", self.status, status));
        self.status = status;
        if status.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.transition(TaskStatus::Failed);
    }
}

/// Synthetic messages the scheduler injects into the main conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum Attachment {
    /// Delivered at most once, on transition to a terminal state.
    TaskStatus {
        task_id: String,
        status: TaskStatus,
        delta_summary: Option<String>,
    },
    /// Delivered at most once per progress interval.
    TaskProgress { task_id: String, message: String },
}

impl Attachment {
    /// Render for injection as a user-visible meta message.
    pub fn render(&self) -> String {
        match self {
            Self::TaskStatus {
                task_id,
                status,
                delta_summary,
            } => match delta_summary {
                Some(s) => format!("[task {task_id}: {status:?}] {s}"),
                None => format!("[task {task_id}: {status:?}]"),
            },
            Self::TaskProgress { task_id, message } => {
                format!("[task {task_id} progress] {message}")
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
