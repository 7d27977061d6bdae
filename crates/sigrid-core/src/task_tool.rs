// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use sigrid_agents::{SpawnMode, TaskSpec, TaskStatus};
use sigrid_tools::{ExecContext, Tool, ToolCall, ToolOutput};

use crate::scheduler::SubAgentScheduler;

const MAX_DEPTH: usize = 3;

/// Lets the model spawn sub-agents.
///
/// Foreground tasks block until terminal and return the sub-agent's final
/// text; background tasks return a task id immediately and report through
/// attachments.  Sub-agent registries do not include this tool, so nesting
/// is bounded by construction; the depth counter is a second fence for
/// user-defined wiring.
pub struct TaskTool {
    scheduler: Arc<SubAgentScheduler>,
    depth: Arc<AtomicUsize>,
}

impl TaskTool {
    pub fn new(scheduler: Arc<SubAgentScheduler>) -> Self {
        Self {
            scheduler,
            depth: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> &str {
        "Spawn a sub-agent for a focused task.\n\
         agent_type: general-purpose (all tools), explore (read-only search; \
         thoroughness quick|medium|thorough), plan (read-only, emits a plan), \
         or a user-defined type.\n\
         mode: foreground (wait for the result) or background (returns a \
         task id; status arrives later).\n\
         Background tasks accept priority (higher first) and depends_on \
         (task ids that must complete first)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent_type": {
                    "type": "string",
                    "description": "Agent type to run (default: general-purpose)"
                },
                "prompt": {
                    "type": "string",
                    "description": "The task description for the sub-agent"
                },
                "mode": {
                    "type": "string",
                    "enum": ["foreground", "background"],
                    "description": "Execution mode (default: foreground)"
                },
                "thoroughness": {
                    "type": "string",
                    "enum": ["quick", "medium", "thorough"],
                    "description": "Search breadth for the explore type"
                },
                "priority": {
                    "type": "integer",
                    "description": "Scheduling priority; higher runs first"
                },
                "depends_on": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Task ids that must complete before this one"
                }
            },
            "required": ["prompt"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    fn timeout_default(&self) -> Duration {
        Duration::from_secs(600)
    }

    async fn execute(&self, call: &ToolCall, _ctx: &ExecContext) -> ToolOutput {
        let Some(prompt) = call.input.get("prompt").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'prompt'");
        };
        let agent_type = call
            .input
            .get("agent_type")
            .and_then(|v| v.as_str())
            .unwrap_or("general-purpose");
        let mode = match call.input.get("mode").and_then(|v| v.as_str()) {
            Some("background") => SpawnMode::Background,
            _ => SpawnMode::Foreground,
        };

        let current = self.depth.load(Ordering::Relaxed);
        if current >= MAX_DEPTH {
            return ToolOutput::err(
                &call.id,
                format!("maximum sub-agent depth ({MAX_DEPTH}) reached"),
            );
        }
        self.depth.fetch_add(1, Ordering::Relaxed);
        debug!(agent_type, ?mode, depth = current + 1, "task tool spawning sub-agent");

        let spec = TaskSpec {
            agent_type: agent_type.to_string(),
            prompt: prompt.to_string(),
            priority: call
                .input
                .get("priority")
                .and_then(|v| v.as_i64())
                .unwrap_or(0) as i32,
            depends_on: call
                .input
                .get("depends_on")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            thoroughness: call
                .input
                .get("thoroughness")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        };

        let result = self.scheduler.spawn(spec, mode).await;
        self.depth.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(handle) => match mode {
                SpawnMode::Background => ToolOutput::ok(
                    &call.id,
                    format!("spawned background task {}", handle.id),
                ),
                SpawnMode::Foreground => match handle.status {
                    TaskStatus::Completed => ToolOutput::ok(
                        &call.id,
                        handle
                            .final_text
                            .filter(|t| !t.is_empty())
                            .unwrap_or_else(|| "(sub-agent produced no text output)".into()),
                    ),
                    status => ToolOutput::err(
                        &call.id,
                        format!("sub-agent {} ended {:?}", handle.id, status),
                    ),
                },
            },
            Err(e) => ToolOutput::err(&call.id, format!("sub-agent error: {e:#}")),
        }
    }
}
