// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod dag;
mod spec;
mod task;

pub use dag::{check_acyclic, ready_tasks};
pub use spec::{builtin_types, discover_types, parse_agent_file, AgentType, Thoroughness, ToolAccess};
pub use task::{Attachment, BackgroundTask, HistoryEntry, SpawnMode, TaskSpec, TaskStatus};
