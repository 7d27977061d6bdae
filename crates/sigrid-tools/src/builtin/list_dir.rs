// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tool::{ExecContext, Tool, ToolCall, ToolOutput};

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "Lists a directory. Directories are suffixed with '/'; files show\n\
         their size in bytes. Entries are sorted by name."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: working directory)"
                }
            },
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
        let path = call
            .input
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let resolved = ctx.cwd.join(path);

        let mut entries = match tokio::fs::read_dir(&resolved).await {
            Ok(e) => e,
            Err(e) => return ToolOutput::err(&call.id, format!("list error: {e}")),
        };

        let mut lines = Vec::new();
        loop {
            match entries.next_entry().await {
                Ok(Some(entry)) => {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    match entry.metadata().await {
                        Ok(meta) if meta.is_dir() => lines.push(format!("{name}/")),
                        Ok(meta) => lines.push(format!("{name}  {}", meta.len())),
                        Err(_) => lines.push(name),
                    }
                }
                Ok(None) => break,
                Err(e) => return ToolOutput::err(&call.id, format!("list error: {e}")),
            }
        }
        lines.sort();
        ToolOutput::ok(&call.id, lines.join("\n"))
    }
}
