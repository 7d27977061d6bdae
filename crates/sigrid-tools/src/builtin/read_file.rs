// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecContext, Tool, ToolCall, ToolOutput};

/// Default number of lines returned when the caller does not specify a limit.
/// Kept moderate to avoid flooding the model context on the first read; the
/// agent can paginate with offset + limit to get more.
const DEFAULT_LINE_LIMIT: usize = 500;

/// Hard byte ceiling applied in addition to the line limit.
/// Whichever constraint is hit first determines where the output is cut.
const MAX_BYTES: usize = 50_000;

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Reads a text file. Default: 500 lines / 50 KB — whichever comes first.\n\
         offset is the 1-indexed line to start from; limit caps the line count.\n\
         When more lines exist, a pagination notice shows the next offset.\n\
         Strategy: grep for the relevant region first, then read only those\n\
         lines with offset+limit rather than whole large files."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-indexed line number to start reading from (default 1)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (default 500)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
        let Some(path) = call.input.get("path").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'path'");
        };
        let offset = call
            .input
            .get("offset")
            .and_then(|v| v.as_u64())
            .unwrap_or(1)
            .max(1) as usize;
        let limit = call
            .input
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LINE_LIMIT as u64) as usize;

        debug!(path, offset, limit, "read_file tool");

        let resolved = ctx.cwd.join(path);
        let text = match tokio::fs::read_to_string(&resolved).await {
            Ok(t) => t,
            Err(e) => return ToolOutput::err(&call.id, format!("read error: {e}")),
        };

        let all: Vec<&str> = text.lines().collect();
        let total = all.len();
        let mut out = String::new();
        let mut taken = 0usize;
        for line in all.iter().skip(offset - 1).take(limit) {
            if out.len() + line.len() + 1 > MAX_BYTES {
                break;
            }
            out.push_str(line);
            out.push('\n');
            taken += 1;
        }

        let last = offset - 1 + taken;
        if last < total {
            out.push_str(&format!(
                "… ({} more lines; continue with offset={})\n",
                total - last,
                last + 1
            ));
        }
        ToolOutput::ok(&call.id, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(input: Value) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: "read_file".into(),
            input,
        }
    }

    #[tokio::test]
    async fn reads_whole_small_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        let out = ReadFileTool
            .execute(
                &call(json!({"path": path.to_str().unwrap()})),
                &ExecContext::default(),
            )
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn paginates_with_offset_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "1\n2\n3\n4\n5\n").unwrap();
        let out = ReadFileTool
            .execute(
                &call(json!({"path": path.to_str().unwrap(), "offset": 2, "limit": 2})),
                &ExecContext::default(),
            )
            .await;
        assert!(out.content.starts_with("2\n3\n"));
        assert!(out.content.contains("offset=4"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error_result() {
        let out = ReadFileTool
            .execute(
                &call(json!({"path": "/definitely/not/here.txt"})),
                &ExecContext::default(),
            )
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn missing_path_parameter_is_an_error() {
        let out = ReadFileTool
            .execute(&call(json!({})), &ExecContext::default())
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("path"));
    }
}
