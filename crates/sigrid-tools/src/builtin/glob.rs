// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::tool::{ExecContext, Tool, ToolCall, ToolOutput};

const DEFAULT_LIMIT: usize = 200;

/// Convert a file glob to a [`regex::Regex`].
///
/// `**` matches across directory separators, `*` within one path segment,
/// `?` a single character.  The pattern is anchored on both ends.
pub fn glob_to_regex(pattern: &str) -> Result<regex::Regex, regex::Error> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Swallow a following '/' so "**/foo" also matches "foo".
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    regex::Regex::new(&re)
}

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Finds files by glob pattern, e.g. '**/*.rs' or 'src/*.toml'.\n\
         Matches are relative to the search path and sorted; directories\n\
         like .git and target are skipped."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern; ** crosses directories"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (default: working directory)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of paths to return (default 200)"
                }
            },
            "required": ["pattern"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
        let Some(pattern) = call.input.get("pattern").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'pattern'");
        };
        let path = call
            .input
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".");
        let limit = call
            .input
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_LIMIT as u64) as usize;

        let re = match glob_to_regex(pattern) {
            Ok(re) => re,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid glob: {e}")),
        };

        let root = ctx.cwd.join(path);
        let result = tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            for entry in WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| {
                    !e.file_name()
                        .to_str()
                        .map(|n| super::grep::SKIP_DIRS.contains(&n))
                        .unwrap_or(false)
                })
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .into_owned();
                if re.is_match(&rel) {
                    paths.push(rel);
                    if paths.len() >= limit {
                        break;
                    }
                }
            }
            paths.sort();
            paths
        })
        .await;

        match result {
            Ok(paths) if paths.is_empty() => ToolOutput::ok(&call.id, "no files matched"),
            Ok(paths) => ToolOutput::ok(&call.id, paths.join("\n")),
            Err(e) => ToolOutput::err(&call.id, format!("glob failed: {e}")),
        }
    }
}
