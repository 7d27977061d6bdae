// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

use crate::tool::{ExecContext, Tool, ToolCall, ToolOutput};

/// Directories that are never worth searching.
pub(crate) const SKIP_DIRS: &[&str] = &[".git", "target", "node_modules", ".venv", "__pycache__"];

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Regex search across files. pattern: full regex. path: file or\n\
         directory (default: working directory). include: glob filter such\n\
         as '*.rs'. case_sensitive: true by default. limit: 100 matches by\n\
         default. Output is 'path:line: text'. .git, target, node_modules\n\
         are skipped automatically; binary files are ignored."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {
                    "type": "string",
                    "description": "Regular expression pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search in (default: working directory)"
                },
                "include": {
                    "type": "string",
                    "description": "Glob pattern to filter files, e.g. '*.rs'"
                },
                "case_sensitive": {
                    "type": "boolean",
                    "description": "Case-sensitive search (default true)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of matches to return (default 100)"
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
        let include = call
            .input
            .get("include")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let case_sensitive = call
            .input
            .get("case_sensitive")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let limit = call
            .input
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(100) as usize;

        debug!(pattern, path, "grep tool");

        let re = match RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
        {
            Ok(re) => re,
            Err(e) => return ToolOutput::err(&call.id, format!("invalid pattern: {e}")),
        };
        let include_re = match include.as_deref().map(super::glob::glob_to_regex) {
            Some(Ok(re)) => Some(re),
            Some(Err(e)) => return ToolOutput::err(&call.id, format!("invalid include glob: {e}")),
            None => None,
        };

        let root = ctx.cwd.join(path);
        let cancel = ctx.cancel.clone();

        // Filesystem walking is blocking work.
        let result = tokio::task::spawn_blocking(move || {
            let mut matches = Vec::new();
            let mut scanned = 0usize;
            'outer: for entry in WalkDir::new(&root)
                .into_iter()
                .filter_entry(|e| {
                    !e.file_name()
                        .to_str()
                        .map(|n| SKIP_DIRS.contains(&n))
                        .unwrap_or(false)
                })
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                if cancel.is_cancelled() {
                    break;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .into_owned();
                if let Some(inc) = &include_re {
                    let name = entry.file_name().to_string_lossy();
                    if !inc.is_match(&name) && !inc.is_match(&rel) {
                        continue;
                    }
                }
                let Ok(text) = std::fs::read_to_string(entry.path()) else {
                    continue; // binary or unreadable
                };
                scanned += 1;
                for (ln, line) in text.lines().enumerate() {
                    if re.is_match(line) {
                        matches.push(format!("{rel}:{}: {}", ln + 1, line.trim_end()));
                        if matches.len() >= limit {
                            break 'outer;
                        }
                    }
                }
            }
            (matches, scanned)
        })
        .await;

        match result {
            Ok((matches, _)) if matches.is_empty() => {
                ToolOutput::ok(&call.id, "no matches found")
            }
            Ok((matches, _)) => ToolOutput::ok(&call.id, matches.join("\n")),
            Err(e) => ToolOutput::err(&call.id, format!("search failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio_util::sync::CancellationToken;

    fn ctx_in(dir: &std::path::Path) -> ExecContext {
        ExecContext::new(
            CancellationToken::new(),
            PathBuf::from(dir),
            std::env::temp_dir(),
        )
    }

    fn call(input: Value) -> ToolCall {
        ToolCall {
            id: "t".into(),
            name: "grep".into(),
            input,
        }
    }

    #[tokio::test]
    async fn finds_matches_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}\nfn helper() {}\n").unwrap();
        let out = GrepTool
            .execute(&call(json!({"pattern": "fn \\w+"})), &ctx_in(dir.path()))
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("a.rs:1:"));
        assert!(out.content.contains("a.rs:2:"));
    }

    #[tokio::test]
    async fn include_filter_restricts_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "needle\n").unwrap();
        std::fs::write(dir.path().join("b.txt"), "needle\n").unwrap();
        let out = GrepTool
            .execute(
                &call(json!({"pattern": "needle", "include": "*.rs"})),
                &ctx_in(dir.path()),
            )
            .await;
        assert!(out.content.contains("a.rs"));
        assert!(!out.content.contains("b.txt"));
    }

    #[tokio::test]
    async fn no_matches_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "nothing here\n").unwrap();
        let out = GrepTool
            .execute(&call(json!({"pattern": "zzz9qq"})), &ctx_in(dir.path()))
            .await;
        assert!(!out.is_error);
        assert_eq!(out.content, "no matches found");
    }

    #[tokio::test]
    async fn invalid_regex_is_an_error() {
        let out = GrepTool
            .execute(&call(json!({"pattern": "("})), &ExecContext::default())
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn limit_caps_match_count() {
        let dir = tempfile::tempdir().unwrap();
        let body = "x\n".repeat(50);
        std::fs::write(dir.path().join("a.txt"), body).unwrap();
        let out = GrepTool
            .execute(
                &call(json!({"pattern": "x", "limit": 5})),
                &ctx_in(dir.path()),
            )
            .await;
        assert_eq!(out.content.lines().count(), 5);
    }
}
