// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use sigrid_config::{PermissionMode, PermissionsConfig};

use crate::tool::Tool;

/// Result of adjudicating one tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    fn deny(reason: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Interactive approval callback: `(tool_name, input) → approved`.
/// Absent in non-interactive sessions, where the fallback is deny.
pub type PromptCallback = Arc<dyn Fn(&str, &Value) -> bool + Send + Sync>;

/// Pre-execution policy check for every tool invocation.
///
/// Adjudication order: mode `plan` (deny mutating), mode `bypass` (allow),
/// explicit disallow list, explicit allow list, tool-specific heuristics
/// (shell command injection, path traversal), then the interactive prompt
/// or deny.
pub struct PermissionGate {
    mode: PermissionMode,
    allowed: Vec<Regex>,
    disallowed: Vec<Regex>,
    has_allow_list: bool,
    prompt: Option<PromptCallback>,
}

impl PermissionGate {
    pub fn new(config: &PermissionsConfig, prompt: Option<PromptCallback>) -> Self {
        let compile = |patterns: &[String]| -> Vec<Regex> {
            patterns.iter().filter_map(|p| glob_to_regex(p)).collect()
        };
        Self {
            mode: config.mode,
            allowed: compile(&config.allowed_tools),
            disallowed: compile(&config.disallowed_tools),
            has_allow_list: !config.allowed_tools.is_empty(),
            prompt,
        }
    }

    /// Convenience constructor for a fixed mode with empty lists.
    pub fn for_mode(mode: PermissionMode) -> Self {
        Self::new(
            &PermissionsConfig {
                mode,
                ..Default::default()
            },
            None,
        )
    }

    pub fn mode(&self) -> PermissionMode {
        self.mode
    }

    pub fn adjudicate(&self, tool: &dyn Tool, input: &Value) -> Decision {
        let name = tool.name();

        // 1. Plan mode denies every mutating tool.
        if self.mode == PermissionMode::Plan && !tool.read_only() {
            return Decision::deny(format!("plan mode denies mutating tool '{name}'"));
        }

        // 2. Bypass allows everything.
        if self.mode == PermissionMode::Bypass {
            return Decision::Allow;
        }

        // 3. Explicit disallow list wins.
        if self.disallowed.iter().any(|re| re.is_match(name)) {
            return Decision::deny(format!("tool '{name}' is disallowed by policy"));
        }

        // 4. When an allow list is present, only members pass.
        if self.has_allow_list {
            return if self.allowed.iter().any(|re| re.is_match(name)) {
                Decision::Allow
            } else {
                Decision::deny(format!("tool '{name}' is not on the allow list"))
            };
        }

        // 5. Tool-specific rules.
        if name == "shell" {
            if let Some(cmd) = input.get("command").and_then(|v| v.as_str()) {
                if let Some(why) = risky_shell_command(cmd) {
                    return self.escalate(name, input, why);
                }
            }
        }
        if let Some(path) = input.get("path").and_then(|v| v.as_str()) {
            if has_path_traversal(path) {
                return Decision::deny(format!("path traversal rejected: {path}"));
            }
        }

        // 6. Mode-dependent fallback.
        if tool.read_only() {
            return Decision::Allow;
        }
        if self.mode == PermissionMode::AcceptEdits && is_edit_tool(name) {
            return Decision::Allow;
        }
        if self.mode == PermissionMode::DenyUnknown {
            return Decision::deny(format!("tool '{name}' denied (deny_unknown mode)"));
        }
        self.escalate(name, input, "mutating tool")
    }

    /// Ask the operator, or deny when the session is non-interactive.
    fn escalate(&self, name: &str, input: &Value, why: &str) -> Decision {
        match &self.prompt {
            Some(cb) => {
                debug!(tool = name, why, "prompting operator for approval");
                if cb(name, input) {
                    Decision::Allow
                } else {
                    Decision::deny(format!("operator denied '{name}'"))
                }
            }
            None => Decision::deny(format!("'{name}' requires approval ({why}); non-interactive session")),
        }
    }
}

/// Detect shell constructs that smuggle extra commands past a per-command
/// review: substitution, chaining into destructive commands, piping a
/// download into an interpreter.  Returns a short reason when risky.
fn risky_shell_command(cmd: &str) -> Option<&'static str> {
    if cmd.contains("$(") || cmd.contains('`') {
        return Some("command substitution");
    }
    if cmd.contains("rm -rf /") || cmd.contains("rm -fr /") {
        return Some("recursive delete from root");
    }
    let pipe_to_shell = Regex::new(r"\|\s*(sh|bash|zsh)\b").unwrap();
    if pipe_to_shell.is_match(cmd) {
        return Some("pipe into shell interpreter");
    }
    if cmd.contains(">/etc/") || cmd.contains("> /etc/") {
        return Some("redirect into /etc");
    }
    None
}

/// Reject paths that climb out of the working tree.
fn has_path_traversal(path: &str) -> bool {
    std::path::Path::new(path)
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

fn is_edit_tool(name: &str) -> bool {
    matches!(name, "write_file" | "edit_file")
}

/// Convert a simple shell glob pattern to a [`Regex`].
/// Only `*` (match anything) and `?` (match one char) are supported.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => {
                for esc in regex::escape(&c.to_string()).chars() {
                    re.push(esc);
                }
            }
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
