// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent-type definitions and discovery.
//!
//! Three types are built in; users add their own as markdown files with
//! YAML frontmatter under an agents config directory:
//!
//! ```markdown
//! ---
//! name: security-auditor
//! description: Security specialist. Use when touching auth code.
//! model: claude-haiku-4-5
//! readonly: true
//! tools: [read_file, grep]
//! ---
//!
//! You are a security expert auditing code for vulnerabilities.
//! ```
//!
//! The body after the frontmatter becomes the system prompt.  `name`
//! defaults to the filename stem; `description` to the first body line.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

/// Which tools an agent type may use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolAccess {
    All,
    ReadOnly,
    Named(Vec<String>),
}

/// Search breadth for the `explore` agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Thoroughness {
    Quick,
    #[default]
    Medium,
    Thorough,
}

impl Thoroughness {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "quick" => Some(Self::Quick),
            "medium" => Some(Self::Medium),
            "thorough" => Some(Self::Thorough),
            _ => None,
        }
    }

    /// Cap on results the agent is told to gather per search.
    pub fn result_cap(self) -> usize {
        match self {
            Self::Quick => 20,
            Self::Medium => 100,
            Self::Thorough => 500,
        }
    }

    /// Maximum assistant turns granted to the sub-conversation.
    pub fn turn_cap(self) -> u32 {
        match self {
            Self::Quick => 10,
            Self::Medium => 25,
            Self::Thorough => 50,
        }
    }
}

/// One agent type: a restricted tool set, a default model, and a system
/// prompt for the sub-conversation.
#[derive(Debug, Clone)]
pub struct AgentType {
    pub name: String,
    pub description: String,
    pub tools: ToolAccess,
    /// `None` means inherit the session model.
    pub model: Option<String>,
    pub system_prompt: String,
    pub read_only: bool,
}

/// The built-in types: `general-purpose`, `explore`, `plan`.
pub fn builtin_types() -> Vec<AgentType> {
    vec![
        AgentType {
            name: "general-purpose".into(),
            description: "General agent with access to all tools. Use for \
                          multi-step tasks that combine searching and editing."
                .into(),
            tools: ToolAccess::All,
            model: None,
            system_prompt: "You are a capable software engineering agent. \
                            Complete the given task using the available tools, \
                            then report what you did and what you found."
                .into(),
            read_only: false,
        },
        AgentType {
            name: "explore".into(),
            description: "Read-only codebase exploration. Use to locate files, \
                          symbols, and behaviours without mutating anything."
                .into(),
            tools: ToolAccess::ReadOnly,
            model: None,
            system_prompt: "You are a codebase exploration agent with read-only \
                            tools. Find what was asked for and report concrete \
                            file paths and line references. Do not propose edits."
                .into(),
            read_only: true,
        },
        AgentType {
            name: "plan".into(),
            description: "Read-only planning. Produces a structured plan artifact \
                          without making changes."
                .into(),
            tools: ToolAccess::ReadOnly,
            model: None,
            system_prompt: "You are a planning agent with read-only tools. \
                            Investigate, then output a structured plan: \
                            ## Goal, ## Steps (numbered, each independently \
                            verifiable), ## Risks. Do not make any changes."
                .into(),
            read_only: true,
        },
    ]
}

// ─── Frontmatter schema ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AgentFrontmatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    readonly: bool,
    #[serde(default)]
    tools: Option<Vec<String>>,
}

/// Parse one agent markdown file.  Files without frontmatter use the whole
/// body as the system prompt.
pub fn parse_agent_file(raw: &str, stem: &str) -> AgentType {
    let (fm, body) = split_frontmatter(raw);
    let fm: AgentFrontmatter = fm
        .and_then(|y| match serde_yaml::from_str(y) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(agent = stem, error = %e, "invalid agent frontmatter; using defaults");
                None
            }
        })
        .unwrap_or(AgentFrontmatter {
            name: None,
            description: None,
            model: None,
            readonly: false,
            tools: None,
        });

    let body = body.trim();
    let tools = match fm.tools {
        Some(names) => ToolAccess::Named(names),
        None if fm.readonly => ToolAccess::ReadOnly,
        None => ToolAccess::All,
    };
    AgentType {
        name: fm.name.unwrap_or_else(|| stem.to_string()),
        description: fm
            .description
            .or_else(|| body.lines().next().map(str::to_string))
            .unwrap_or_default(),
        tools,
        model: fm.model.filter(|m| m != "inherit"),
        system_prompt: body.to_string(),
        read_only: fm.readonly,
    }
}

fn split_frontmatter(raw: &str) -> (Option<&str>, &str) {
    let rest = match raw.strip_prefix("---\n") {
        Some(r) => r,
        None => return (None, raw),
    };
    match rest.split_once("\n---\n") {
        Some((fm, body)) => (Some(fm), body),
        None => (None, raw),
    }
}

/// Directories searched for user-defined agent types, lowest precedence
/// first.  Later files override earlier ones with the same name.
fn agent_search_dirs(project_root: Option<&Path>) -> Vec<PathBuf> {
    let mut dirs_list = Vec::new();
    if let Some(cfg) = dirs::config_dir() {
        dirs_list.push(cfg.join("sigrid").join("agents"));
    }
    if let Some(root) = project_root {
        dirs_list.push(root.join(".sigrid").join("agents"));
    }
    dirs_list
}

/// Discover all agent types: built-ins plus user-defined overrides.
pub fn discover_types(project_root: Option<&Path>) -> Vec<AgentType> {
    let mut by_name: HashMap<String, AgentType> = builtin_types()
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect();

    for dir in agent_search_dirs(project_root) {
        if !dir.is_dir() {
            continue;
        }
        for entry in walkdir::WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("md"))
        {
            let stem = entry
                .path()
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("agent");
            match std::fs::read_to_string(entry.path()) {
                Ok(raw) => {
                    let agent = parse_agent_file(&raw, stem);
                    by_name.insert(agent.name.clone(), agent);
                }
                Err(e) => warn!(path = %entry.path().display(), error = %e, "unreadable agent file"),
            }
        }
    }

    let mut out: Vec<AgentType> = by_name.into_values().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_include_the_three_standard_types() {
        let names: Vec<String> = builtin_types().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["general-purpose", "explore", "plan"]);
    }

    #[test]
    fn explore_and_plan_are_read_only() {
        for t in builtin_types() {
            if t.name == "explore" || t.name == "plan" {
                assert!(t.read_only, "{} must be read-only", t.name);
                assert_eq!(t.tools, ToolAccess::ReadOnly);
            }
        }
    }

    #[test]
    fn thoroughness_levels_scale_caps() {
        assert!(Thoroughness::Quick.result_cap() < Thoroughness::Medium.result_cap());
        assert!(Thoroughness::Medium.result_cap() < Thoroughness::Thorough.result_cap());
        assert!(Thoroughness::Quick.turn_cap() < Thoroughness::Thorough.turn_cap());
        assert_eq!(Thoroughness::parse("thorough"), Some(Thoroughness::Thorough));
        assert_eq!(Thoroughness::parse("bogus"), None);
    }

    #[test]
    fn parse_agent_file_with_frontmatter() {
        let raw = "---\nname: auditor\ndescription: Audits things.\nreadonly: true\n---\n\nYou audit code.\n";
        let agent = parse_agent_file(raw, "fallback");
        assert_eq!(agent.name, "auditor");
        assert_eq!(agent.description, "Audits things.");
        assert!(agent.read_only);
        assert_eq!(agent.tools, ToolAccess::ReadOnly);
        assert_eq!(agent.system_prompt, "You audit code.");
    }

    #[test]
    fn parse_agent_file_without_frontmatter_uses_defaults() {
        let raw = "Just a prompt body.\nSecond line.";
        let agent = parse_agent_file(raw, "my-agent");
        assert_eq!(agent.name, "my-agent");
        assert_eq!(agent.description, "Just a prompt body.");
        assert_eq!(agent.tools, ToolAccess::All);
        assert!(agent.system_prompt.contains("Second line."));
    }

    #[test]
    fn named_tool_list_wins_over_readonly_flag() {
        let raw = "---\nreadonly: true\ntools: [grep, shell]\n---\nbody";
        let agent = parse_agent_file(raw, "x");
        assert_eq!(
            agent.tools,
            ToolAccess::Named(vec!["grep".into(), "shell".into()])
        );
    }

    #[test]
    fn inherit_model_maps_to_none() {
        let raw = "---\nmodel: inherit\n---\nbody";
        assert!(parse_agent_file(raw, "x").model.is_none());
    }

    #[test]
    fn discover_merges_user_types_over_builtins() {
        let dir = tempfile::tempdir().unwrap();
        let agents = dir.path().join(".sigrid/agents");
        std::fs::create_dir_all(&agents).unwrap();
        std::fs::write(
            agents.join("explore.md"),
            "---\nname: explore\ndescription: custom explorer\nreadonly: true\n---\ncustom prompt",
        )
        .unwrap();
        std::fs::write(agents.join("extra.md"), "An extra agent.").unwrap();

        let types = discover_types(Some(dir.path()));
        let explore = types.iter().find(|t| t.name == "explore").unwrap();
        assert_eq!(explore.description, "custom explorer");
        assert!(types.iter().any(|t| t.name == "extra"));
        // Built-ins not overridden are still present.
        assert!(types.iter().any(|t| t.name == "general-purpose"));
    }
}
