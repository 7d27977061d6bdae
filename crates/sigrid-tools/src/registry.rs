// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use crate::tool::Tool;

/// A tool schema — mirrors `sigrid_model::ToolSchema` but keeps the tools
/// crate independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Central registry holding all available tools.
///
/// Written once during process init (built-ins, then MCP-discovered tools),
/// read-only afterwards; shared via `Arc`.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Produce schemas for all registered tools, sorted by name for a
    /// stable prompt prefix (helps provider-side caching).
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Schemas restricted to read-only tools (used by read-only agent types).
    pub fn read_only_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| t.read_only())
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Restrict to a named subset (unknown names are ignored).
    pub fn subset(&self, names: &[String]) -> ToolRegistry {
        let mut out = ToolRegistry::new();
        for n in names {
            if let Some(t) = self.tools.get(n) {
                out.tools.insert(n.clone(), Arc::clone(t));
            }
        }
        out
    }

    /// Restrict to read-only tools.
    pub fn read_only_subset(&self) -> ToolRegistry {
        let mut out = ToolRegistry::new();
        for (n, t) in &self.tools {
            if t.read_only() {
                out.tools.insert(n.clone(), Arc::clone(t));
            }
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
