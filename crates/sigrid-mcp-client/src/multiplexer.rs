// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Server registry and tool synthesis.
//!
//! The multiplexer owns one connection per configured server, runs the
//! `initialize` handshake, discovers tools/resources/prompts according to
//! the server's advertised capabilities, and exposes each discovered tool
//! to the execution queue under the name `mcp__<server>__<tool>`.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use sigrid_config::McpServerConfig;
use sigrid_tools::{ExecContext, Tool, ToolCall, ToolOutput, ToolRegistry};

use crate::connection::{spawn_connection, ConnectionHandle, HeaderProvider};
use crate::rpc::PROTOCOL_VERSION;

/// A tool discovered on a remote server.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub remote_name: String,
    pub description: String,
    pub input_schema: Value,
    /// The server's readOnlyHint annotation; discovered tools are
    /// concurrency-safe iff the server declares them read-only.
    pub read_only: bool,
}

struct ServerEntry {
    handle: ConnectionHandle,
    tools: Vec<McpToolInfo>,
    resources: Vec<String>,
    prompts: Vec<String>,
}

pub struct McpMultiplexer {
    servers: HashMap<String, ServerEntry>,
    headers: HeaderProvider,
}

impl McpMultiplexer {
    pub fn new(headers: HeaderProvider) -> Self {
        Self {
            servers: HashMap::new(),
            headers,
        }
    }

    /// Connect one server: transport, `initialize` handshake, discovery.
    pub async fn connect(&mut self, name: &str, config: McpServerConfig) -> anyhow::Result<()> {
        let handle = spawn_connection(name, config, self.headers.clone())
            .await
            .with_context(|| format!("connecting MCP server '{name}'"))?;

        let init = handle
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "clientInfo": { "name": "sigrid", "version": env!("CARGO_PKG_VERSION") },
                    "capabilities": {},
                }),
            )
            .await
            .with_context(|| format!("initialize handshake with '{name}'"))?;
        handle
            .notify("notifications/initialized", json!({}))
            .await?;

        let caps = &init["capabilities"];
        debug!(server = name, version = ?init["protocolVersion"], "MCP server initialized");

        let tools = if caps.get("tools").is_some() {
            discover_tools(&handle).await.unwrap_or_else(|e| {
                warn!(server = name, error = %e, "tools/list failed");
                Vec::new()
            })
        } else {
            Vec::new()
        };
        let resources = if caps.get("resources").is_some() {
            list_names(&handle, "resources/list", "resources", "uri").await
        } else {
            Vec::new()
        };
        let prompts = if caps.get("prompts").is_some() {
            list_names(&handle, "prompts/list", "prompts", "name").await
        } else {
            Vec::new()
        };

        debug!(
            server = name,
            tools = tools.len(),
            resources = resources.len(),
            prompts = prompts.len(),
            "MCP discovery complete"
        );
        self.servers.insert(
            name.to_string(),
            ServerEntry {
                handle,
                tools,
                resources,
                prompts,
            },
        );
        Ok(())
    }

    /// Register every discovered tool with the execution queue's registry.
    pub fn register_tools(&self, registry: &mut ToolRegistry) {
        for (server, entry) in &self.servers {
            for info in &entry.tools {
                registry.register(McpTool {
                    name: synthesized_name(server, &info.remote_name),
                    info: info.clone(),
                    handle: entry.handle.clone(),
                });
            }
        }
    }

    pub fn resources(&self, server: &str) -> &[String] {
        self.servers
            .get(server)
            .map(|e| e.resources.as_slice())
            .unwrap_or(&[])
    }

    pub fn prompts(&self, server: &str) -> &[String] {
        self.servers
            .get(server)
            .map(|e| e.prompts.as_slice())
            .unwrap_or(&[])
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> anyhow::Result<Value> {
        let entry = self
            .servers
            .get(server)
            .with_context(|| format!("unknown MCP server '{server}'"))?;
        entry.handle.request("resources/read", json!({ "uri": uri })).await
    }

    pub async fn get_prompt(&self, server: &str, name: &str) -> anyhow::Result<Value> {
        let entry = self
            .servers
            .get(server)
            .with_context(|| format!("unknown MCP server '{server}'"))?;
        entry.handle.request("prompts/get", json!({ "name": name })).await
    }

    pub async fn close_all(&mut self) {
        for (_, entry) in self.servers.drain() {
            entry.handle.close().await;
        }
    }
}

pub fn synthesized_name(server: &str, tool: &str) -> String {
    format!("mcp__{server}__{tool}")
}

async fn discover_tools(handle: &ConnectionHandle) -> anyhow::Result<Vec<McpToolInfo>> {
    let result = handle.request("tools/list", json!({})).await?;
    let mut tools = Vec::new();
    for t in result["tools"].as_array().cloned().unwrap_or_default() {
        let Some(name) = t["name"].as_str() else { continue };
        tools.push(McpToolInfo {
            remote_name: name.to_string(),
            description: t["description"].as_str().unwrap_or("").to_string(),
            input_schema: t
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| json!({ "type": "object" })),
            read_only: t["annotations"]["readOnlyHint"].as_bool().unwrap_or(false),
        });
    }
    Ok(tools)
}

async fn list_names(
    handle: &ConnectionHandle,
    method: &str,
    key: &str,
    field: &str,
) -> Vec<String> {
    match handle.request(method, json!({})).await {
        Ok(result) => result[key]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i[field].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        Err(e) => {
            warn!(method, error = %e, "MCP listing failed");
            Vec::new()
        }
    }
}

// ─── Synthesized tool ─────────────────────────────────────────────────────────

/// A remote MCP tool behind the standard [`Tool`] trait.
pub struct McpTool {
    name: String,
    info: McpToolInfo,
    handle: ConnectionHandle,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.info.description
    }

    fn input_schema(&self) -> Value {
        self.info.input_schema.clone()
    }

    fn read_only(&self) -> bool {
        self.info.read_only
    }

    fn timeout_default(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
        let request = self.handle.request(
            "tools/call",
            json!({
                "name": self.info.remote_name,
                "arguments": call.input,
            }),
        );
        let result = tokio::select! {
            r = request => r,
            _ = ctx.cancel.cancelled() => {
                let _ = self
                    .handle
                    .notify("notifications/cancelled", json!({ "reason": "client cancel" }))
                    .await;
                return ToolOutput::err(&call.id, "cancelled");
            }
        };
        match result {
            Ok(value) => {
                let is_error = value["isError"].as_bool().unwrap_or(false);
                let text = render_content(&value["content"]);
                if is_error {
                    ToolOutput::err(&call.id, text)
                } else {
                    ToolOutput::ok(&call.id, text)
                }
            }
            Err(e) => ToolOutput::err(&call.id, format!("MCP call failed: {e}")),
        }
    }
}

/// Flatten an MCP content array into plain text.
fn render_content(content: &Value) -> String {
    match content.as_array() {
        Some(blocks) => blocks
            .iter()
            .filter_map(|b| match b["type"].as_str() {
                Some("text") => b["text"].as_str().map(str::to_string),
                Some(other) => Some(format!("[{other} content]")),
                None => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        None => content.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
