// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub permissions: PermissionsConfig,
    /// MCP servers to connect to at startup, keyed by server name.
    ///
    /// ```yaml
    /// mcp_servers:
    ///   filesystem:
    ///     transport: stdio
    ///     command: mcp-server-filesystem
    ///     args: ["--root", "/home/me/project"]
    ///   tickets:
    ///     transport: websocket
    ///     url: wss://tickets.internal/mcp
    /// ```
    #[serde(default)]
    pub mcp_servers: HashMap<String, McpServerConfig>,
    /// State directory override.  Defaults to the platform data dir
    /// (`~/.local/share/sigrid`).  Supports `~` expansion.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Session retention period in days.  Sessions older than this are
    /// removed on startup.  `0` disables retention cleanup.
    #[serde(default)]
    pub session_retention_days: u32,
}

// ─── Provider ─────────────────────────────────────────────────────────────────

/// Which hosted adapter the provider client is built for.
///
/// All adapters speak the same streaming message protocol; they differ only
/// in endpoint shape and the authentication headers injected per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderAdapter {
    #[default]
    Direct,
    Bedrock,
    Vertex,
    Foundry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Adapter selection; also settable via `CLAUDE_CODE_USE_BEDROCK`,
    /// `CLAUDE_CODE_USE_VERTEX`, or `CLAUDE_CODE_USE_FOUNDRY`.
    #[serde(default)]
    pub adapter: ProviderAdapter,
    /// Model name forwarded to the provider API.
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files.
    pub api_key: Option<String>,
    /// Base URL override (`ANTHROPIC_BASE_URL` wins over this).
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion.
    pub max_output_tokens: Option<u32>,
    /// Context window of the model.  Defaults to 180 000 when unset.
    pub context_window: Option<u32>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Attach a `cache_control` marker to the system prompt block so the
    /// provider caches the stable prefix across turns.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,
    /// Attach a `cache_control` marker to the last tool definition so all
    /// tool definitions are cached as a single prefix.
    #[serde(default = "default_true")]
    pub cache_tools: bool,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            adapter: ProviderAdapter::Direct,
            model: "claude-sonnet-4-5".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_output_tokens: None,
            context_window: None,
            retry: RetryConfig::default(),
            cache_system_prompt: true,
            cache_tools: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts for transient transport errors.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubled per attempt, full jitter).
    pub base_delay_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

// ─── Agent / loop ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum assistant turns per submitted prompt.  When the model would
    /// begin turn `max_turns + 1`, the loop terminates with a
    /// `max_turns_exceeded` reason and surfaces the partial conversation.
    pub max_turns: u32,
    /// Concurrent sub-agent cap enforced by the scheduler's resource pool.
    pub max_subagent_concurrency: usize,
    /// Emit a `task_progress` attachment at most once per this many
    /// main-loop turns.
    pub progress_interval: u32,
    /// Override the built-in system prompt entirely.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: 50,
            max_subagent_concurrency: 5,
            progress_interval: 3,
            system_prompt: None,
        }
    }
}

// ─── Context management ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Model context window in tokens.  Used when the provider config does
    /// not carry one.
    pub max_window: usize,
    /// Tokens reserved for generation; subtracted from the window before
    /// the compaction trigger is evaluated.
    pub reserve: usize,
    /// Compaction fires when estimated usage reaches this fraction of the
    /// effective window.
    pub trigger_ratio: f32,
    /// Number of most-recent messages preserved verbatim through compaction.
    pub keep_recent: usize,
    /// Tool results above this many characters are folded (head + tail with
    /// a truncation marker).
    pub tool_output_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_window: 180_000,
            reserve: 8_192,
            trigger_ratio: 0.7,
            keep_recent: 10,
            tool_output_max_chars: 10_000,
        }
    }
}

// ─── Tools ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Global tool-execution concurrency cap.  Overridden by the
    /// `CLAUDE_CODE_MAX_TOOL_USE_CONCURRENCY` environment variable.
    pub max_concurrency: usize,
    /// Default per-invocation timeout in seconds; individual tools may
    /// declare their own default and inputs may override it.
    pub default_timeout_secs: u64,
    /// Grace period between a cancel signal and forcible termination.
    pub kill_grace_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            default_timeout_secs: 120,
            kill_grace_secs: 5,
        }
    }
}

// ─── Permissions ──────────────────────────────────────────────────────────────

/// Permission mode the gate adjudicates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Interactive prompt for risky operations.
    #[default]
    Default,
    /// Auto-allow file edits; everything else as `Default`.
    AcceptEdits,
    /// Deny all mutating tools.
    Plan,
    /// Allow everything.
    Bypass,
    /// Deny unless explicitly allow-listed.
    DenyUnknown,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsConfig {
    #[serde(default)]
    pub mode: PermissionMode,
    /// Tools that are always allowed without prompting.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools that are always denied.  Deny wins over allow.
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
}

// ─── MCP servers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransportKind {
    Stdio,
    Http,
    Sse,
    Websocket,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub transport: McpTransportKind,
    /// Executable for `stdio` transports.
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment for the spawned `stdio` child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Endpoint URL for `http` / `sse` / `websocket` transports.
    pub url: Option<String>,
    /// WebSocket keepalive ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

fn default_ping_interval() -> u64 {
    10
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
