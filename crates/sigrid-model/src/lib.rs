// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod adapters;
mod anthropic;
mod error;
mod mock;
mod provider;
mod retry;
mod types;

pub use adapters::build_provider;
pub use anthropic::{AnthropicClient, HeaderFn};
pub use error::{classify, classify_status, redact, EngineError, ErrorKind};
pub use mock::{max_tokens_script, text_script, tool_use_script, MockProvider, ScriptedMockProvider};
pub use provider::{EventStream, ProviderClient};
pub use retry::{backoff_delay, parse_retry_after, rate_limit_delay};
pub use types::{
    estimate_cost_usd, BlockStart, CompletionRequest, ContentBlock, Message, ResultBlock, Role,
    StopReason, StreamEvent, ThinkingConfig, ToolSchema, Usage,
};
