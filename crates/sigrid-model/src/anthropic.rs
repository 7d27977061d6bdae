// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use sigrid_config::RetryConfig;

use crate::{
    error::{classify_status, EngineError, ErrorKind},
    provider::EventStream,
    retry::{backoff_delay, parse_retry_after, rate_limit_delay},
    BlockStart, CompletionRequest, ContentBlock, Message, ResultBlock, Role, StopReason,
    StreamEvent, Usage,
};

/// Closure that produces the authentication headers for one request.
///
/// This is the only place the four hosted adapters differ: direct uses
/// `x-api-key`, Bedrock and Vertex use bearer tokens minted outside the
/// core, Foundry uses `api-key`.  Injected at construction so the client
/// itself stays adapter-agnostic.
pub type HeaderFn = Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>;

pub struct AnthropicClient {
    name: String,
    model: String,
    base_url: String,
    max_output_tokens: u32,
    retry: RetryConfig,
    /// Attach a `cache_control` block to the system message so the provider
    /// caches the prompt prefix across turns.
    cache_system_prompt: bool,
    /// Attach a `cache_control` marker to the last tool definition so all
    /// tool definitions are cached as a single prefix.
    cache_tools: bool,
    headers: HeaderFn,
    client: reqwest::Client,
}

impl AnthropicClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        max_output_tokens: u32,
        retry: RetryConfig,
        cache_system_prompt: bool,
        cache_tools: bool,
        headers: HeaderFn,
    ) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into(),
            max_output_tokens,
            retry,
            cache_system_prompt,
            cache_tools,
            headers,
            // reqwest reads HTTP(S)_PROXY / NO_PROXY from the environment.
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &CompletionRequest) -> Value {
        let model = if req.model.is_empty() {
            &self.model
        } else {
            &req.model
        };
        let max_tokens = if req.max_output_tokens > 0 {
            req.max_output_tokens
        } else {
            self.max_output_tokens
        };

        let mut body = json!({
            "model": model,
            "messages": build_wire_messages(&req.messages),
            "max_tokens": max_tokens,
            "stream": true,
        });

        if let Some(system) = &req.system {
            if self.cache_system_prompt {
                body["system"] = json!([{
                    "type": "text",
                    "text": system,
                    "cache_control": { "type": "ephemeral" },
                }]);
            } else {
                body["system"] = json!(system);
            }
        }

        if !req.tools.is_empty() {
            let last = req.tools.len() - 1;
            let tools: Vec<Value> = req
                .tools
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let mut v = json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    });
                    if self.cache_tools && i == last {
                        v["cache_control"] = json!({ "type": "ephemeral" });
                    }
                    v
                })
                .collect();
            body["tools"] = json!(tools);
        }

        if !req.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(req.stop_sequences);
        }
        if let Some(thinking) = &req.thinking {
            body["thinking"] = json!({
                "type": "enabled",
                "budget_tokens": thinking.budget_tokens,
            });
        }
        body
    }

    /// Send the request, retrying transient failures with exponential
    /// backoff and full jitter.  A 429 honours the `retry-after` hint by
    /// taking the max of the hint and the computed backoff.
    async fn send_with_retry(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);
        let mut attempt = 0u32;
        loop {
            let mut builder = self.client.post(&url);
            for (k, v) in (self.headers)() {
                builder = builder.header(k, v);
            }
            let result = builder.json(body).send().await;

            let (status, retry_after, text) = match result {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    let text = resp.text().await.unwrap_or_default();
                    (status, retry_after, text)
                }
                Err(e) => {
                    // Connection-level failure: no status to classify, treat
                    // as transport and retry.
                    if attempt < self.retry.max_retries {
                        let delay = backoff_delay(attempt, &self.retry);
                        warn!(attempt, delay_ms = delay.as_millis() as u64,
                              error = %e, "provider request failed, retrying");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(anyhow::Error::new(e).context("provider request failed"));
                }
            };

            let kind = classify_status(status, &text);
            if kind.is_retryable() && attempt < self.retry.max_retries {
                let backoff = backoff_delay(attempt, &self.retry);
                let delay = if kind == ErrorKind::RateLimit {
                    rate_limit_delay(backoff, retry_after)
                } else {
                    backoff
                };
                warn!(status, attempt, delay_ms = delay.as_millis() as u64,
                      "provider returned retryable error");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            let mut err = EngineError::new(kind, format!("provider error {status}: {text}"));
            if let Some(h) = retry_after {
                err = err.with_retry_after(h);
            }
            return Err(err.into());
        }
    }
}

#[async_trait]
impl crate::ProviderClient for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let body = self.build_body(&req);
        debug!(model = %self.model, messages = req.messages.len(),
               tools = req.tools.len(), "sending completion request");

        let resp = self
            .send_with_retry(&body)
            .await
            .context("completion request admission failed")?;

        let byte_stream = resp.bytes_stream();
        // SSE lines can be split across TCP chunks, so a remainder buffer is
        // carried forward.  Only complete lines (terminated by '\n') are
        // parsed; anything left over is prepended to the next chunk.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let text = match chunk {
                    Ok(b) => String::from_utf8_lossy(&b).to_string(),
                    Err(e) => {
                        return futures::future::ready(Some(vec![Err(anyhow::Error::new(
                            EngineError::new(ErrorKind::Transport, e.to_string()),
                        ))]));
                    }
                };
                buf.push_str(&text);
                let mut events = Vec::new();
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if let Ok(v) = serde_json::from_str::<Value>(data.trim()) {
                            if let Some(ev) = parse_stream_event(&v) {
                                events.push(Ok(ev));
                            }
                        }
                    }
                }
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Parse one SSE payload into a [`StreamEvent`].
///
/// Returns `None` for events that carry nothing the engine consumes
/// (pings, signature deltas, unknown future event types).
pub(crate) fn parse_stream_event(v: &Value) -> Option<StreamEvent> {
    match v["type"].as_str().unwrap_or("") {
        "message_start" => {
            let usage = parse_usage(v["message"].get("usage"));
            Some(StreamEvent::MessageStart { usage })
        }
        "content_block_start" => {
            let index = v["index"].as_u64().unwrap_or(0) as usize;
            let block = &v["content_block"];
            let start = match block["type"].as_str().unwrap_or("") {
                "tool_use" => BlockStart::ToolUse {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                },
                "thinking" | "redacted_thinking" => BlockStart::Thinking,
                _ => BlockStart::Text,
            };
            Some(StreamEvent::ContentBlockStart {
                index,
                block: start,
            })
        }
        "content_block_delta" => {
            let index = v["index"].as_u64().unwrap_or(0) as usize;
            let delta = &v["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => Some(StreamEvent::TextDelta {
                    index,
                    text: delta["text"].as_str().unwrap_or("").to_string(),
                }),
                "input_json_delta" => Some(StreamEvent::InputJsonDelta {
                    index,
                    partial_json: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }),
                "thinking_delta" => {
                    let text = delta["thinking"].as_str().unwrap_or("");
                    if text.is_empty() {
                        None
                    } else {
                        Some(StreamEvent::ThinkingDelta {
                            index,
                            text: text.to_string(),
                        })
                    }
                }
                // The encrypted integrity blob at the end of a thinking
                // block; never surfaced.
                "signature_delta" => None,
                _ => None,
            }
        }
        "content_block_stop" => Some(StreamEvent::ContentBlockStop {
            index: v["index"].as_u64().unwrap_or(0) as usize,
        }),
        "message_delta" => {
            let stop_reason = v["delta"]["stop_reason"].as_str().and_then(StopReason::parse);
            let usage = parse_usage(v.get("usage"));
            Some(StreamEvent::MessageDelta { stop_reason, usage })
        }
        "message_stop" => Some(StreamEvent::MessageStop),
        "error" => {
            let etype = v["error"]["type"].as_str().unwrap_or("");
            let message = v["error"]["message"].as_str().unwrap_or("").to_string();
            let kind = match etype {
                "overloaded_error" | "api_error" => ErrorKind::Transport,
                "rate_limit_error" => ErrorKind::RateLimit,
                "authentication_error" | "permission_error" => ErrorKind::Auth,
                "invalid_request_error" => ErrorKind::Validation,
                _ => ErrorKind::Internal,
            };
            Some(StreamEvent::Error {
                kind,
                retryable: kind.is_retryable(),
                message,
            })
        }
        // "ping" and any future event types.
        _ => None,
    }
}

fn parse_usage(v: Option<&Value>) -> Usage {
    let Some(u) = v else { return Usage::default() };
    Usage {
        input_tokens: u["input_tokens"].as_u64().unwrap_or(0),
        output_tokens: u["output_tokens"].as_u64().unwrap_or(0),
        cache_creation_tokens: u["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        cache_read_tokens: u["cache_read_input_tokens"].as_u64().unwrap_or(0),
        estimated_cost_usd: 0.0,
    }
}

/// Convert history messages into the provider wire format.
///
/// A `ToolResult` whose content is only `ToolRef` blocks collapses to the
/// sentinel text `[tool references]` — the pointers would be re-resolved on
/// our side and carry no information the model can use.
pub(crate) fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            let content: Vec<Value> = m.content.iter().map(block_to_wire).collect();
            json!({ "role": role, "content": content })
        })
        .collect()
}

fn block_to_wire(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let only_refs =
                !content.is_empty() && content.iter().all(|b| matches!(b, ResultBlock::ToolRef { .. }));
            let wire_content: Value = if only_refs {
                json!("[tool references]")
            } else if content.len() == 1 {
                match &content[0] {
                    ResultBlock::Text { text } => json!(text),
                    other => json!([result_block_to_wire(other)]),
                }
            } else {
                json!(content
                    .iter()
                    .filter(|b| !matches!(b, ResultBlock::ToolRef { .. }))
                    .map(result_block_to_wire)
                    .collect::<Vec<_>>())
            };
            json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": wire_content,
                "is_error": is_error,
            })
        }
        ContentBlock::Thinking { text } => json!({ "type": "thinking", "thinking": text }),
        ContentBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
    }
}

fn result_block_to_wire(block: &ResultBlock) -> Value {
    match block {
        ResultBlock::Text { text } => json!({ "type": "text", "text": text }),
        ResultBlock::ToolRef { .. } => json!({ "type": "text", "text": "[tool references]" }),
        ResultBlock::Image { media_type, data } => json!({
            "type": "image",
            "source": { "type": "base64", "media_type": media_type, "data": data },
        }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── parse_stream_event ────────────────────────────────────────────────────

    #[test]
    fn message_start_yields_usage() {
        let v = json!({
            "type": "message_start",
            "message": { "usage": {
                "input_tokens": 42,
                "cache_read_input_tokens": 10,
                "cache_creation_input_tokens": 5,
            }}
        });
        match parse_stream_event(&v) {
            Some(StreamEvent::MessageStart { usage }) => {
                assert_eq!(usage.input_tokens, 42);
                assert_eq!(usage.cache_read_tokens, 10);
                assert_eq!(usage.cache_creation_tokens, 5);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn content_block_start_tool_use_carries_id_name_index() {
        let v = json!({
            "type": "content_block_start",
            "index": 2,
            "content_block": { "type": "tool_use", "id": "toolu_01", "name": "grep" }
        });
        match parse_stream_event(&v) {
            Some(StreamEvent::ContentBlockStart { index, block }) => {
                assert_eq!(index, 2);
                assert_eq!(
                    block,
                    BlockStart::ToolUse {
                        id: "toolu_01".into(),
                        name: "grep".into()
                    }
                );
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn content_block_start_thinking() {
        let v = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "thinking" }
        });
        assert!(matches!(
            parse_stream_event(&v),
            Some(StreamEvent::ContentBlockStart {
                block: BlockStart::Thinking,
                ..
            })
        ));
    }

    #[test]
    fn text_delta_preserves_index_and_text() {
        let v = json!({
            "type": "content_block_delta",
            "index": 1,
            "delta": { "type": "text_delta", "text": "world" }
        });
        assert!(matches!(
            parse_stream_event(&v),
            Some(StreamEvent::TextDelta { index: 1, text }) if text == "world"
        ));
    }

    #[test]
    fn input_json_delta_accumulates_partial_json() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "input_json_delta", "partial_json": "{\"path\":" }
        });
        assert!(matches!(
            parse_stream_event(&v),
            Some(StreamEvent::InputJsonDelta { partial_json, .. }) if partial_json == "{\"path\":"
        ));
    }

    #[test]
    fn signature_delta_is_silently_discarded() {
        let v = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "signature_delta", "signature": "EqRkLm..." }
        });
        assert!(parse_stream_event(&v).is_none());
    }

    #[test]
    fn message_delta_carries_stop_reason_and_output_tokens() {
        let v = json!({
            "type": "message_delta",
            "delta": { "stop_reason": "tool_use" },
            "usage": { "output_tokens": 88 }
        });
        match parse_stream_event(&v) {
            Some(StreamEvent::MessageDelta { stop_reason, usage }) => {
                assert_eq!(stop_reason, Some(StopReason::ToolUse));
                assert_eq!(usage.output_tokens, 88);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn message_stop_yields_terminal_event() {
        let v = json!({ "type": "message_stop" });
        assert!(matches!(
            parse_stream_event(&v),
            Some(StreamEvent::MessageStop)
        ));
    }

    #[test]
    fn ping_is_skipped() {
        assert!(parse_stream_event(&json!({ "type": "ping" })).is_none());
    }

    #[test]
    fn overloaded_error_is_retryable_transport() {
        let v = json!({
            "type": "error",
            "error": { "type": "overloaded_error", "message": "Overloaded" }
        });
        match parse_stream_event(&v) {
            Some(StreamEvent::Error {
                kind, retryable, ..
            }) => {
                assert_eq!(kind, ErrorKind::Transport);
                assert!(retryable);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    // ── Wire format ───────────────────────────────────────────────────────────

    #[test]
    fn plain_text_message_serializes_as_text_block() {
        let wire = build_wire_messages(&[Message::user("hello")]);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "text");
        assert_eq!(wire[0]["content"][0]["text"], "hello");
    }

    #[test]
    fn tool_use_block_keeps_id_and_input() {
        let m = Message {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "toolu_9".into(),
                name: "shell".into(),
                input: json!({"command": "ls"}),
            }],
        };
        let wire = build_wire_messages(&[m]);
        let block = &wire[0]["content"][0];
        assert_eq!(block["type"], "tool_use");
        assert_eq!(block["id"], "toolu_9");
        assert_eq!(block["input"]["command"], "ls");
    }

    #[test]
    fn single_text_tool_result_collapses_to_string_content() {
        let m = Message::tool_results(vec![Message::tool_result_block("t1", "ok", false)]);
        let wire = build_wire_messages(&[m]);
        let block = &wire[0]["content"][0];
        assert_eq!(block["type"], "tool_result");
        assert_eq!(block["tool_use_id"], "t1");
        assert_eq!(block["content"], "ok");
        assert_eq!(block["is_error"], false);
    }

    #[test]
    fn ref_only_tool_result_collapses_to_sentinel() {
        let m = Message::tool_results(vec![ContentBlock::ToolResult {
            tool_use_id: "t2".into(),
            content: vec![
                ResultBlock::ToolRef { id: "a".into() },
                ResultBlock::ToolRef { id: "b".into() },
            ],
            is_error: false,
        }]);
        let wire = build_wire_messages(&[m]);
        assert_eq!(wire[0]["content"][0]["content"], "[tool references]");
    }

    #[test]
    fn thinking_block_serializes_with_thinking_key() {
        let m = Message {
            role: Role::Assistant,
            content: vec![ContentBlock::Thinking {
                text: "reasoning".into(),
            }],
        };
        let wire = build_wire_messages(&[m]);
        assert_eq!(wire[0]["content"][0]["type"], "thinking");
        assert_eq!(wire[0]["content"][0]["thinking"], "reasoning");
    }

    // ── Request body ──────────────────────────────────────────────────────────

    fn client() -> AnthropicClient {
        AnthropicClient::new(
            "anthropic",
            "claude-sonnet-4-5",
            "https://api.anthropic.com",
            8192,
            RetryConfig::default(),
            true,
            true,
            Arc::new(Vec::new),
        )
    }

    #[test]
    fn body_includes_cached_system_block() {
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            system: Some("be terse".into()),
            ..Default::default()
        };
        let body = client().build_body(&req);
        assert_eq!(body["system"][0]["text"], "be terse");
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn body_marks_only_last_tool_for_caching() {
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![
                crate::ToolSchema {
                    name: "a".into(),
                    description: String::new(),
                    input_schema: json!({"type": "object"}),
                },
                crate::ToolSchema {
                    name: "b".into(),
                    description: String::new(),
                    input_schema: json!({"type": "object"}),
                },
            ],
            ..Default::default()
        };
        let body = client().build_body(&req);
        assert!(body["tools"][0].get("cache_control").is_none());
        assert_eq!(body["tools"][1]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn body_carries_stop_sequences_and_thinking() {
        let req = CompletionRequest {
            messages: vec![Message::user("hi")],
            stop_sequences: vec!["STOP".into()],
            thinking: Some(crate::ThinkingConfig {
                budget_tokens: 1024,
            }),
            ..Default::default()
        };
        let body = client().build_body(&req);
        assert_eq!(body["stop_sequences"][0], "STOP");
        assert_eq!(body["thinking"]["budget_tokens"], 1024);
    }
}
