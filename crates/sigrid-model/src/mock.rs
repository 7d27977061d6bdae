// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::Value;

use crate::{
    provider::EventStream, BlockStart, CompletionRequest, StopReason, StreamEvent, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct MockProvider;

#[async_trait]
impl crate::ProviderClient for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == crate::Role::User)
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".into());
        let events = text_script(format!("MOCK: {reply}"));
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

/// A pre-scripted mock provider.  Each call to `stream` pops the next
/// event script from the front of the queue.  This lets tests specify
/// exact event sequences — including tool-use blocks — without network
/// access.
pub struct ScriptedMockProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `stream()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
    /// Every request seen, in order.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedMockProvider {
    /// Build a provider from a list of event scripts.  The outer `Vec` is
    /// the ordered list of calls; the inner `Vec` is the event sequence
    /// emitted for that call.
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            last_request: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Convenience: provider that always returns a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![text_script(reply.into())])
    }

    /// Convenience: a turn with parallel tool-use blocks followed by a
    /// final text turn once the results come back.
    pub fn tools_then_text(calls: Vec<(&str, &str, Value)>, final_text: impl Into<String>) -> Self {
        Self::new(vec![tool_use_script(calls), text_script(final_text.into())])
    }
}

#[async_trait]
impl crate::ProviderClient for ScriptedMockProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }
    fn model_name(&self) -> &str {
        "scripted-mock-model"
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream> {
        *self.last_request.lock().unwrap() = Some(req.clone());
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                // Default fallback when all scripts are consumed.
                text_script("[no more scripts]".into())
            } else {
                scripts.remove(0)
            }
        };
        let wrapped: Vec<anyhow::Result<StreamEvent>> = events.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Script builders ──────────────────────────────────────────────────────────

/// A complete single-text-block stream ending with `end_turn`.
pub fn text_script(text: String) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            usage: Usage {
                input_tokens: 10,
                ..Default::default()
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            block: BlockStart::Text,
        },
        StreamEvent::TextDelta { index: 0, text },
        StreamEvent::ContentBlockStop { index: 0 },
        StreamEvent::MessageDelta {
            stop_reason: Some(StopReason::EndTurn),
            usage: Usage {
                output_tokens: 10,
                ..Default::default()
            },
        },
        StreamEvent::MessageStop,
    ]
}

/// A complete stream emitting one tool-use block per `(id, name, input)`,
/// ending with `tool_use`.
pub fn tool_use_script(calls: Vec<(&str, &str, Value)>) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::MessageStart {
        usage: Usage {
            input_tokens: 20,
            ..Default::default()
        },
    }];
    for (index, (id, name, input)) in calls.into_iter().enumerate() {
        events.push(StreamEvent::ContentBlockStart {
            index,
            block: BlockStart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
            },
        });
        events.push(StreamEvent::InputJsonDelta {
            index,
            partial_json: input.to_string(),
        });
        events.push(StreamEvent::ContentBlockStop { index });
    }
    events.push(StreamEvent::MessageDelta {
        stop_reason: Some(StopReason::ToolUse),
        usage: Usage {
            output_tokens: 15,
            ..Default::default()
        },
    });
    events.push(StreamEvent::MessageStop);
    events
}

/// A stream truncated by the output-token limit.
pub fn max_tokens_script(partial_text: String) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            usage: Usage {
                input_tokens: 10,
                ..Default::default()
            },
        },
        StreamEvent::ContentBlockStart {
            index: 0,
            block: BlockStart::Text,
        },
        StreamEvent::TextDelta {
            index: 0,
            text: partial_text,
        },
        StreamEvent::MessageDelta {
            stop_reason: Some(StopReason::MaxTokens),
            usage: Usage {
                output_tokens: 8192,
                ..Default::default()
            },
        },
        StreamEvent::MessageStop,
    ]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::{Message, ProviderClient};

    fn req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    async fn collect(mut s: EventStream) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn mock_echoes_last_user_message() {
        let p = MockProvider;
        let events = collect(p.stream(req()).await.unwrap()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { text, .. } if text.contains("MOCK: hi"))));
    }

    #[tokio::test]
    async fn scripted_stream_ends_with_message_stop() {
        let p = ScriptedMockProvider::always_text("hello");
        let events = collect(p.stream(req()).await.unwrap()).await;
        assert!(matches!(events.last(), Some(StreamEvent::MessageStop)));
    }

    #[tokio::test]
    async fn scripted_tool_use_then_text() {
        let p = ScriptedMockProvider::tools_then_text(
            vec![("t1", "read_file", json!({"path": "/a"}))],
            "done",
        );

        let events = collect(p.stream(req()).await.unwrap()).await;
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ContentBlockStart { block: BlockStart::ToolUse { name, .. }, .. }
            if name == "read_file"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::MessageDelta { stop_reason: Some(StopReason::ToolUse), .. }
        )));

        let events2 = collect(p.stream(req()).await.unwrap()).await;
        assert!(events2
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { text, .. } if text == "done")));
    }

    #[tokio::test]
    async fn scripted_records_requests() {
        let p = ScriptedMockProvider::always_text("x");
        let _ = p.stream(req()).await.unwrap();
        assert!(p.last_request.lock().unwrap().is_some());
        assert_eq!(p.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn scripted_fallback_when_scripts_exhausted() {
        let p = ScriptedMockProvider::new(vec![]);
        let events = collect(p.stream(req()).await.unwrap()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { text, .. } if text.contains("no more scripts"))));
    }
}
