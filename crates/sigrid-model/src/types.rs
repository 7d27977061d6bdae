// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block inside a [`Message`].
///
/// `ToolResult` blocks may only appear in `user` messages, and their
/// `tool_use_id` must match a `ToolUse` block in the immediately preceding
/// assistant message.  The conversation loop enforces this pairing; the data
/// model only represents it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ResultBlock>,
        is_error: bool,
    },
    Thinking {
        text: String,
    },
    Image {
        media_type: String,
        /// Base64-encoded image bytes.
        data: String,
    },
}

/// Content of a tool result.
///
/// Most results are a single `Text` block.  `ToolRef` is a pointer to output
/// that would be re-resolved by the tool layer; a result consisting only of
/// references serializes as the sentinel `[tool references]` to save tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultBlock {
    Text { text: String },
    ToolRef { id: String },
    Image { media_type: String, data: String },
}

impl ResultBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A single message in the conversation history: an ordered sequence of
/// content blocks under one role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// A user message carrying one tool result per answered tool use,
    /// in the given order.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        debug_assert!(results
            .iter()
            .all(|b| matches!(b, ContentBlock::ToolResult { .. })));
        Self {
            role: Role::User,
            content: results,
        }
    }

    /// Convenience constructor for a single plain-text tool result block.
    pub fn tool_result_block(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> ContentBlock {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![ResultBlock::text(content)],
            is_error,
        }
    }

    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All `ToolUse` blocks, in document order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }

    /// `tool_use_id`s of all `ToolResult` blocks, in document order.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    pub fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
    }
}

// ─── Usage ────────────────────────────────────────────────────────────────────

/// Token usage for one turn, or accumulated for a session.
///
/// All four token counts are authoritative values returned by the provider,
/// never estimates, once a turn has completed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
    pub estimated_cost_usd: f64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.estimated_cost_usd += other.estimated_cost_usd;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

/// Per-million-token prices for models we know about; unknown models cost 0.
///
/// (input, output, cache write, cache read) in USD.
fn price_per_mtok(model: &str) -> (f64, f64, f64, f64) {
    if model.contains("opus") {
        (15.0, 75.0, 18.75, 1.5)
    } else if model.contains("sonnet") {
        (3.0, 15.0, 3.75, 0.3)
    } else if model.contains("haiku") {
        (0.8, 4.0, 1.0, 0.08)
    } else {
        (0.0, 0.0, 0.0, 0.0)
    }
}

/// Estimate the dollar cost of one turn's usage for the given model.
pub fn estimate_cost_usd(model: &str, usage: &Usage) -> f64 {
    let (inp, out, cw, cr) = price_per_mtok(model);
    (usage.input_tokens as f64 * inp
        + usage.output_tokens as f64 * out
        + usage.cache_creation_tokens as f64 * cw
        + usage.cache_read_tokens as f64 * cr)
        / 1_000_000.0
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: Value,
}

/// Extended-thinking request parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub max_output_tokens: u32,
    pub stop_sequences: Vec<String>,
    pub thinking: Option<ThinkingConfig>,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// The provider-reported cause for terminating a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Refusal,
}

impl StopReason {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "end_turn" => Some(Self::EndTurn),
            "tool_use" => Some(Self::ToolUse),
            "max_tokens" => Some(Self::MaxTokens),
            "stop_sequence" => Some(Self::StopSequence),
            "refusal" => Some(Self::Refusal),
            _ => None,
        }
    }
}

/// The opening of a content block within a streamed message.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockStart {
    Text,
    ToolUse { id: String, name: String },
    Thinking,
}

/// A single streamed event from the model.
///
/// Per-block events arrive in the order `ContentBlockStart → deltas →
/// ContentBlockStop`; `MessageDelta` arrives at most once per stream and
/// carries the authoritative stop reason; `MessageStop` is the terminal
/// event of a successful stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    MessageStart {
        usage: Usage,
    },
    ContentBlockStart {
        index: usize,
        block: BlockStart,
    },
    TextDelta {
        index: usize,
        text: String,
    },
    InputJsonDelta {
        index: usize,
        partial_json: String,
    },
    ThinkingDelta {
        index: usize,
        text: String,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        stop_reason: Option<StopReason>,
        usage: Usage,
    },
    MessageStop,
    Error {
        kind: crate::ErrorKind,
        retryable: bool,
        message: String,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn message_user_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn message_assistant_sets_role_and_text() {
        let m = Message::assistant("reply");
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.text(), "reply");
    }

    #[test]
    fn tool_result_block_carries_id_and_error_flag() {
        let b = Message::tool_result_block("toolu_01", "output", true);
        match b {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "toolu_01");
                assert!(is_error);
                assert_eq!(content, vec![ResultBlock::text("output")]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn tool_uses_returns_blocks_in_document_order() {
        let m = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text {
                    text: "let me check".into(),
                },
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "read_file".into(),
                    input: json!({"path": "/a"}),
                },
                ContentBlock::ToolUse {
                    id: "b".into(),
                    name: "grep".into(),
                    input: json!({"pattern": "x"}),
                },
            ],
        };
        let uses = m.tool_uses();
        assert_eq!(uses.len(), 2);
        assert_eq!(uses[0].0, "a");
        assert_eq!(uses[1].1, "grep");
    }

    #[test]
    fn tool_result_ids_match_insertion_order() {
        let m = Message::tool_results(vec![
            Message::tool_result_block("x", "1", false),
            Message::tool_result_block("y", "2", false),
        ]);
        assert_eq!(m.tool_result_ids(), vec!["x", "y"]);
    }

    #[test]
    fn text_concatenates_only_text_blocks() {
        let m = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Thinking {
                    text: "hmm".into(),
                },
                ContentBlock::Text { text: "a".into() },
                ContentBlock::Text { text: "b".into() },
            ],
        };
        assert_eq!(m.text(), "ab");
    }

    // ── Serialisation round-trip ──────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let original = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "hi".into() },
                ContentBlock::ToolUse {
                    id: "toolu_1".into(),
                    name: "shell".into(),
                    input: json!({"command": "ls"}),
                },
            ],
        };
        let json = serde_json::to_string(&original).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn content_block_tagging_uses_snake_case_type() {
        let b = ContentBlock::ToolUse {
            id: "t".into(),
            name: "n".into(),
            input: json!({}),
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains("\"type\":\"tool_use\""), "{json}");
    }

    #[test]
    fn result_block_tool_ref_round_trips() {
        let b = ResultBlock::ToolRef { id: "r1".into() };
        let json = serde_json::to_string(&b).unwrap();
        let back: ResultBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, b);
    }

    // ── Stop reasons ──────────────────────────────────────────────────────────

    #[test]
    fn stop_reason_parses_all_known_values() {
        assert_eq!(StopReason::parse("end_turn"), Some(StopReason::EndTurn));
        assert_eq!(StopReason::parse("tool_use"), Some(StopReason::ToolUse));
        assert_eq!(StopReason::parse("max_tokens"), Some(StopReason::MaxTokens));
        assert_eq!(
            StopReason::parse("stop_sequence"),
            Some(StopReason::StopSequence)
        );
        assert_eq!(StopReason::parse("refusal"), Some(StopReason::Refusal));
        assert_eq!(StopReason::parse("other"), None);
    }

    // ── Usage ─────────────────────────────────────────────────────────────────

    #[test]
    fn usage_add_accumulates_all_fields() {
        let mut total = Usage::default();
        total.add(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_tokens: 3,
            cache_read_tokens: 2,
            estimated_cost_usd: 0.01,
        });
        total.add(&Usage {
            input_tokens: 1,
            output_tokens: 1,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            estimated_cost_usd: 0.0,
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.output_tokens, 6);
        assert_eq!(total.total_tokens(), 22);
        assert!(total.estimated_cost_usd > 0.0);
    }

    #[test]
    fn cost_estimate_zero_for_unknown_model() {
        let u = Usage {
            input_tokens: 1_000_000,
            ..Default::default()
        };
        assert_eq!(estimate_cost_usd("some-local-model", &u), 0.0);
    }

    #[test]
    fn cost_estimate_scales_with_tokens() {
        let u = Usage {
            input_tokens: 1_000_000,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            estimated_cost_usd: 0.0,
        };
        assert_eq!(estimate_cost_usd("claude-sonnet-4-5", &u), 3.0);
    }
}
