// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Context management: token estimation, compaction, tool-output folding.
//!
//! Authoritative token counts come from provider usage; the estimates here
//! only decide *when* to compact, never what to bill.  Compaction replaces
//! the history prefix with a single marker-wrapped summary message so a
//! later compaction recognises and re-summarizes it instead of nesting.

use futures::StreamExt;
use std::sync::Arc;
use tracing::warn;

use sigrid_config::ContextConfig;
use sigrid_model::{
    CompletionRequest, ContentBlock, Message, ProviderClient, ResultBlock, Role, StreamEvent,
};

use crate::prompts::SUMMARIZE_PROMPT;
use crate::session::Session;

/// First line of the synthetic user meta-message a compaction produces.
pub const SUMMARY_MARKER: &str = "[session summary]";

/// Fixed token overhead per message (role framing, block separators).
const MESSAGE_OVERHEAD: usize = 4;

/// Marker inserted where folded tool output was cut.
fn truncation_marker(omitted: usize) -> String {
    format!("… [{omitted} chars truncated] …")
}

// ─── Token estimation ─────────────────────────────────────────────────────────

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{AC00}'..='\u{D7AF}')
}

/// Rough token estimate: ≈3.5 chars/token for Latin text, ≈2 for CJK,
/// ≈3 for code-looking text.
pub fn estimate_text_tokens(text: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    let per_char = if looks_like_code(text) { 3.0 } else { 3.5 };
    (cjk as f32 / 2.0 + other as f32 / per_char).ceil() as usize
}

/// Code fences or a high density of code punctuation.
fn looks_like_code(text: &str) -> bool {
    if text.contains("```") {
        return true;
    }
    let len = text.len();
    if len < 40 {
        return false;
    }
    let punct = text
        .chars()
        .filter(|c| matches!(c, '{' | '}' | '(' | ')' | ';' | '=' | '<' | '>'))
        .count();
    punct * 20 > len
}

pub fn estimate_message_tokens(msg: &Message) -> usize {
    let mut tokens = MESSAGE_OVERHEAD;
    for block in &msg.content {
        tokens += match block {
            ContentBlock::Text { text } | ContentBlock::Thinking { text } => {
                estimate_text_tokens(text)
            }
            ContentBlock::ToolUse { name, input, .. } => {
                estimate_text_tokens(name) + estimate_text_tokens(&input.to_string())
            }
            ContentBlock::ToolResult { content, .. } => content
                .iter()
                .map(|b| match b {
                    ResultBlock::Text { text } => estimate_text_tokens(text),
                    ResultBlock::ToolRef { .. } => 4,
                    ResultBlock::Image { .. } => 765,
                })
                .sum(),
            ContentBlock::Image { .. } => 765,
        };
    }
    tokens
}

pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

// ─── Compaction ───────────────────────────────────────────────────────────────

pub struct ContextManager {
    params: ContextConfig,
}

/// Outcome of one compaction pass, for event reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionStats {
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// True when the model-based summary failed and old history was
    /// dropped deterministically instead.
    pub emergency: bool,
}

impl ContextManager {
    pub fn new(params: ContextConfig) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ContextConfig {
        &self.params
    }

    /// True when the estimated usage crosses the compaction trigger.
    pub fn needs_compaction(&self, messages: &[Message]) -> bool {
        let budget =
            (self.params.max_window.saturating_sub(self.params.reserve)) as f32 * self.params.trigger_ratio;
        estimate_tokens(messages) as f32 >= budget
    }

    /// Index where the preserved tail begins, adjusted backward so no
    /// ToolUse/ToolResult pair is torn: a tail that would open with tool
    /// results pulls the paired assistant message in as well.
    pub fn split_point(&self, messages: &[Message]) -> usize {
        let mut split = messages.len().saturating_sub(self.params.keep_recent);
        while split > 0 && messages[split].has_tool_result() {
            split -= 1;
        }
        split
    }

    /// Compact if needed.  Returns `None` when under the trigger.
    ///
    /// The prefix (everything older than `keep_recent`) is summarized by
    /// the provider and replaced with one marker-wrapped user message; the
    /// tail survives verbatim.  An earlier summary message sits in the
    /// prefix and is folded into the new summary, keeping repeated
    /// compactions idempotent.  When the summarization call fails or
    /// returns nothing, the deterministic fallback drops the prefix with a
    /// notice instead — compaction never leaves the session corrupted.
    pub async fn compact(
        &self,
        session: &mut Session,
        provider: &Arc<dyn ProviderClient>,
    ) -> anyhow::Result<Option<CompactionStats>> {
        if !self.needs_compaction(&session.messages) {
            return Ok(None);
        }
        self.compact_now(session, provider).await
    }

    /// Compact regardless of the trigger — used to recover after the
    /// provider rejects a request for exceeding the context window (the
    /// local estimate was too optimistic).
    pub async fn compact_now(
        &self,
        session: &mut Session,
        provider: &Arc<dyn ProviderClient>,
    ) -> anyhow::Result<Option<CompactionStats>> {
        let tokens_before = estimate_tokens(&session.messages);

        let split = self.split_point(&session.messages);
        if split == 0 {
            // Nothing old enough to summarize.
            return Ok(None);
        }
        let prefix: Vec<Message> = session.messages[..split].to_vec();
        let tail: Vec<Message> = session.messages[split..].to_vec();

        let request = CompletionRequest {
            model: session.model.clone(),
            system: Some(SUMMARIZE_PROMPT.to_string()),
            messages: vec![Message::user(render_history(&prefix))],
            max_output_tokens: 2048,
            ..Default::default()
        };

        let summary = match collect_text(provider, request).await {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) => {
                warn!("compaction summary was empty; dropping prefix deterministically");
                String::from("(earlier history dropped after a failed summarization)")
            }
            Err(e) => {
                warn!(error = %e, "compaction summary failed; dropping prefix deterministically");
                String::from("(earlier history dropped after a failed summarization)")
            }
        };
        let emergency = summary.starts_with("(earlier history dropped");

        let mut messages = Vec::with_capacity(tail.len() + 1);
        messages.push(Message::user(format!("{SUMMARY_MARKER}\n{summary}")));
        messages.extend(tail);
        session.replace_messages(messages);

        Ok(Some(CompactionStats {
            tokens_before,
            tokens_after: estimate_tokens(&session.messages),
            emergency,
        }))
    }

    /// Fold an oversized tool result, keeping ~70% head / ~30% tail by
    /// characters — or the first ~20 and last ~10 lines when the content
    /// looks structured (code fences, listings).
    pub fn fold_tool_output(&self, content: &str) -> (String, Option<FoldInfo>) {
        fold_tool_output(content, self.params.tool_output_max_chars)
    }
}

/// Fold metadata retained for potential later expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldInfo {
    pub original_chars: usize,
    pub kept_head: usize,
    pub kept_tail: usize,
}

pub fn fold_tool_output(content: &str, max_chars: usize) -> (String, Option<FoldInfo>) {
    if max_chars == 0 || content.len() <= max_chars {
        return (content.to_string(), None);
    }

    if looks_structured(content) {
        let lines: Vec<&str> = content.lines().collect();
        let head_text = lines.iter().take(20).copied().collect::<Vec<_>>().join("\n");
        let tail_text = lines
            .iter()
            .skip(lines.len().saturating_sub(10).max(20))
            .copied()
            .collect::<Vec<_>>()
            .join("\n");
        // Line folding only applies when it actually shrinks the result; a
        // few enormous lines fall through to the character fold below.
        if head_text.len() + tail_text.len() < content.len() {
            let omitted = content.len() - head_text.len() - tail_text.len();
            let info = FoldInfo {
                original_chars: content.len(),
                kept_head: head_text.len(),
                kept_tail: tail_text.len(),
            };
            let folded = format!("{head_text}\n{}\n{tail_text}", truncation_marker(omitted));
            return (folded, Some(info));
        }
    }

    let head_budget = max_chars * 7 / 10;
    let tail_budget = max_chars - head_budget;
    let head_cut = floor_char_boundary(content, head_budget);
    let tail_cut = ceil_char_boundary(content, content.len() - tail_budget);
    let omitted = tail_cut - head_cut;
    let info = FoldInfo {
        original_chars: content.len(),
        kept_head: head_cut,
        kept_tail: content.len() - tail_cut,
    };
    let folded = format!(
        "{}\n{}\n{}",
        &content[..head_cut],
        truncation_marker(omitted),
        &content[tail_cut..]
    );
    (folded, Some(info))
}

/// Code fences or many listing-shaped lines.
fn looks_structured(content: &str) -> bool {
    if content.contains("```") {
        return true;
    }
    let lines = content.lines().count();
    lines >= 30
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Serialize a message list into plain text for the summarization prompt.
pub fn render_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let body = m
                .content
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::Thinking { .. } => "[thinking]".to_string(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        format!("[tool_use: {name}({input})]")
                    }
                    ContentBlock::ToolResult {
                        content, is_error, ..
                    } => {
                        let text = content
                            .iter()
                            .map(|r| match r {
                                ResultBlock::Text { text } => text.as_str(),
                                ResultBlock::ToolRef { .. } => "[tool references]",
                                ResultBlock::Image { .. } => "[image]",
                            })
                            .collect::<Vec<_>>()
                            .join(" ");
                        if *is_error {
                            format!("[tool_result error: {text}]")
                        } else {
                            format!("[tool_result: {text}]")
                        }
                    }
                    ContentBlock::Image { .. } => "[image]".to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("{role}: {body}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Run one non-tool completion and return the concatenated text.
pub async fn collect_text(
    provider: &Arc<dyn ProviderClient>,
    request: CompletionRequest,
) -> anyhow::Result<String> {
    let mut stream = provider.stream(request).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta { text: t, .. } => text.push_str(&t),
            StreamEvent::MessageStop => break,
            StreamEvent::Error { message, .. } => {
                anyhow::bail!("stream error: {message}");
            }
            _ => {}
        }
    }
    Ok(text)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use sigrid_model::ScriptedMockProvider;

    fn manager() -> ContextManager {
        ContextManager::new(ContextConfig::default())
    }

    fn small_manager(max_window: usize) -> ContextManager {
        ContextManager::new(ContextConfig {
            max_window,
            reserve: 10,
            trigger_ratio: 0.7,
            keep_recent: 2,
            tool_output_max_chars: 100,
        })
    }

    // ── Estimation ────────────────────────────────────────────────────────────

    #[test]
    fn latin_text_uses_three_and_a_half_chars_per_token() {
        // 350 latin chars → 100 tokens.
        let text = "a".repeat(350);
        assert_eq!(estimate_text_tokens(&text), 100);
    }

    #[test]
    fn cjk_text_uses_two_chars_per_token() {
        let text = "你".repeat(100);
        assert_eq!(estimate_text_tokens(&text), 50);
    }

    #[test]
    fn code_text_uses_three_chars_per_token() {
        let code = "fn main() { let x = (1); };\n".repeat(10);
        let tokens = estimate_text_tokens(&code);
        let expected = (code.len() as f32 / 3.0).ceil() as usize;
        assert_eq!(tokens, expected);
    }

    #[test]
    fn message_estimate_includes_overhead() {
        let m = Message::user("");
        assert!(estimate_message_tokens(&m) >= MESSAGE_OVERHEAD);
    }

    // ── Trigger ───────────────────────────────────────────────────────────────

    #[test]
    fn small_history_does_not_trigger() {
        let mgr = manager();
        assert!(!mgr.needs_compaction(&[Message::user("hello")]));
    }

    #[test]
    fn trigger_fires_at_seventy_percent_of_effective_window() {
        // Window 1000, reserve 10 → effective 990; trigger at 693 tokens.
        let mgr = small_manager(1000);
        let big = Message::user("a".repeat(3500)); // ≈1000 tokens
        assert!(mgr.needs_compaction(&[big]));
        let small = Message::user("a".repeat(350)); // ≈100 tokens
        assert!(!mgr.needs_compaction(&[small]));
    }

    // ── Pair-safe split ───────────────────────────────────────────────────────

    #[test]
    fn split_point_never_tears_a_tool_pair() {
        use serde_json::json;
        let mgr = small_manager(1000); // keep_recent = 2
        let messages = vec![
            Message::user("start"),
            Message {
                role: sigrid_model::Role::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "read_file".into(),
                    input: json!({"path": "/a"}),
                }],
            },
            Message::tool_results(vec![Message::tool_result_block("t1", "data", false)]),
            Message::assistant("done"),
        ];
        // Naive split at len-2 = 2 would open the tail with the tool_result;
        // the pair-safe split pulls the assistant tool_use in as well.
        let split = mgr.split_point(&messages);
        assert_eq!(split, 1);
        assert!(!messages[split].has_tool_result());
    }

    #[test]
    fn split_point_zero_for_short_history() {
        let mgr = small_manager(1000);
        assert_eq!(mgr.split_point(&[Message::user("hi")]), 0);
    }

    // ── Compaction ────────────────────────────────────────────────────────────

    fn big_session() -> Session {
        let mut s = Session::new("scripted-mock-model");
        for i in 0..20 {
            s.push(Message::user(format!("question {i}: {}", "x".repeat(200))));
            s.push(Message::assistant(format!("answer {i}: {}", "y".repeat(200))));
        }
        s
    }

    #[tokio::test]
    async fn compact_replaces_prefix_with_marker_message() {
        let mgr = small_manager(1000);
        let provider: Arc<dyn ProviderClient> =
            Arc::new(ScriptedMockProvider::always_text("summary of the session"));
        let mut session = big_session();
        let stats = mgr.compact(&mut session, &provider).await.unwrap().unwrap();
        assert!(stats.tokens_after < stats.tokens_before);
        assert!(!stats.emergency);
        let first = &session.messages[0];
        assert!(first.text().starts_with(SUMMARY_MARKER));
        assert!(first.text().contains("summary of the session"));
        // Tail survives verbatim.
        assert_eq!(session.messages.len(), 1 + 2);
    }

    #[tokio::test]
    async fn compact_is_idempotent_on_token_budget() {
        let mgr = small_manager(1000);
        let provider: Arc<dyn ProviderClient> =
            Arc::new(ScriptedMockProvider::new(vec![
                sigrid_model::text_script("first summary".into()),
                sigrid_model::text_script("second summary".into()),
            ]));
        let mut session = big_session();
        mgr.compact(&mut session, &provider).await.unwrap().unwrap();
        let after_first = estimate_tokens(&session.messages);
        // Second pass: already under budget, must be a no-op.
        let second = mgr.compact(&mut session, &provider).await.unwrap();
        assert!(second.is_none());
        assert_eq!(estimate_tokens(&session.messages), after_first);
    }

    #[tokio::test]
    async fn failed_summary_falls_back_to_deterministic_drop() {
        struct FailingProvider;
        #[async_trait::async_trait]
        impl ProviderClient for FailingProvider {
            fn name(&self) -> &str {
                "failing"
            }
            fn model_name(&self) -> &str {
                "failing"
            }
            async fn stream(
                &self,
                _req: CompletionRequest,
            ) -> anyhow::Result<sigrid_model::EventStream> {
                anyhow::bail!("network down")
            }
        }
        let mgr = small_manager(1000);
        let provider: Arc<dyn ProviderClient> = Arc::new(FailingProvider);
        let mut session = big_session();
        let stats = mgr.compact(&mut session, &provider).await.unwrap().unwrap();
        assert!(stats.emergency);
        assert!(session.messages[0].text().starts_with(SUMMARY_MARKER));
    }

    // ── Folding ───────────────────────────────────────────────────────────────

    #[test]
    fn short_output_is_not_folded() {
        let (folded, info) = fold_tool_output("short output", 100);
        assert_eq!(folded, "short output");
        assert!(info.is_none());
    }

    #[test]
    fn long_flat_output_folds_seventy_thirty() {
        let content = "a".repeat(1000);
        let (folded, info) = fold_tool_output(&content, 100);
        let info = info.unwrap();
        assert_eq!(info.original_chars, 1000);
        assert_eq!(info.kept_head, 70);
        assert_eq!(info.kept_tail, 30);
        assert!(folded.contains("chars truncated"));
        assert!(folded.len() < 1000);
    }

    #[test]
    fn structured_output_folds_by_line() {
        let content = (0..100)
            .map(|i| format!("file_{i}.rs"))
            .collect::<Vec<_>>()
            .join("\n");
        let (folded, info) = fold_tool_output(&content, 100);
        assert!(info.is_some());
        assert!(folded.contains("file_0.rs"), "head lines preserved");
        assert!(folded.contains("file_99.rs"), "tail lines preserved");
        assert!(!folded.contains("file_50.rs"), "middle dropped");
        assert!(folded.contains("chars truncated"));
    }

    #[test]
    fn fold_respects_utf8_boundaries() {
        let content = "é".repeat(200); // 2 bytes per char
        let (folded, _) = fold_tool_output(&content, 101);
        // Must not panic and must still carry the marker.
        assert!(folded.contains("chars truncated"));
    }

    // ── render_history ────────────────────────────────────────────────────────

    #[test]
    fn render_history_includes_tool_traffic() {
        use serde_json::json;
        let messages = vec![
            Message::user("run ls"),
            Message {
                role: sigrid_model::Role::Assistant,
                content: vec![ContentBlock::ToolUse {
                    id: "t".into(),
                    name: "shell".into(),
                    input: json!({"command": "ls"}),
                }],
            },
            Message::tool_results(vec![Message::tool_result_block("t", "a.txt", false)]),
        ];
        let text = render_history(&messages);
        assert!(text.contains("shell"));
        assert!(text.contains("a.txt"));
        assert!(text.starts_with("User: run ls"));
    }
}
