// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Utc};
use uuid::Uuid;

use sigrid_model::{estimate_cost_usd, Message, Usage};

/// In-memory conversation session.
///
/// Mutated only by the conversation loop that owns it (each sub-agent task
/// holds its own private session).  Token counts in `cumulative_usage` are
/// the provider's authoritative numbers, summed per turn.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub model: String,
    pub cumulative_usage: Usage,
}

impl Session {
    pub fn new(model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            model: model.into(),
            cumulative_usage: Usage::default(),
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.updated_at = Utc::now();
    }

    /// Fold one turn's provider-reported usage into the running total,
    /// pricing it for the session model.
    pub fn add_usage(&mut self, turn: &Usage) {
        let mut priced = *turn;
        priced.estimated_cost_usd = estimate_cost_usd(&self.model, turn);
        self.cumulative_usage.add(&priced);
        self.updated_at = Utc::now();
    }

    /// Replace the message list (after compaction).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.updated_at = Utc::now();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_unique_id() {
        let a = Session::new("claude-sonnet-4-5");
        let b = Session::new("claude-sonnet-4-5");
        assert_ne!(a.id, b.id);
        assert!(a.messages.is_empty());
    }

    #[test]
    fn push_updates_timestamp() {
        let mut s = Session::new("m");
        let before = s.updated_at;
        s.push(Message::user("hi"));
        assert!(s.updated_at >= before);
        assert_eq!(s.messages.len(), 1);
    }

    #[test]
    fn add_usage_accumulates_and_prices() {
        let mut s = Session::new("claude-sonnet-4-5");
        s.add_usage(&Usage {
            input_tokens: 1000,
            output_tokens: 500,
            ..Default::default()
        });
        s.add_usage(&Usage {
            input_tokens: 200,
            output_tokens: 100,
            ..Default::default()
        });
        assert_eq!(s.cumulative_usage.input_tokens, 1200);
        assert_eq!(s.cumulative_usage.output_tokens, 600);
        assert!(s.cumulative_usage.estimated_cost_usd > 0.0);
    }

    #[test]
    fn unknown_model_accumulates_tokens_with_zero_cost() {
        let mut s = Session::new("local-llama");
        s.add_usage(&Usage {
            input_tokens: 1000,
            ..Default::default()
        });
        assert_eq!(s.cumulative_usage.estimated_cost_usd, 0.0);
        assert_eq!(s.cumulative_usage.input_tokens, 1000);
    }
}
