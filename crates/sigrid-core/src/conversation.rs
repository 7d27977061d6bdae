// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The conversation loop: prompt → stream → tool fan-out → results → next
//! turn, until a terminal stop condition or an operator interrupt.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Context;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sigrid_config::{AgentConfig, ContextConfig, ToolsConfig};
use sigrid_model::{
    classify, redact, BlockStart, CompletionRequest, ContentBlock, Message, ProviderClient, Role,
    StopReason, StreamEvent, ToolSchema, Usage,
};
use sigrid_store::{EventKind, SessionStore, StoredEvent};
use sigrid_tools::{
    BatchContext, PermissionGate, QueueEvent, ToolCall, ToolExecutionQueue, ToolInvocation,
    ToolRegistry,
};

use crate::context::ContextManager;
use crate::events::{LoopEvent, TurnOutcome};
use crate::prompts::SYSTEM_PROMPT;
use crate::scheduler::SubAgentScheduler;
use crate::session::Session;

/// Turn state machine of the loop.  Transitions are documented on
/// [`ConversationLoop::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    BuildingRequest,
    AwaitingStream,
    Streaming,
    DispatchingTools,
    AwaitingTools,
    Cancelling,
    Failed,
}

/// Follow-up prompts queued by the operator while the loop is active.
/// Drained in order when the loop reaches Idle.
#[derive(Clone, Default)]
pub struct PromptQueue(Arc<StdMutex<VecDeque<String>>>);

impl PromptQueue {
    pub fn push(&self, prompt: impl Into<String>) {
        self.0.lock().unwrap().push_back(prompt.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().unwrap().is_empty()
    }

    fn drain_joined(&self) -> Option<String> {
        let mut q = self.0.lock().unwrap();
        if q.is_empty() {
            return None;
        }
        let joined = q.drain(..).collect::<Vec<_>>().join("\n\n");
        Some(joined)
    }
}

pub struct ConversationLoop {
    session: Session,
    provider: Arc<dyn ProviderClient>,
    registry: Arc<ToolRegistry>,
    queue: ToolExecutionQueue,
    context: ContextManager,
    agent: AgentConfig,
    system_prompt: String,
    store: Option<Arc<SessionStore>>,
    scheduler: Option<Arc<SubAgentScheduler>>,
    state: LoopState,
    queued: PromptQueue,
    cwd: PathBuf,
}

struct TurnData {
    blocks: Vec<ContentBlock>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    cancelled: bool,
}

impl ConversationLoop {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        agent: AgentConfig,
        tools: ToolsConfig,
        context: ContextConfig,
        model: impl Into<String>,
    ) -> Self {
        let queue = ToolExecutionQueue::new(
            Arc::clone(&registry),
            gate,
            tools.max_concurrency,
            std::time::Duration::from_secs(tools.kill_grace_secs),
        );
        Self {
            session: Session::new(model),
            provider,
            registry,
            queue,
            context: ContextManager::new(context),
            agent,
            system_prompt: SYSTEM_PROMPT.to_string(),
            store: None,
            scheduler: None,
            state: LoopState::Idle,
            queued: PromptQueue::default(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_store(mut self, store: Arc<SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<SubAgentScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Used for resume: pre-load history before the next submit.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Handle for queueing follow-up prompts while the loop is active.
    pub fn prompt_queue(&self) -> PromptQueue {
        self.queued.clone()
    }

    /// Drive one operator prompt to completion.
    ///
    /// ```text
    /// Idle ─prompt→ BuildingRequest ─send→ AwaitingStream ─event→ Streaming
    /// Streaming ─stop=end_turn→ Idle
    /// Streaming ─stop=tool_use→ DispatchingTools → AwaitingTools → BuildingRequest
    /// any state + cancel → Cancelling → Idle
    /// any state + fatal error → Failed → Idle
    /// ```
    ///
    /// An empty prompt with nothing queued is a no-op.  After the prompt
    /// completes, queued follow-ups are drained in order into a fresh turn.
    pub async fn submit(
        &mut self,
        prompt: &str,
        tx: mpsc::Sender<LoopEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<TurnOutcome> {
        let mut next: Option<String> = if prompt.trim().is_empty() {
            self.queued.drain_joined()
        } else {
            Some(prompt.to_string())
        };
        let Some(first) = next.take() else {
            return Ok(TurnOutcome::EndTurn);
        };

        let mut pending = Some(first);
        let mut outcome = TurnOutcome::EndTurn;
        while let Some(user_text) = pending.take() {
            outcome = match self.run_prompt(&user_text, &tx, &cancel).await {
                Ok(o) => o,
                Err(e) => {
                    self.state = LoopState::Failed;
                    let tag = classify(&e).tag();
                    let _ = tx
                        .send(LoopEvent::Error {
                            tag,
                            message: redact(&format!("{e:#}")),
                        })
                        .await;
                    self.state = LoopState::Idle;
                    return Err(e);
                }
            };
            if cancel.is_cancelled() {
                break;
            }
            pending = self.queued.drain_joined();
        }
        self.state = LoopState::Idle;
        Ok(outcome)
    }

    async fn run_prompt(
        &mut self,
        user_text: &str,
        tx: &mpsc::Sender<LoopEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnOutcome> {
        self.state = LoopState::BuildingRequest;
        self.push_and_persist(Message::user(user_text)).await;

        let mut turns = 0u32;
        loop {
            if cancel.is_cancelled() {
                self.state = LoopState::Cancelling;
                let _ = tx
                    .send(LoopEvent::Aborted {
                        partial_text: String::new(),
                    })
                    .await;
                self.state = LoopState::Idle;
                return Ok(TurnOutcome::Cancelled);
            }

            turns += 1;
            if turns > self.agent.max_turns {
                debug!(max_turns = self.agent.max_turns, "turn budget exhausted");
                let _ = tx
                    .send(LoopEvent::TurnComplete(TurnOutcome::MaxTurnsExceeded))
                    .await;
                self.state = LoopState::Idle;
                return Ok(TurnOutcome::MaxTurnsExceeded);
            }

            self.state = LoopState::BuildingRequest;

            // Sub-agent status reports arrive between turns as attachments.
            if let Some(scheduler) = &self.scheduler {
                scheduler.tick_turn().await;
                for att in scheduler.drain_attachments().await {
                    let _ = tx.send(LoopEvent::TaskAttachment(att.clone())).await;
                    self.push_and_persist(Message::user(att.render())).await;
                }
            }

            if let Some(stats) = self.context.compact(&mut self.session, &self.provider).await? {
                let _ = tx
                    .send(LoopEvent::ContextCompacted {
                        tokens_before: stats.tokens_before,
                        tokens_after: stats.tokens_after,
                    })
                    .await;
                self.persist_meta(serde_json::json!({
                    "event": "compaction",
                    "tokens_before": stats.tokens_before,
                    "tokens_after": stats.tokens_after,
                    "emergency": stats.emergency,
                }))
                .await;
            }

            let request = CompletionRequest {
                model: self.session.model.clone(),
                messages: self.session.messages.clone(),
                system: Some(self.system_prompt.clone()),
                tools: self.tool_schemas(),
                max_output_tokens: 0,
                stop_sequences: Vec::new(),
                thinking: None,
            };

            self.state = LoopState::AwaitingStream;
            let provider = Arc::clone(&self.provider);
            let admitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.state = LoopState::Cancelling;
                    let _ = tx.send(LoopEvent::Aborted { partial_text: String::new() }).await;
                    self.state = LoopState::Idle;
                    return Ok(TurnOutcome::Cancelled);
                }
                s = provider.stream(request) => s,
            };
            let stream = match admitted {
                Ok(s) => s,
                Err(e) if sigrid_model::classify(&e) == sigrid_model::ErrorKind::ContextLimit => {
                    // The local token estimate was too optimistic; compact
                    // unconditionally and retry the request once.
                    warn!("provider rejected request for context size; compacting and retrying");
                    if let Some(stats) = self
                        .context
                        .compact_now(&mut self.session, &self.provider)
                        .await?
                    {
                        let _ = tx
                            .send(LoopEvent::ContextCompacted {
                                tokens_before: stats.tokens_before,
                                tokens_after: stats.tokens_after,
                            })
                            .await;
                    }
                    let retry = CompletionRequest {
                        model: self.session.model.clone(),
                        messages: self.session.messages.clone(),
                        system: Some(self.system_prompt.clone()),
                        tools: self.tool_schemas(),
                        max_output_tokens: 0,
                        stop_sequences: Vec::new(),
                        thinking: None,
                    };
                    provider
                        .stream(retry)
                        .await
                        .context("model completion failed (after context recovery)")?
                }
                Err(e) => return Err(e).context("model completion failed"),
            };

            self.state = LoopState::Streaming;
            let turn = self.consume_stream(stream, tx, cancel).await?;

            let text: String = turn
                .blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();

            if turn.cancelled {
                // Tool-use blocks from an interrupted stream would be
                // unanswerable; only streamed text survives the abort.
                let partial: Vec<ContentBlock> = turn
                    .blocks
                    .into_iter()
                    .filter(|b| matches!(b, ContentBlock::Text { .. }))
                    .collect();
                if !partial.is_empty() {
                    self.push_and_persist(Message {
                        role: Role::Assistant,
                        content: partial,
                    })
                    .await;
                }
                self.state = LoopState::Cancelling;
                let _ = tx
                    .send(LoopEvent::Aborted {
                        partial_text: text,
                    })
                    .await;
                self.state = LoopState::Idle;
                return Ok(TurnOutcome::Cancelled);
            }

            let assistant = Message {
                role: Role::Assistant,
                content: turn.blocks,
            };
            self.push_and_persist(assistant.clone()).await;
            if !text.is_empty() {
                let _ = tx.send(LoopEvent::TextComplete(text.clone())).await;
            }

            self.session.add_usage(&turn.usage);
            self.persist_usage(&turn.usage).await;
            let _ = tx
                .send(LoopEvent::TokenUsage {
                    turn: turn.usage,
                    cumulative: self.session.cumulative_usage,
                })
                .await;

            match turn.stop_reason {
                Some(StopReason::ToolUse) => {
                    let cancelled = self.dispatch_tools(&assistant, tx, cancel).await?;
                    if cancelled {
                        self.push_and_persist(Message::assistant("Interrupted.")).await;
                        self.state = LoopState::Cancelling;
                        let _ = tx.send(LoopEvent::Aborted { partial_text: text }).await;
                        self.state = LoopState::Idle;
                        return Ok(TurnOutcome::Cancelled);
                    }
                    // Results are in; next turn.
                }
                Some(reason) => {
                    let outcome = TurnOutcome::from_stop_reason(reason);
                    let _ = tx.send(LoopEvent::TurnComplete(outcome)).await;
                    self.state = LoopState::Idle;
                    return Ok(outcome);
                }
                None => {
                    // Stream ended without a stop reason; treat as end_turn.
                    let _ = tx.send(LoopEvent::TurnComplete(TurnOutcome::EndTurn)).await;
                    self.state = LoopState::Idle;
                    return Ok(TurnOutcome::EndTurn);
                }
            }
        }
    }

    /// Fan the assistant's tool-use blocks out through the queue and append
    /// the paired results as a single user message, in the emitted order.
    /// Returns true when the operator cancelled: every invocation still got
    /// a terminal result, so the pairing invariant holds either way.
    async fn dispatch_tools(
        &mut self,
        assistant: &Message,
        tx: &mpsc::Sender<LoopEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<bool> {
        let uses = assistant.tool_uses();
        if uses.is_empty() {
            return Ok(false);
        }

        self.state = LoopState::DispatchingTools;
        let batch: Vec<ToolCall> = uses
            .iter()
            .map(|(id, name, input)| ToolCall {
                id: id.to_string(),
                name: name.to_string(),
                input: (*input).clone(),
            })
            .collect();
        for call in &batch {
            let _ = tx
                .send(LoopEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                })
                .await;
        }

        let ctx = BatchContext {
            cancel: cancel.child_token(),
            cwd: self.cwd.clone(),
            scratch: std::env::temp_dir().join("sigrid").join(&self.session.id),
        };
        let mut rx = self.queue.enqueue(batch, ctx);
        self.state = LoopState::AwaitingTools;

        let mut results: Vec<ToolInvocation> = Vec::with_capacity(uses.len());
        while let Some(event) = rx.recv().await {
            match event {
                QueueEvent::Progress {
                    invocation_id,
                    message,
                } => {
                    let _ = tx
                        .send(LoopEvent::ToolProgress {
                            id: invocation_id,
                            message,
                        })
                        .await;
                }
                QueueEvent::Completed(inv) => {
                    if let Some(out) = inv.output() {
                        let _ = tx
                            .send(LoopEvent::ToolFinished {
                                id: inv.id.clone(),
                                name: inv.tool_name.clone(),
                                content: out.content.clone(),
                                is_error: out.is_error,
                            })
                            .await;
                    }
                    results.push(inv);
                }
            }
        }

        // One ToolResult per ToolUse, same order, folded to budget.
        let blocks: Vec<ContentBlock> = results
            .iter()
            .map(|inv| {
                let (content, is_error) = match inv.output() {
                    Some(out) => (out.content.clone(), out.is_error),
                    None => ("tool produced no result".to_string(), true),
                };
                let (folded, info) = self.context.fold_tool_output(&content);
                if let Some(info) = &info {
                    debug!(
                        tool = %inv.tool_name,
                        original = info.original_chars,
                        "folded oversized tool result"
                    );
                }
                Message::tool_result_block(&inv.id, folded, is_error)
            })
            .collect();
        self.push_and_persist(Message::tool_results(blocks)).await;

        Ok(cancel.is_cancelled())
    }

    async fn consume_stream(
        &mut self,
        mut stream: sigrid_model::EventStream,
        tx: &mpsc::Sender<LoopEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnData> {
        #[derive(Default)]
        struct Acc {
            kind: AccKind,
            id: String,
            name: String,
            text: String,
            json_buf: String,
        }
        #[derive(Default, PartialEq)]
        enum AccKind {
            #[default]
            Text,
            ToolUse,
            Thinking,
        }

        let mut accs: BTreeMap<usize, Acc> = BTreeMap::new();
        let mut stop_reason = None;
        let mut usage = Usage::default();
        let mut cancelled = false;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Dropping the stream aborts the transport; no further
                    // events are delivered.
                    cancelled = true;
                    break;
                }
                ev = stream.next() => ev,
            };
            let Some(event) = event else { break };
            match event? {
                StreamEvent::MessageStart { usage: u } => {
                    usage.input_tokens = u.input_tokens;
                    usage.cache_creation_tokens = u.cache_creation_tokens;
                    usage.cache_read_tokens = u.cache_read_tokens;
                }
                StreamEvent::ContentBlockStart { index, block } => {
                    let acc = accs.entry(index).or_default();
                    match block {
                        BlockStart::Text => acc.kind = AccKind::Text,
                        BlockStart::Thinking => acc.kind = AccKind::Thinking,
                        BlockStart::ToolUse { id, name } => {
                            acc.kind = AccKind::ToolUse;
                            acc.id = id;
                            acc.name = name;
                        }
                    }
                }
                StreamEvent::TextDelta { index, text } => {
                    if !text.is_empty() {
                        accs.entry(index).or_default().text.push_str(&text);
                        let _ = tx.send(LoopEvent::TextDelta(text)).await;
                    }
                }
                StreamEvent::ThinkingDelta { index, text } => {
                    let acc = accs.entry(index).or_default();
                    acc.kind = AccKind::Thinking;
                    acc.text.push_str(&text);
                    let _ = tx.send(LoopEvent::ThinkingDelta(text)).await;
                }
                StreamEvent::InputJsonDelta {
                    index,
                    partial_json,
                } => {
                    accs.entry(index).or_default().json_buf.push_str(&partial_json);
                }
                StreamEvent::ContentBlockStop { .. } => {}
                StreamEvent::MessageDelta {
                    stop_reason: sr,
                    usage: u,
                } => {
                    if sr.is_some() {
                        stop_reason = sr;
                    }
                    usage.output_tokens = u.output_tokens;
                }
                StreamEvent::MessageStop => break,
                StreamEvent::Error {
                    kind,
                    retryable,
                    message,
                } => {
                    if retryable {
                        warn!(message, "retryable mid-stream error");
                        continue;
                    }
                    return Err(sigrid_model::EngineError::new(kind, message).into());
                }
            }
        }

        let mut blocks = Vec::new();
        for (_, acc) in accs {
            match acc.kind {
                AccKind::Text => {
                    if !acc.text.is_empty() {
                        blocks.push(ContentBlock::Text { text: acc.text });
                    }
                }
                AccKind::Thinking => {
                    if !acc.text.is_empty() {
                        blocks.push(ContentBlock::Thinking { text: acc.text });
                    }
                }
                AccKind::ToolUse => {
                    if acc.name.is_empty() {
                        warn!("dropping tool-use block with empty name");
                        continue;
                    }
                    let input: Value = if acc.json_buf.trim().is_empty() {
                        Value::Object(Default::default())
                    } else {
                        serde_json::from_str(&acc.json_buf).unwrap_or_else(|e| {
                            warn!(tool = %acc.name, error = %e,
                                  "invalid tool input JSON from model; substituting {{}}");
                            Value::Object(Default::default())
                        })
                    };
                    blocks.push(ContentBlock::ToolUse {
                        id: acc.id,
                        name: acc.name,
                        input,
                    });
                }
            }
        }

        Ok(TurnData {
            blocks,
            stop_reason,
            usage,
            cancelled,
        })
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.registry
            .schemas()
            .into_iter()
            .map(|s| ToolSchema {
                name: s.name,
                description: s.description,
                input_schema: s.input_schema,
            })
            .collect()
    }

    async fn push_and_persist(&mut self, message: Message) {
        if let Some(store) = &self.store {
            match serde_json::to_value(&message) {
                Ok(payload) => {
                    if let Err(e) = store
                        .append(&self.session.id, StoredEvent::new(EventKind::Message, payload))
                        .await
                    {
                        warn!(error = %e, "session persist failed");
                    }
                }
                Err(e) => warn!(error = %e, "message serialization failed"),
            }
        }
        self.session.push(message);
    }

    async fn persist_usage(&self, usage: &Usage) {
        if let Some(store) = &self.store {
            if let Ok(payload) = serde_json::to_value(usage) {
                if let Err(e) = store
                    .append(&self.session.id, StoredEvent::new(EventKind::Usage, payload))
                    .await
                {
                    warn!(error = %e, "usage persist failed");
                }
            }
        }
    }

    async fn persist_meta(&self, payload: Value) {
        if let Some(store) = &self.store {
            if let Err(e) = store
                .append(&self.session.id, StoredEvent::new(EventKind::Meta, payload))
                .await
            {
                warn!(error = %e, "meta persist failed");
            }
        }
    }
}
