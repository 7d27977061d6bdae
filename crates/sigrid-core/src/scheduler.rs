// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Sub-agent scheduler: bounded sub-conversations on behalf of the main
//! loop, reporting status without blocking it.
//!
//! Each task runs its own [`ConversationLoop`] with a private session and a
//! tool registry restricted to its agent type.  Background tasks persist as
//! JSON snapshots and survive restarts (a task found `Running` after a
//! crash is marked failed).  Dependencies form a DAG checked at spawn time;
//! concurrency is bounded by a semaphore.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sigrid_agents::{
    check_acyclic, ready_tasks, AgentType, Attachment, BackgroundTask, SpawnMode, TaskSpec,
    TaskStatus, Thoroughness,
};
use sigrid_config::{AgentConfig, ContextConfig, PermissionMode, ToolsConfig};
use sigrid_model::{CompletionRequest, EngineError, ErrorKind, Message, ProviderClient};
use sigrid_agents::ToolAccess;
use sigrid_store::TaskSnapshotStore;
use sigrid_tools::{PermissionGate, ToolRegistry};

use crate::context::collect_text;
use crate::conversation::ConversationLoop;
use crate::events::LoopEvent;
use crate::prompts::delta_summary_prompt;

pub struct SchedulerOptions {
    pub max_concurrency: usize,
    /// Emit `task_progress` at most once per this many main-loop turns.
    pub progress_interval: u32,
    /// Generate 1–2 sentence delta summaries through the provider.  When
    /// off, raw output snippets are used instead (tests, offline runs).
    pub delta_summaries: bool,
    /// Session model inherited by types that do not override one.
    pub model: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            progress_interval: 3,
            delta_summaries: false,
            model: "claude-sonnet-4-5".into(),
        }
    }
}

/// What `spawn` hands back.  Foreground handles carry the final text.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: String,
    pub status: TaskStatus,
    pub final_text: Option<String>,
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<String, BackgroundTask>,
    cancels: HashMap<String, CancellationToken>,
    launched: HashSet<String>,
    attachments: VecDeque<Attachment>,
    results: HashMap<String, String>,
    /// Output accumulated since the last progress/status report, per task.
    pending_output: HashMap<String, String>,
    turn_counter: u32,
}

pub struct SubAgentScheduler {
    types: Vec<AgentType>,
    provider: Arc<dyn ProviderClient>,
    base_registry: Arc<ToolRegistry>,
    agent_cfg: AgentConfig,
    tools_cfg: ToolsConfig,
    context_cfg: ContextConfig,
    snapshots: Option<Arc<TaskSnapshotStore>>,
    options: SchedulerOptions,
    semaphore: Arc<Semaphore>,
    inner: Mutex<Inner>,
}

impl SubAgentScheduler {
    pub fn new(
        types: Vec<AgentType>,
        provider: Arc<dyn ProviderClient>,
        base_registry: Arc<ToolRegistry>,
        agent_cfg: AgentConfig,
        tools_cfg: ToolsConfig,
        context_cfg: ContextConfig,
        options: SchedulerOptions,
    ) -> Self {
        let permits = options.max_concurrency.max(1);
        Self {
            types,
            provider,
            base_registry,
            agent_cfg,
            tools_cfg,
            context_cfg,
            snapshots: None,
            options,
            semaphore: Arc::new(Semaphore::new(permits)),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn with_snapshots(mut self, store: Arc<TaskSnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    fn agent_type(&self, name: &str) -> Option<&AgentType> {
        self.types.iter().find(|t| t.name == name)
    }

    /// Launch a sub-conversation.  Foreground blocks until terminal;
    /// background returns immediately and reports through attachments.
    pub async fn spawn(
        self: &Arc<Self>,
        spec: TaskSpec,
        mode: SpawnMode,
    ) -> anyhow::Result<TaskHandle> {
        if self.agent_type(&spec.agent_type).is_none() {
            return Err(EngineError::new(
                ErrorKind::Validation,
                format!("unknown agent type '{}'", spec.agent_type),
            )
            .into());
        }

        let id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut task = BackgroundTask::new(&id, &spec);

        // Dependency cycles fail the task immediately.
        {
            let inner = self.inner.lock().await;
            let edges: HashMap<String, Vec<String>> = inner
                .tasks
                .values()
                .map(|t| (t.id.clone(), t.depends_on.clone()))
                .collect();
            if let Err(cycle) = check_acyclic(&edges, &id, &spec.depends_on) {
                task.fail(format!("dependency cycle: {}", cycle.join(" -> ")));
                task.notified = true;
            }
        }

        let terminal_on_spawn = task.status.is_terminal();
        let status = task.status;
        {
            let mut inner = self.inner.lock().await;
            if terminal_on_spawn {
                inner.attachments.push_back(Attachment::TaskStatus {
                    task_id: id.clone(),
                    status,
                    delta_summary: task.failure.clone(),
                });
            } else {
                inner.cancels.insert(id.clone(), CancellationToken::new());
            }
            inner.tasks.insert(id.clone(), task.clone());
        }
        self.snapshot(&task).await;
        if terminal_on_spawn {
            return Ok(TaskHandle {
                id,
                status,
                final_text: None,
            });
        }

        match mode {
            SpawnMode::Foreground => {
                Arc::clone(self).run_task(id.clone()).await;
                let inner = self.inner.lock().await;
                let status = inner.tasks.get(&id).map(|t| t.status).unwrap_or(status);
                Ok(TaskHandle {
                    final_text: inner.results.get(&id).cloned(),
                    id,
                    status,
                })
            }
            SpawnMode::Background => {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.pump().await });
                Ok(TaskHandle {
                    id,
                    status: TaskStatus::Pending,
                    final_text: None,
                })
            }
        }
    }

    /// Start every ready task; fail tasks whose dependencies are dead.
    ///
    /// Returns an explicitly boxed future (rather than `async fn`) because
    /// `pump` and `run_task` spawn each other, and two mutually-recursive
    /// `async fn`s cannot infer each other's opaque `Send` hidden type.
    fn pump(self: Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let to_launch;
            {
                let mut inner = self.inner.lock().await;
                let tasks: Vec<BackgroundTask> = inner.tasks.values().cloned().collect();
                let (ready, doomed) = ready_tasks(&tasks);

                for id in doomed {
                    let snapshot = match inner.tasks.get_mut(&id) {
                        Some(task) => {
                            task.fail("dependency failed or cancelled");
                            task.notified = true;
                            Some(task.clone())
                        }
                        None => None,
                    };
                    if let Some(snapshot) = snapshot {
                        inner.attachments.push_back(Attachment::TaskStatus {
                            task_id: id.clone(),
                            status: TaskStatus::Failed,
                            delta_summary: snapshot.failure.clone(),
                        });
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.snapshot(&snapshot).await });
                    }
                }

                to_launch = ready
                    .into_iter()
                    .filter(|id| inner.launched.insert(id.clone()))
                    .collect::<Vec<_>>();
            }

            for id in to_launch {
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.run_task(id).await });
            }
        })
    }

    async fn run_task(self: Arc<Self>, id: String) {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("scheduler semaphore never closes");

        let (spec, cancel) = {
            let mut inner = self.inner.lock().await;
            inner.launched.insert(id.clone());
            let Some(task) = inner.tasks.get_mut(&id) else { return };
            if task.status != TaskStatus::Pending {
                return;
            }
            task.transition(TaskStatus::Running);
            let spec = TaskSpec {
                agent_type: task.agent_type.clone(),
                prompt: task.prompt.clone(),
                priority: task.priority,
                depends_on: task.depends_on.clone(),
                thoroughness: task.thoroughness.clone(),
            };
            let snapshot = task.clone();
            let cancel = inner
                .cancels
                .get(&id)
                .cloned()
                .unwrap_or_default();
            drop(inner);
            self.snapshot(&snapshot).await;
            (spec, cancel)
        };

        debug!(task = %id, agent_type = %spec.agent_type, "sub-agent starting");
        let outcome = self.run_conversation(&id, &spec, cancel.clone()).await;

        let terminal = {
            let mut inner = self.inner.lock().await;
            let Some(task) = inner.tasks.get_mut(&id) else { return };
            match &outcome {
                Ok(text) => {
                    task.intermediate_results.push(json!(text));
                    task.transition(if cancel.is_cancelled() {
                        TaskStatus::Cancelled
                    } else {
                        TaskStatus::Completed
                    });
                }
                Err(e) => task.fail(format!("{e:#}")),
            }
            task.clone()
        };
        self.snapshot(&terminal).await;
        self.report_terminal(&id).await;

        // A completion may unblock dependants.
        let this = Arc::clone(&self);
        tokio::spawn(async move { this.pump().await });
    }

    /// Run the restricted sub-conversation and return its final text.
    async fn run_conversation(
        &self,
        id: &str,
        spec: &TaskSpec,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let ty = self
            .agent_type(&spec.agent_type)
            .context("agent type disappeared")?
            .clone();

        let registry: Arc<ToolRegistry> = match &ty.tools {
            ToolAccess::All => Arc::clone(&self.base_registry),
            ToolAccess::ReadOnly => Arc::new(self.base_registry.read_only_subset()),
            ToolAccess::Named(names) => Arc::new(self.base_registry.subset(names)),
        };
        let gate = Arc::new(PermissionGate::for_mode(if ty.read_only {
            PermissionMode::Plan
        } else {
            PermissionMode::Bypass
        }));

        let mut agent_cfg = self.agent_cfg.clone();
        let mut system_prompt = ty.system_prompt.clone();
        if let Some(level) = spec.thoroughness.as_deref().and_then(Thoroughness::parse) {
            agent_cfg.max_turns = level.turn_cap();
            system_prompt.push_str(&format!(
                "\n\nCap result listings at {} entries.",
                level.result_cap()
            ));
        }

        let model = ty.model.clone().unwrap_or_else(|| self.options.model.clone());
        let mut conversation = ConversationLoop::new(
            Arc::clone(&self.provider),
            registry,
            gate,
            agent_cfg,
            self.tools_cfg.clone(),
            self.context_cfg.clone(),
            model,
        )
        .with_system_prompt(system_prompt);

        let (tx, mut rx) = mpsc::channel::<LoopEvent>(256);
        let submit = conversation.submit(&spec.prompt, tx, cancel);

        let mut final_text = String::new();
        let mut collected = String::new();
        tokio::pin!(submit);
        let submit_result = loop {
            tokio::select! {
                result = &mut submit => break result,
                event = rx.recv() => {
                    match event {
                        Some(LoopEvent::TextComplete(text)) => {
                            final_text = text.clone();
                            collected.push_str(&text);
                            collected.push('\n');
                        }
                        Some(LoopEvent::ToolFinished { name, is_error, .. }) => {
                            collected.push_str(&format!(
                                "[tool {name}{}]\n",
                                if is_error { " failed" } else { "" }
                            ));
                        }
                        Some(_) => {}
                        None => {}
                    }
                }
            }
        };
        // Drain anything buffered after submit resolved.
        while let Ok(event) = rx.try_recv() {
            if let LoopEvent::TextComplete(text) = event {
                final_text = text.clone();
                collected.push_str(&text);
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner
                .pending_output
                .entry(id.to_string())
                .or_default()
                .push_str(&collected);
            if !final_text.is_empty() {
                inner.results.insert(id.to_string(), final_text.clone());
            }
        }

        submit_result?;
        Ok(final_text)
    }

    /// Deliver the one-shot terminal `task_status` attachment.
    async fn report_terminal(&self, id: &str) {
        let (status, new_output, prior) = {
            let mut inner = self.inner.lock().await;
            let (notified, status, prior) = match inner.tasks.get(id) {
                Some(t) => (t.notified, t.status, t.last_reported_output.clone()),
                None => return,
            };
            if notified || !status.is_terminal() {
                return;
            }
            if let Some(task) = inner.tasks.get_mut(id) {
                task.notified = true;
            }
            let new_output = inner.pending_output.remove(id).unwrap_or_default();
            (status, new_output, prior)
        };

        let delta_summary = self.summarize_delta(prior.as_deref(), &new_output).await;

        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.tasks.get_mut(id) {
            task.output_offset += new_output.len();
            if let Some(s) = &delta_summary {
                task.last_reported_output = Some(s.clone());
            }
        }
        inner.attachments.push_back(Attachment::TaskStatus {
            task_id: id.to_string(),
            status,
            delta_summary,
        });
    }

    /// 1–2 sentence summary of output appended since the previous report.
    /// Empty (or absent) summaries suppress the progress attachment.
    async fn summarize_delta(&self, prior: Option<&str>, new_output: &str) -> Option<String> {
        let trimmed = new_output.trim();
        if trimmed.is_empty() {
            return None;
        }
        if !self.options.delta_summaries {
            let snippet: String = trimmed.chars().take(160).collect();
            return Some(snippet);
        }
        let request = CompletionRequest {
            model: self.options.model.clone(),
            messages: vec![Message::user(delta_summary_prompt(prior, trimmed))],
            max_output_tokens: 256,
            ..Default::default()
        };
        match collect_text(&self.provider, request).await {
            Ok(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "delta summary failed");
                None
            }
        }
    }

    /// Called by the main loop once per turn; every `progress_interval`
    /// turns, running tasks with fresh output report progress (at most one
    /// attachment per task per interval).
    pub async fn tick_turn(&self) {
        let due = {
            let mut inner = self.inner.lock().await;
            inner.turn_counter += 1;
            if inner.turn_counter % self.options.progress_interval.max(1) != 0 {
                return;
            }
            let running: Vec<String> = inner
                .tasks
                .values()
                .filter(|t| t.status == TaskStatus::Running)
                .map(|t| t.id.clone())
                .collect();
            let mut due = Vec::new();
            for id in running {
                if let Some(output) = inner.pending_output.remove(&id) {
                    if !output.trim().is_empty() {
                        let prior = inner
                            .tasks
                            .get(&id)
                            .and_then(|t| t.last_reported_output.clone());
                        due.push((id, output, prior));
                    }
                }
            }
            due
        };

        for (id, output, prior) in due {
            let Some(message) = self.summarize_delta(prior.as_deref(), &output).await else {
                continue;
            };
            let mut inner = self.inner.lock().await;
            if let Some(task) = inner.tasks.get_mut(&id) {
                task.output_offset += output.len();
                task.last_reported_output = Some(message.clone());
            }
            inner.attachments.push_back(Attachment::TaskProgress {
                task_id: id,
                message,
            });
        }
    }

    pub async fn drain_attachments(&self) -> Vec<Attachment> {
        let mut inner = self.inner.lock().await;
        inner.attachments.drain(..).collect()
    }

    pub async fn status(&self, id: &str) -> Option<TaskStatus> {
        self.inner.lock().await.tasks.get(id).map(|t| t.status)
    }

    pub async fn final_text(&self, id: &str) -> Option<String> {
        self.inner.lock().await.results.get(id).cloned()
    }

    /// Cancel one task: its provider stream and pending tool invocations
    /// observe the token; a pending task just flips to cancelled.
    pub async fn cancel(&self, id: &str) {
        let snapshot = {
            let mut inner = self.inner.lock().await;
            if let Some(token) = inner.cancels.get(id) {
                token.cancel();
            }
            match inner.tasks.get_mut(id) {
                Some(task) if task.status == TaskStatus::Pending => {
                    task.transition(TaskStatus::Cancelled);
                    task.notified = true;
                    let s = task.clone();
                    inner.attachments.push_back(Attachment::TaskStatus {
                        task_id: id.to_string(),
                        status: TaskStatus::Cancelled,
                        delta_summary: None,
                    });
                    Some(s)
                }
                _ => None,
            }
        };
        if let Some(task) = snapshot {
            self.snapshot(&task).await;
        }
    }

    /// Reload persisted tasks after a restart; tasks that were `Running`
    /// when the process died are marked failed.
    pub async fn recover(&self) -> anyhow::Result<usize> {
        let Some(store) = &self.snapshots else { return Ok(0) };
        let loaded: Vec<(String, BackgroundTask)> = store.load_all().await?;
        let mut crashed = 0usize;
        let mut to_snapshot = Vec::new();
        {
            let mut inner = self.inner.lock().await;
            for (id, mut task) in loaded {
                if task.status == TaskStatus::Running {
                    task.fail("crashed");
                    task.notified = true;
                    crashed += 1;
                    to_snapshot.push(task.clone());
                }
                inner.tasks.insert(id, task);
            }
        }
        for task in to_snapshot {
            self.snapshot(&task).await;
        }
        Ok(crashed)
    }

    async fn snapshot(&self, task: &BackgroundTask) {
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.save(&task.id, task).await {
                warn!(task = %task.id, error = %e, "task snapshot failed");
            }
        }
    }
}
