// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool-execution queue.
//!
//! One batch per assistant turn.  The queue runs concurrency-safe prefixes
//! in parallel up to the global cap, serializes around unsafe (mutating)
//! invocations, and yields terminal results in submission order regardless
//! of completion order.  Progress strings from in-flight invocations flow
//! through the same event channel without disturbing result ordering.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    gate::{Decision, PermissionGate},
    invocation::{InvocationState, ToolInvocation},
    registry::ToolRegistry,
    tool::{ExecContext, ToolCall, ToolOutput},
};

/// Event stream produced by [`ToolExecutionQueue::enqueue`].
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A progress string from an in-flight invocation.
    Progress {
        invocation_id: String,
        message: String,
    },
    /// A terminal invocation.  Emitted strictly in submission order: an
    /// invocation is exposed only after every invocation preceding it in
    /// the batch has terminated.
    Completed(ToolInvocation),
}

/// Context shared by all invocations of one batch.
#[derive(Clone)]
pub struct BatchContext {
    pub cancel: CancellationToken,
    pub cwd: PathBuf,
    pub scratch: PathBuf,
}

impl Default for BatchContext {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            scratch: std::env::temp_dir(),
        }
    }
}

pub struct ToolExecutionQueue {
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    max_concurrency: usize,
    kill_grace: Duration,
}

enum WorkerMsg {
    Progress(usize, String),
    Done(usize, ToolOutput),
}

struct Slot {
    inv: ToolInvocation,
    safe: bool,
    handle: Option<JoinHandle<()>>,
}

impl ToolExecutionQueue {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<PermissionGate>,
        max_concurrency: usize,
        kill_grace: Duration,
    ) -> Self {
        Self {
            registry,
            gate,
            max_concurrency: max_concurrency.max(1),
            kill_grace,
        }
    }

    /// Submit one batch.  The returned receiver yields [`QueueEvent`]s and
    /// closes once every invocation has been emitted.
    pub fn enqueue(&self, batch: Vec<ToolCall>, ctx: BatchContext) -> mpsc::Receiver<QueueEvent> {
        let (tx, rx) = mpsc::channel(64.max(batch.len() * 4));
        let registry = Arc::clone(&self.registry);
        let gate = Arc::clone(&self.gate);
        let cap = self.max_concurrency;
        let grace = self.kill_grace;
        tokio::spawn(async move {
            run_batch(batch, ctx, registry, gate, cap, grace, tx).await;
        });
        rx
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_batch(
    batch: Vec<ToolCall>,
    ctx: BatchContext,
    registry: Arc<ToolRegistry>,
    gate: Arc<PermissionGate>,
    cap: usize,
    grace: Duration,
    tx: mpsc::Sender<QueueEvent>,
) {
    let n = batch.len();
    let mut slots: Vec<Slot> = batch
        .iter()
        .map(|call| {
            let safe = registry
                .get(&call.name)
                .map(|t| t.concurrency_safe(&call.input))
                .unwrap_or(true);
            Slot {
                inv: ToolInvocation::new(&call.id, &call.name, call.input.clone()),
                safe,
                handle: None,
            }
        })
        .collect();

    let (wtx, mut wrx) = mpsc::unbounded_channel::<WorkerMsg>();
    let mut executing = 0usize;
    let mut executing_unsafe = false;
    let mut error_seen = false;
    let mut cancelled = false;
    let mut next_emit = 0usize;

    loop {
        // Start phase: head-to-tail scan over the queued remainder.
        loop {
            let Some(i) = slots
                .iter()
                .position(|s| s.inv.state == InvocationState::Queued)
            else {
                break;
            };

            if cancelled {
                slots[i].inv.cancel("cancelled");
                continue;
            }
            if error_seen {
                let id = slots[i].inv.id.clone();
                slots[i]
                    .inv
                    .finish(ToolOutput::err(&id, "sibling tool call errored"));
                continue;
            }

            let call = &batch[i];
            let Some(tool) = registry.get(&call.name) else {
                let id = slots[i].inv.id.clone();
                slots[i].inv.finish(ToolOutput::err(&id, "unknown tool"));
                error_seen = true;
                continue;
            };

            // Permission gating happens on the queued → executing edge; a
            // deny never counts against the concurrency cap.
            if let Decision::Deny { reason } = gate.adjudicate(tool.as_ref(), &call.input) {
                let id = slots[i].inv.id.clone();
                slots[i].inv.finish(ToolOutput::err(&id, reason));
                error_seen = true;
                continue;
            }

            if slots[i].safe {
                if executing < cap && !executing_unsafe {
                    start_slot(&mut slots[i], call, tool, &ctx, grace, &wtx, i);
                    executing += 1;
                    continue;
                }
                break;
            } else {
                // A mutating invocation runs alone; nothing else starts
                // until it completes.
                if executing == 0 {
                    start_slot(&mut slots[i], call, tool, &ctx, grace, &wtx, i);
                    executing += 1;
                    executing_unsafe = true;
                }
                break;
            }
        }

        // Emit phase: expose terminal invocations in submission order.
        while next_emit < n && slots[next_emit].inv.state.is_terminal() {
            let _ = tx
                .send(QueueEvent::Completed(slots[next_emit].inv.clone()))
                .await;
            next_emit += 1;
        }
        if next_emit == n {
            break;
        }

        // Wait phase.
        let msg = if cancelled {
            // Cooperative tools return promptly after the token fires; a
            // stuck one is forcibly terminated after the grace period.
            match tokio::time::timeout(grace, wrx.recv()).await {
                Ok(m) => m,
                Err(_) => {
                    for (i, slot) in slots.iter_mut().enumerate() {
                        if slot.inv.state == InvocationState::Executing {
                            if let Some(h) = slot.handle.take() {
                                h.abort();
                            }
                            warn!(index = i, tool = %slot.inv.tool_name,
                                  "forcibly terminating invocation after cancel grace");
                            slot.inv.cancel("cancelled");
                        }
                    }
                    continue;
                }
            }
        } else {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    debug!("batch cancel observed; draining unstarted invocations");
                    cancelled = true;
                    continue;
                }
                msg = wrx.recv() => msg,
            }
        };

        match msg {
            Some(WorkerMsg::Progress(i, message)) => {
                slots[i].inv.progress.push(message.clone());
                let _ = tx
                    .send(QueueEvent::Progress {
                        invocation_id: slots[i].inv.id.clone(),
                        message,
                    })
                    .await;
            }
            Some(WorkerMsg::Done(i, output)) => {
                executing = executing.saturating_sub(1);
                if !slots[i].safe {
                    executing_unsafe = false;
                }
                if output.is_error {
                    error_seen = true;
                }
                slots[i].handle = None;
                slots[i].inv.finish(output);
            }
            None => break,
        }
    }
}

fn start_slot(
    slot: &mut Slot,
    call: &ToolCall,
    tool: Arc<dyn crate::Tool>,
    ctx: &BatchContext,
    grace: Duration,
    wtx: &mpsc::UnboundedSender<WorkerMsg>,
    index: usize,
) {
    slot.inv.start();
    debug!(tool = %call.name, id = %call.id, "invocation started");

    let token = ctx.cancel.child_token();
    let (ptx, mut prx) = mpsc::unbounded_channel::<String>();
    let exec_ctx =
        ExecContext::new(token.clone(), ctx.cwd.clone(), ctx.scratch.clone()).with_progress(ptx);

    // Forward buffered progress into the scheduler.
    let wtx_progress = wtx.clone();
    tokio::spawn(async move {
        while let Some(msg) = prx.recv().await {
            if wtx_progress.send(WorkerMsg::Progress(index, msg)).is_err() {
                break;
            }
        }
    });

    let timeout = call
        .input
        .get("timeout_secs")
        .and_then(|v| v.as_u64())
        .map(Duration::from_secs)
        .unwrap_or_else(|| tool.timeout_default());
    let call = call.clone();
    let wtx = wtx.clone();

    slot.handle = Some(tokio::spawn(async move {
        let fut = async {
            let exec = tool.execute(&call, &exec_ctx);
            tokio::pin!(exec);
            tokio::select! {
                out = &mut exec => out,
                _ = tokio::time::sleep(timeout) => {
                    // Cooperative cancel first; forcible termination only
                    // after the grace period.
                    token.cancel();
                    match tokio::time::timeout(grace, &mut exec).await {
                        Ok(_) | Err(_) => ToolOutput::err(
                            &call.id,
                            format!("timed out after {}s", timeout.as_secs()),
                        ),
                    }
                }
            }
        };
        let out = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(out) => out,
            Err(_) => ToolOutput::err(&call.id, "tool execution panicked"),
        };
        let _ = wtx.send(WorkerMsg::Done(index, out));
    }));
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use sigrid_config::PermissionMode;

    use super::*;
    use crate::Tool;

    /// Test tool: records start/end into a shared log, optionally sleeps,
    /// optionally fails, and honours cooperative cancellation.
    struct ProbeTool {
        name: &'static str,
        read_only: bool,
        sleep_ms: u64,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "probe"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn read_only(&self) -> bool {
            self.read_only
        }
        fn timeout_default(&self) -> Duration {
            Duration::from_secs(30)
        }
        async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
            self.log.lock().unwrap().push(format!("start:{}", self.name));
            let work = tokio::time::sleep(Duration::from_millis(self.sleep_ms));
            tokio::select! {
                _ = work => {}
                _ = ctx.cancel.cancelled() => {
                    self.log.lock().unwrap().push(format!("cancelled:{}", self.name));
                    return ToolOutput::err(&call.id, "cancelled");
                }
            }
            self.log.lock().unwrap().push(format!("end:{}", self.name));
            if self.fail {
                ToolOutput::err(&call.id, "probe failed")
            } else {
                ToolOutput::ok(&call.id, format!("{} done", self.name))
            }
        }
    }

    fn queue_with(
        tools: Vec<ProbeTool>,
        cap: usize,
        mode: PermissionMode,
    ) -> ToolExecutionQueue {
        let mut reg = ToolRegistry::new();
        for t in tools {
            reg.register(t);
        }
        ToolExecutionQueue::new(
            Arc::new(reg),
            Arc::new(PermissionGate::for_mode(mode)),
            cap,
            Duration::from_millis(200),
        )
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            input: json!({}),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<QueueEvent>) -> Vec<ToolInvocation> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            if let QueueEvent::Completed(inv) = ev {
                out.push(inv);
            }
        }
        out
    }

    fn probe(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> ProbeTool {
        ProbeTool {
            name,
            read_only: true,
            sleep_ms: 10,
            fail: false,
            log: Arc::clone(log),
        }
    }

    // ── Submission-order yield ────────────────────────────────────────────────

    #[tokio::test]
    async fn results_yield_in_submission_order_despite_completion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = ProbeTool {
            sleep_ms: 150,
            ..probe("slow", &log)
        };
        let fast = ProbeTool {
            sleep_ms: 1,
            ..probe("fast", &log)
        };
        let q = queue_with(vec![slow, fast], 10, PermissionMode::Default);
        let rx = q.enqueue(
            vec![call("a", "slow"), call("b", "fast")],
            BatchContext::default(),
        );
        let results = collect(rx).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert_eq!(results[1].id, "b");
        // The fast tool genuinely finished first.
        let entries = log.lock().unwrap().clone();
        let fast_end = entries.iter().position(|e| e == "end:fast").unwrap();
        let slow_end = entries.iter().position(|e| e == "end:slow").unwrap();
        assert!(fast_end < slow_end);
    }

    // ── Parallel read-only prefix ─────────────────────────────────────────────

    #[tokio::test]
    async fn all_safe_invocations_start_before_any_finishes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mk = |name| ProbeTool {
            sleep_ms: 100,
            ..probe(name, &log)
        };
        let q = queue_with(vec![mk("r1"), mk("r2"), mk("r3")], 10, PermissionMode::Default);
        let rx = q.enqueue(
            vec![call("1", "r1"), call("2", "r2"), call("3", "r3")],
            BatchContext::default(),
        );
        let results = collect(rx).await;
        assert_eq!(results.len(), 3);
        let entries = log.lock().unwrap().clone();
        let last_start = entries
            .iter()
            .rposition(|e| e.starts_with("start:"))
            .unwrap();
        let first_end = entries.iter().position(|e| e.starts_with("end:")).unwrap();
        assert!(
            last_start < first_end,
            "all three must start before any ends: {entries:?}"
        );
    }

    // ── Serialization around a mutating invocation ────────────────────────────

    #[tokio::test]
    async fn mutating_invocation_serializes_with_neighbours() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let read1 = ProbeTool {
            sleep_ms: 50,
            ..probe("read1", &log)
        };
        let write = ProbeTool {
            read_only: false,
            sleep_ms: 50,
            ..probe("write", &log)
        };
        let read2 = ProbeTool {
            sleep_ms: 10,
            ..probe("read2", &log)
        };
        let q = queue_with(vec![read1, write, read2], 10, PermissionMode::Bypass);
        let rx = q.enqueue(
            vec![call("1", "read1"), call("2", "write"), call("3", "read2")],
            BatchContext::default(),
        );
        let results = collect(rx).await;
        assert_eq!(
            results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2", "3"]
        );
        let entries = log.lock().unwrap().clone();
        let pos = |e: &str| entries.iter().position(|x| x == e).unwrap();
        assert!(pos("end:read1") < pos("start:write"), "{entries:?}");
        assert!(pos("end:write") < pos("start:read2"), "{entries:?}");
    }

    #[tokio::test]
    async fn cap_of_one_behaves_fully_serial() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mk = |name| ProbeTool {
            sleep_ms: 20,
            ..probe(name, &log)
        };
        let q = queue_with(vec![mk("a"), mk("b")], 1, PermissionMode::Default);
        let rx = q.enqueue(
            vec![call("1", "a"), call("2", "b")],
            BatchContext::default(),
        );
        let _ = collect(rx).await;
        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["start:a", "end:a", "start:b", "end:b"]);
    }

    // ── Sibling-error propagation ─────────────────────────────────────────────

    #[tokio::test]
    async fn unstarted_siblings_complete_with_sibling_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bad = ProbeTool {
            fail: true,
            sleep_ms: 1,
            ..probe("bad", &log)
        };
        let never = ProbeTool {
            sleep_ms: 1,
            ..probe("never", &log)
        };
        // Cap 1 so the second invocation cannot start before the first
        // one's error is observed.
        let q = queue_with(vec![bad, never], 1, PermissionMode::Default);
        let rx = q.enqueue(
            vec![call("1", "bad"), call("2", "never")],
            BatchContext::default(),
        );
        let results = collect(rx).await;
        assert!(results[0].output().unwrap().is_error);
        let second = results[1].output().unwrap();
        assert!(second.is_error);
        assert_eq!(second.content, "sibling tool call errored");
        let entries = log.lock().unwrap().clone();
        assert!(!entries.contains(&"start:never".to_string()));
    }

    // ── Permission gating ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn gate_deny_yields_immediate_error_result() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let write = ProbeTool {
            read_only: false,
            sleep_ms: 1,
            ..probe("write", &log)
        };
        let q = queue_with(vec![write], 10, PermissionMode::Plan);
        let rx = q.enqueue(vec![call("1", "write")], BatchContext::default());
        let results = collect(rx).await;
        let out = results[0].output().unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("plan mode"));
        assert!(log.lock().unwrap().is_empty(), "denied tool must never start");
    }

    // ── Unknown tool ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn unknown_tool_completes_with_error() {
        let q = queue_with(vec![], 10, PermissionMode::Default);
        let rx = q.enqueue(vec![call("1", "ghost")], BatchContext::default());
        let results = collect(rx).await;
        let out = results[0].output().unwrap();
        assert!(out.is_error);
        assert_eq!(out.content, "unknown tool");
    }

    // ── Timeout ───────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn per_input_timeout_override_fires() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow = ProbeTool {
            sleep_ms: 5_000,
            ..probe("slow", &log)
        };
        let q = queue_with(vec![slow], 10, PermissionMode::Default);
        let mut c = call("1", "slow");
        c.input = json!({ "timeout_secs": 0 });
        let rx = q.enqueue(vec![c], BatchContext::default());
        let results = tokio::time::timeout(Duration::from_secs(5), collect(rx))
            .await
            .expect("timeout must resolve the batch");
        let out = results[0].output().unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("timed out"));
    }

    // ── Cancellation ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn cancel_drains_unstarted_and_aborts_executing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let long = ProbeTool {
            sleep_ms: 10_000,
            ..probe("long", &log)
        };
        let queued = ProbeTool {
            sleep_ms: 1,
            ..probe("queued", &log)
        };
        let q = queue_with(vec![long, queued], 1, PermissionMode::Default);
        let ctx = BatchContext::default();
        let token = ctx.cancel.clone();
        let rx = q.enqueue(vec![call("1", "long"), call("2", "queued")], ctx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let results = tokio::time::timeout(Duration::from_secs(2), collect(rx))
            .await
            .expect("cancel must resolve the batch within the grace window");
        assert_eq!(results.len(), 2);
        assert!(results[0].output().unwrap().is_error);
        assert_eq!(results[0].output().unwrap().content, "cancelled");
        assert_eq!(results[1].state, InvocationState::Cancelled);
        assert_eq!(results[1].output().unwrap().content, "cancelled");
    }

    // ── Progress ──────────────────────────────────────────────────────────────

    struct ProgressTool;

    #[async_trait]
    impl Tool for ProgressTool {
        fn name(&self) -> &str {
            "prog"
        }
        fn description(&self) -> &str {
            "emits progress"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn read_only(&self) -> bool {
            true
        }
        async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
            ctx.progress("halfway");
            ToolOutput::ok(&call.id, "done")
        }
    }

    #[tokio::test]
    async fn progress_events_surface_before_completion() {
        let mut reg = ToolRegistry::new();
        reg.register(ProgressTool);
        let q = ToolExecutionQueue::new(
            Arc::new(reg),
            Arc::new(PermissionGate::for_mode(PermissionMode::Default)),
            10,
            Duration::from_millis(200),
        );
        let mut rx = q.enqueue(vec![call("1", "prog")], BatchContext::default());
        let mut saw_progress = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                QueueEvent::Progress { message, .. } => {
                    assert_eq!(message, "halfway");
                    saw_progress = true;
                }
                QueueEvent::Completed(inv) => {
                    assert_eq!(inv.progress, vec!["halfway".to_string()]);
                }
            }
        }
        assert!(saw_progress);
    }
}
