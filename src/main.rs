// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{IsTerminal, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use sigrid_core::{
    ConversationLoop, LoopEvent, SchedulerOptions, SubAgentScheduler, TaskTool, TurnOutcome,
};
use sigrid_mcp_client::McpMultiplexer;
use sigrid_model::{classify, redact, ErrorKind};
use sigrid_store::{SessionStore, TaskSnapshotStore};
use sigrid_tools::{register_builtins, PermissionGate, ToolRegistry};

fn main() {
    let code = real_main();
    std::process::exit(code);
}

fn real_main() -> i32 {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            return 1;
        }
    };
    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {}", redact(&format!("{e:#}")));
            match classify(&e) {
                ErrorKind::Permission => 2,
                _ => 1,
            }
        }
    }
}

/// Tracing to stderr.  `CLAUDE_DEBUG` carries a filter directive (`*` maps
/// to trace); `--verbose` turns on debug for our crates.
fn init_logging(verbose: bool) {
    let directive = match std::env::var("CLAUDE_DEBUG") {
        Ok(v) if v == "*" => "trace".to_string(),
        Ok(v) if !v.is_empty() => v,
        _ if verbose => "sigrid=debug,sigrid_core=debug,sigrid_tools=debug,\
                         sigrid_model=debug,sigrid_mcp_client=debug"
            .to_string(),
        _ => "warn".to_string(),
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = sigrid_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.provider.model = model.clone();
    }
    if let Some(mode) = cli.permission_mode {
        config.permissions.mode = mode.into();
    }

    let state_dir = sigrid_config::state_dir(&config);
    let store = Arc::new(SessionStore::new(&state_dir));

    if let Some(command) = &cli.command {
        return run_command(command, &config, &store).await;
    }

    // Prompt from argv, or from piped stdin.
    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None if !std::io::stdin().is_terminal() => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
        None => {
            eprintln!("no prompt given; pass one as an argument or pipe it on stdin");
            return Ok(1);
        }
    };
    if prompt.trim().is_empty() {
        return Ok(0);
    }

    // Retention sweep before anything touches the store.
    if config.session_retention_days > 0 {
        let removed = store.sweep_expired(config.session_retention_days).await?;
        if removed > 0 {
            tracing::debug!(removed, "expired sessions removed");
        }
    }

    let provider = sigrid_model::build_provider(&config.provider)?;

    // Base tool set shared with sub-agents (no task tool: nesting is
    // bounded by construction).
    let mut base = ToolRegistry::new();
    register_builtins(
        &mut base,
        std::time::Duration::from_secs(config.tools.kill_grace_secs),
    );
    let base = Arc::new(base);

    let scheduler = Arc::new(
        SubAgentScheduler::new(
            sigrid_agents::discover_types(std::env::current_dir().ok().as_deref()),
            Arc::clone(&provider),
            Arc::clone(&base),
            config.agent.clone(),
            config.tools.clone(),
            config.context.clone(),
            SchedulerOptions {
                max_concurrency: config.agent.max_subagent_concurrency,
                progress_interval: config.agent.progress_interval,
                delta_summaries: true,
                model: config.provider.model.clone(),
            },
        )
        .with_snapshots(Arc::new(TaskSnapshotStore::new(&state_dir))),
    );
    let crashed = scheduler.recover().await?;
    if crashed > 0 {
        eprintln!("note: {crashed} background task(s) from a previous run marked failed");
    }

    // MCP servers: connect, then expose discovered tools.
    let mut multiplexer = McpMultiplexer::new(Arc::new(|_server: &str| Vec::new()));
    for (name, server) in &config.mcp_servers {
        if let Err(e) = multiplexer.connect(name, server.clone()).await {
            eprintln!("warning: MCP server '{name}' unavailable: {e:#}");
        }
    }

    let mut registry = ToolRegistry::new();
    register_builtins(
        &mut registry,
        std::time::Duration::from_secs(config.tools.kill_grace_secs),
    );
    registry.register(TaskTool::new(Arc::clone(&scheduler)));
    multiplexer.register_tools(&mut registry);

    let gate = Arc::new(PermissionGate::new(&config.permissions, None));
    let mut conversation = ConversationLoop::new(
        provider,
        Arc::new(registry),
        gate,
        config.agent.clone(),
        config.tools.clone(),
        config.context.clone(),
        config.provider.model.clone(),
    )
    .with_store(Arc::clone(&store))
    .with_scheduler(Arc::clone(&scheduler));
    if let Some(prompt_override) = &config.agent.system_prompt {
        conversation = conversation.with_system_prompt(prompt_override.clone());
    }

    if let Some(resume_id) = &cli.resume {
        resume_session(&mut conversation, &store, resume_id).await?;
    }

    // Ctrl-C cancels cooperatively; the loop drains in-flight tools and
    // appends the interrupt acknowledgement before returning.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<LoopEvent>(256);
    let printer = tokio::spawn(print_events(rx));

    let outcome = conversation.submit(&prompt, tx, cancel).await;
    multiplexer.close_all().await;
    let _ = printer.await;

    match outcome? {
        TurnOutcome::Cancelled => Ok(130),
        TurnOutcome::MaxTurnsExceeded => {
            eprintln!("stopped: maximum turn budget reached");
            Ok(0)
        }
        TurnOutcome::MaxTokens => {
            eprintln!("stopped: model hit the output token limit; partial answer shown");
            Ok(0)
        }
        _ => Ok(0),
    }
}

async fn run_command(
    command: &Commands,
    config: &sigrid_config::Config,
    store: &Arc<SessionStore>,
) -> anyhow::Result<i32> {
    match command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(config)?);
        }
        Commands::Sessions { filter } => {
            for summary in store.list(filter.as_deref()).await? {
                println!(
                    "{}  {}  {} events",
                    summary.id,
                    summary.modified.format("%Y-%m-%d %H:%M"),
                    summary.events
                );
            }
        }
        Commands::DeleteSession { id } => {
            store.delete(id).await?;
            println!("deleted {id}");
        }
        Commands::Agents => {
            for agent in sigrid_agents::discover_types(std::env::current_dir().ok().as_deref()) {
                println!("{:<20} {}", agent.name, agent.description);
            }
        }
    }
    Ok(0)
}

/// Rehydrate a stored session's messages into the loop.
async fn resume_session(
    conversation: &mut ConversationLoop,
    store: &Arc<SessionStore>,
    resume_id: &str,
) -> anyhow::Result<()> {
    let events = store.load(resume_id).await?;
    if events.is_empty() {
        anyhow::bail!("session '{resume_id}' not found or empty");
    }
    let mut messages = Vec::new();
    for event in events {
        if event.kind == sigrid_store::EventKind::Message {
            let message: sigrid_model::Message = serde_json::from_value(event.payload)
                .context("stored message is not parseable")?;
            messages.push(message);
        }
    }
    conversation.session_mut().id = resume_id.to_string();
    conversation.session_mut().replace_messages(messages);
    Ok(())
}

async fn print_events(mut rx: tokio::sync::mpsc::Receiver<LoopEvent>) {
    let mut streamed = false;
    while let Some(event) = rx.recv().await {
        match event {
            LoopEvent::TextDelta(delta) => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
                streamed = true;
            }
            LoopEvent::TextComplete(_) => {
                if streamed {
                    println!();
                    streamed = false;
                }
            }
            LoopEvent::ToolStarted { name, .. } => eprintln!("· {name} …"),
            LoopEvent::ToolFinished {
                name, is_error, ..
            } => {
                if is_error {
                    eprintln!("· {name} failed");
                }
            }
            LoopEvent::ToolProgress { message, .. } => eprintln!("  {message}"),
            LoopEvent::TaskAttachment(att) => eprintln!("{}", att.render()),
            LoopEvent::ContextCompacted {
                tokens_before,
                tokens_after,
            } => eprintln!("· context compacted {tokens_before} → {tokens_after} tokens"),
            LoopEvent::Error { tag, message } => eprintln!("error [{tag}]: {message}"),
            LoopEvent::Aborted { .. } => eprintln!("\ninterrupted"),
            LoopEvent::ThinkingDelta(_) | LoopEvent::TokenUsage { .. } => {}
            LoopEvent::TurnComplete(_) => {}
        }
    }
}
