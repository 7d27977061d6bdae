// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cross-crate integration tests: the loop wired the way the binary wires
//! it, with the mock provider standing in for the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sigrid_config::{AgentConfig, ContextConfig, PermissionMode, ToolsConfig};
use sigrid_core::{ConversationLoop, LoopEvent, TurnOutcome};
use sigrid_model::{text_script, tool_use_script, ScriptedMockProvider};
use sigrid_store::SessionStore;
use sigrid_tools::{register_builtins, PermissionGate, ToolRegistry};

fn full_conversation(provider: ScriptedMockProvider, dir: &std::path::Path) -> ConversationLoop {
    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry, Duration::from_secs(1));
    ConversationLoop::new(
        Arc::new(provider),
        Arc::new(registry),
        Arc::new(PermissionGate::for_mode(PermissionMode::Bypass)),
        AgentConfig::default(),
        ToolsConfig::default(),
        ContextConfig::default(),
        "scripted-mock-model",
    )
    .with_cwd(dir)
}

#[tokio::test]
async fn end_to_end_read_edit_read_with_builtin_tools() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "version = 1\n").unwrap();

    let provider = ScriptedMockProvider::new(vec![
        tool_use_script(vec![(
            "t1",
            "read_file",
            serde_json::json!({"path": "notes.txt"}),
        )]),
        tool_use_script(vec![(
            "t2",
            "write_file",
            serde_json::json!({"path": "notes.txt", "content": "version = 2\n"}),
        )]),
        text_script("bumped the version".into()),
    ]);

    let mut conversation = full_conversation(provider, dir.path());
    let (tx, _rx) = mpsc::channel(1024);
    let outcome = conversation
        .submit("bump the version in notes.txt", tx, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, TurnOutcome::EndTurn);

    let on_disk = std::fs::read_to_string(dir.path().join("notes.txt")).unwrap();
    assert_eq!(on_disk, "version = 2\n");

    // Every tool_use in the history is answered by a paired tool_result.
    let messages = &conversation.session().messages;
    for (i, m) in messages.iter().enumerate() {
        let uses = m.tool_uses();
        if uses.is_empty() {
            continue;
        }
        let answers = messages[i + 1].tool_result_ids();
        let use_ids: Vec<&str> = uses.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(use_ids, answers, "pairing broken at message {i}");
    }
}

#[tokio::test]
async fn persisted_session_can_be_reloaded_for_resume() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SessionStore::new(dir.path()));

    let provider = ScriptedMockProvider::always_text("the answer");
    let mut conversation =
        full_conversation(provider, dir.path()).with_store(Arc::clone(&store));
    let session_id = conversation.session().id.clone();

    let (tx, _rx) = mpsc::channel(256);
    conversation
        .submit("a question", tx, CancellationToken::new())
        .await
        .unwrap();

    let events = store.load(&session_id).await.unwrap();
    let messages: Vec<sigrid_model::Message> = events
        .into_iter()
        .filter(|e| e.kind == sigrid_store::EventKind::Message)
        .map(|e| serde_json::from_value(e.payload).unwrap())
        .collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "a question");
    assert_eq!(messages[1].text(), "the answer");
}

#[tokio::test]
async fn interrupt_event_surface_matches_cli_expectations() {
    let dir = tempfile::tempdir().unwrap();
    let provider = ScriptedMockProvider::new(vec![text_script("fast answer".into())]);
    let mut conversation = full_conversation(provider, dir.path());

    let (tx, mut rx) = mpsc::channel(256);
    conversation
        .submit("quick", tx, CancellationToken::new())
        .await
        .unwrap();

    let mut saw_delta = false;
    let mut saw_complete = false;
    while let Ok(ev) = rx.try_recv() {
        match ev {
            LoopEvent::TextDelta(_) => saw_delta = true,
            LoopEvent::TurnComplete(TurnOutcome::EndTurn) => saw_complete = true,
            _ => {}
        }
    }
    assert!(saw_delta && saw_complete);
}
