// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Background-task snapshots.
//!
//! One JSON file per task id under `<state_dir>/agents/<id>.json`,
//! overwritten atomically on every status transition so the scheduler can
//! reload and reconcile after a process restart.

use std::path::PathBuf;

use anyhow::Context;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use crate::session::atomic_write;

pub struct TaskSnapshotStore {
    root: PathBuf,
}

impl TaskSnapshotStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
        }
    }

    fn agents_dir(&self) -> PathBuf {
        self.root.join("agents")
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.agents_dir().join(format!("{id}.json"))
    }

    /// Persist the full task state, replacing any previous snapshot.
    pub async fn save<T: Serialize>(&self, id: &str, task: &T) -> anyhow::Result<()> {
        let dir = self.agents_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        let contents = serde_json::to_vec_pretty(task).context("serializing task snapshot")?;
        atomic_write(&self.task_path(id), &contents).await
    }

    pub async fn load<T: DeserializeOwned>(&self, id: &str) -> anyhow::Result<Option<T>> {
        let path = self.task_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("reading {}", path.display())))
            }
        };
        Ok(Some(
            serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?,
        ))
    }

    /// Load every stored snapshot, skipping unparseable files with a warning.
    pub async fn load_all<T: DeserializeOwned>(&self) -> anyhow::Result<Vec<(String, T)>> {
        let dir = self.agents_dir();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("reading {}", dir.display())))
            }
        };
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(id) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".json"))
                .map(str::to_string)
            else {
                continue;
            };
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                    Ok(task) => out.push((id, task)),
                    Err(e) => warn!(task = id, error = %e, "skipping unparseable task snapshot"),
                },
                Err(e) => warn!(task = id, error = %e, "skipping unreadable task snapshot"),
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        match tokio::fs::remove_file(self.task_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snap {
        id: String,
        status: String,
    }

    fn snap(id: &str, status: &str) -> Snap {
        Snap {
            id: id.into(),
            status: status.into(),
        }
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskSnapshotStore::new(dir.path());
        store.save("t1", &snap("t1", "running")).await.unwrap();
        let loaded: Option<Snap> = store.load("t1").await.unwrap();
        assert_eq!(loaded, Some(snap("t1", "running")));
    }

    #[tokio::test]
    async fn save_overwrites_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskSnapshotStore::new(dir.path());
        store.save("t1", &snap("t1", "pending")).await.unwrap();
        store.save("t1", &snap("t1", "completed")).await.unwrap();
        let loaded: Option<Snap> = store.load("t1").await.unwrap();
        assert_eq!(loaded.unwrap().status, "completed");
    }

    #[tokio::test]
    async fn load_all_skips_garbage_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskSnapshotStore::new(dir.path());
        store.save("good", &snap("good", "running")).await.unwrap();
        tokio::fs::write(dir.path().join("agents/bad.json"), b"{not json")
            .await
            .unwrap();
        let all: Vec<(String, Snap)> = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "good");
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskSnapshotStore::new(dir.path());
        store.save("t1", &snap("t1", "x")).await.unwrap();
        store.delete("t1").await.unwrap();
        store.delete("t1").await.unwrap();
        let loaded: Option<Snap> = store.load("t1").await.unwrap();
        assert!(loaded.is_none());
    }
}
