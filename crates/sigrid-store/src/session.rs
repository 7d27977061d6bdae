// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Append-only session persistence.
//!
//! One JSONL file per session id under `<state_dir>/sessions/<id>.jsonl`.
//! Each line is one event `{ts, type, payload}`.  Writes go through a
//! write-to-temp-then-rename cycle so a crash can never leave a torn file
//! behind; a partially-written trailing line (possible only when the
//! process died inside the rename window of an older implementation, or
//! the disk filled) is discarded on load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Message,
    Usage,
    Meta,
}

/// One line of the session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
}

impl StoredEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            payload,
        }
    }
}

/// Summary of one stored session, as returned by [`SessionStore::list`].
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
    pub events: usize,
}

/// File-backed session store.
///
/// Concurrent writers to the same session id serialize on a per-id async
/// lock; writers to different ids do not contend.
pub struct SessionStore {
    root: PathBuf,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: state_dir.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{id}.jsonl"))
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Append one event to the session log.
    pub async fn append(&self, id: &str, event: StoredEvent) -> anyhow::Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let dir = self.sessions_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let path = self.session_path(id);
        let mut contents = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("reading {}", path.display())))
            }
        };
        let line = serde_json::to_string(&event).context("serializing session event")?;
        contents.extend_from_slice(line.as_bytes());
        contents.push(b'\n');

        atomic_write(&path, &contents).await
    }

    /// Load all fully-appended events for a session.
    ///
    /// A non-parseable trailing line is discarded (torn write); a
    /// non-parseable line in the middle of the file is skipped with a
    /// warning so one bad line cannot hold the whole session hostage.
    pub async fn load(&self, id: &str) -> anyhow::Result<Vec<StoredEvent>> {
        let path = self.session_path(id);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("reading {}", path.display())))
            }
        };

        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let mut events = Vec::with_capacity(lines.len());
        let last = lines.len().saturating_sub(1);
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<StoredEvent>(line) {
                Ok(ev) => events.push(ev),
                Err(e) if i == last => {
                    warn!(session = id, error = %e, "discarding partially-written trailing line");
                }
                Err(e) => {
                    warn!(session = id, line = i, error = %e, "skipping unparseable session line");
                }
            }
        }
        Ok(events)
    }

    /// List stored sessions, optionally filtered by an id substring.
    pub async fn list(&self, filter: Option<&str>) -> anyhow::Result<Vec<SessionSummary>> {
        let dir = self.sessions_dir();
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
                .and_then(|n| n.strip_suffix(".jsonl"))
                .map(str::to_string)
            else {
                continue;
            };
            if let Some(f) = filter {
                if !id.contains(f) {
                    continue;
                }
            }
            let modified = entry
                .metadata()
                .await
                .ok()
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now);
            let events = self.load(&id).await.map(|e| e.len()).unwrap_or(0);
            out.push(SessionSummary {
                id,
                path,
                modified,
                events,
            });
        }
        out.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(out)
    }

    /// Remove a session log.  Missing files are not an error.
    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        match tokio::fs::remove_file(self.session_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete sessions whose log has not been touched within the retention
    /// period.  `retention_days == 0` disables the sweep.
    pub async fn sweep_expired(&self, retention_days: u32) -> anyhow::Result<usize> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let mut removed = 0usize;
        for summary in self.list(None).await? {
            if summary.modified < cutoff {
                self.delete(&summary.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Write `contents` to a sibling temp file, then rename into place.
pub(crate) async fn atomic_write(path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, contents)
        .await
        .with_context(|| format!("writing {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
