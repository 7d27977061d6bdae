// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Dependency checking and ready-ordering for background tasks.
//!
//! The task graph is ids plus an adjacency table — no pointer cycles.
//! Cycles are rejected at spawn time; among ready tasks, higher priority
//! runs first, ties broken by insertion order.

use std::collections::{HashMap, HashSet};

use crate::task::{BackgroundTask, TaskStatus};

/// Check that adding `new_id → depends_on` keeps the graph acyclic.
///
/// `edges` maps a task id to the ids it depends on.  Returns the cycle
/// path when one exists.
pub fn check_acyclic(
    edges: &HashMap<String, Vec<String>>,
    new_id: &str,
    depends_on: &[String],
) -> Result<(), Vec<String>> {
    // Walk from each new dependency; reaching new_id again closes a cycle.
    for dep in depends_on {
        let mut path = vec![new_id.to_string(), dep.clone()];
        let mut visited = HashSet::new();
        if walk(edges, dep, new_id, &mut visited, &mut path) {
            return Err(path);
        }
    }
    Ok(())
}

fn walk(
    edges: &HashMap<String, Vec<String>>,
    current: &str,
    target: &str,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if current == target {
        return true;
    }
    if !visited.insert(current.to_string()) {
        return false;
    }
    if let Some(deps) = edges.get(current) {
        for dep in deps {
            path.push(dep.clone());
            if walk(edges, dep, target, visited, path) {
                return true;
            }
            path.pop();
        }
    }
    false
}

/// Ids of tasks that may start now: pending, with every dependency
/// completed, ordered by priority (higher first).
///
/// A dependency that failed or was cancelled makes the dependant
/// unrunnable; those are reported separately so the scheduler can fail
/// them.
pub fn ready_tasks(tasks: &[BackgroundTask]) -> (Vec<String>, Vec<String>) {
    let by_id: HashMap<&str, &BackgroundTask> =
        tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut ready = Vec::new();
    let mut doomed = Vec::new();
    for t in tasks.iter().filter(|t| t.status == TaskStatus::Pending) {
        let mut ok = true;
        let mut dead = false;
        for dep in &t.depends_on {
            match by_id.get(dep.as_str()).map(|d| d.status) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) | None => {
                    dead = true;
                    break;
                }
                _ => {
                    ok = false;
                    break;
                }
            }
        }
        if dead {
            doomed.push(t.id.clone());
        } else if ok {
            ready.push((t.priority, t.id.clone()));
        }
    }
    // Stable sort keeps insertion order among equal priorities.
    ready.sort_by_key(|(p, _)| std::cmp::Reverse(*p));
    (ready.into_iter().map(|(_, id)| id).collect(), doomed)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
