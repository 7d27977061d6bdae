// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::{Config, ProviderAdapter};

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/sigrid/config.yaml"));
    paths.push(PathBuf::from("/etc/sigrid/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/sigrid/config.yaml"));
        paths.push(home.join(".config/sigrid/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("sigrid/config.yaml"));
        paths.push(cfg.join("sigrid/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".sigrid/config.yaml"));
    paths.push(PathBuf::from(".sigrid/config.yml"));
    paths.push(PathBuf::from(".sigrid.yaml"));
    paths.push(PathBuf::from(".sigrid.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment-variable overrides.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply the recognized environment variables on top of the file-based config.
///
/// Env always wins over files so that a single shell export can redirect a
/// whole fleet of CI jobs without touching their checked-in configs.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = std::env::var("CLAUDE_CODE_MAX_TOOL_USE_CONCURRENCY") {
        match v.parse::<usize>() {
            Ok(n) if n > 0 => config.tools.max_concurrency = n,
            _ => debug!(value = %v, "ignoring invalid CLAUDE_CODE_MAX_TOOL_USE_CONCURRENCY"),
        }
    }
    if let Ok(url) = std::env::var("ANTHROPIC_BASE_URL") {
        if !url.is_empty() {
            config.provider.base_url = Some(url);
        }
    }
    if env_flag("CLAUDE_CODE_USE_BEDROCK") {
        config.provider.adapter = ProviderAdapter::Bedrock;
    } else if env_flag("CLAUDE_CODE_USE_VERTEX") {
        config.provider.adapter = ProviderAdapter::Vertex;
    } else if env_flag("CLAUDE_CODE_USE_FOUNDRY") {
        config.provider.adapter = ProviderAdapter::Foundry;
    }
}

/// True when the variable is set to anything other than `""`, `"0"`, or `"false"`.
fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false")),
        Err(_) => false,
    }
}

/// Resolve the state directory where sessions and background-task snapshots
/// live.  A configured `state_dir` (with `~` expansion) wins; otherwise the
/// platform data dir (`~/.local/share/sigrid`).
pub fn state_dir(config: &Config) -> PathBuf {
    if let Some(dir) = &config.state_dir {
        return PathBuf::from(shellexpand::tilde(dir).into_owned());
    }
    dirs::data_dir()
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local")
                .join("share")
        })
        .join("sigrid")
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
