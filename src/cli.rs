// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "sigrid", version, about = "Core runtime of an interactive coding agent")]
pub struct Cli {
    /// Prompt to run.  Reads stdin when omitted and stdin is piped.
    pub prompt: Option<String>,

    /// Explicit config file (merged over the discovered layers).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model override for this run.
    #[arg(long)]
    pub model: Option<String>,

    /// Permission mode override.
    #[arg(long, value_enum)]
    pub permission_mode: Option<ModeArg>,

    /// Resume an existing session id.
    #[arg(long)]
    pub resume: Option<String>,

    /// Verbose logging to stderr (also honours CLAUDE_DEBUG).
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Default,
    AcceptEdits,
    Plan,
    Bypass,
    DenyUnknown,
}

impl From<ModeArg> for sigrid_config::PermissionMode {
    fn from(m: ModeArg) -> Self {
        match m {
            ModeArg::Default => Self::Default,
            ModeArg::AcceptEdits => Self::AcceptEdits,
            ModeArg::Plan => Self::Plan,
            ModeArg::Bypass => Self::Bypass,
            ModeArg::DenyUnknown => Self::DenyUnknown,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the effective configuration.
    ShowConfig,
    /// List stored sessions.
    Sessions {
        /// Substring filter on the session id.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Delete a stored session.
    DeleteSession { id: String },
    /// List available agent types (built-in and user-defined).
    Agents,
}
