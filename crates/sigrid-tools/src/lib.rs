// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
mod gate;
mod invocation;
mod queue;
mod registry;
mod tool;

pub use gate::{Decision, PermissionGate, PromptCallback};
pub use invocation::{InvocationState, ToolInvocation};
pub use queue::{BatchContext, QueueEvent, ToolExecutionQueue};
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{ExecContext, Tool, ToolCall, ToolOutput};

pub use builtin::glob::GlobTool;
pub use builtin::grep::GrepTool;
pub use builtin::list_dir::ListDirTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::shell::ShellTool;
pub use builtin::web_fetch::WebFetchTool;
pub use builtin::write_file::WriteFileTool;

use std::time::Duration;

/// Register the built-in tool set.
pub fn register_builtins(reg: &mut ToolRegistry, kill_grace: Duration) {
    reg.register(ReadFileTool);
    reg.register(WriteFileTool);
    reg.register(ListDirTool);
    reg.register(GlobTool);
    reg.register(GrepTool);
    reg.register(ShellTool { kill_grace });
    reg.register(WebFetchTool);
}
