// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::tool::{ExecContext, Tool, ToolCall, ToolOutput};

const OUTPUT_LIMIT: usize = 100_000;

/// Executes shell commands.  Never concurrency-safe: a command may mutate
/// anything, so the queue serializes it against every other invocation.
pub struct ShellTool {
    /// Grace period between SIGTERM and SIGKILL on cancellation.
    pub kill_grace: Duration,
}

impl Default for ShellTool {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Executes a shell command and returns stdout/stderr.\n\
         For terminal operations (git, cargo, make). Do NOT use it for file\n\
         operations — use read_file, write_file, grep and glob instead.\n\
         Independent commands: separate calls in the same turn. Dependent\n\
         commands: chain with '&&' in one call.\n\
         Output is limited to 100,000 characters. Non-zero exit codes are\n\
         returned as errors with the exit code in the output."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "workdir": {
                    "type": "string",
                    "description": "Working directory (optional, defaults to cwd)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        false
    }

    fn timeout_default(&self) -> Duration {
        Duration::from_secs(120)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
        let Some(command) = call.input.get("command").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing 'command' argument");
        };
        let workdir = call
            .input
            .get("workdir")
            .and_then(|v| v.as_str())
            .map(|w| ctx.cwd.join(w))
            .unwrap_or_else(|| ctx.cwd.clone());

        debug!(cmd = %command, "shell tool");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("spawn error: {e}")),
        };
        let pid = child.id();
        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");

        // Readers must run alongside wait(); otherwise a chatty child fills
        // the pipe and deadlocks.
        let wait_and_read = async {
            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            let (status, _, _) = tokio::join!(
                child.wait(),
                stdout.read_to_end(&mut out_buf),
                stderr.read_to_end(&mut err_buf),
            );
            (status, out_buf, err_buf)
        };
        tokio::pin!(wait_and_read);

        let (status, out_buf, err_buf) = tokio::select! {
            res = &mut wait_and_read => res,
            _ = ctx.cancel.cancelled() => {
                // SIGTERM, grace period, then SIGKILL.
                signal(pid, Sig::Term);
                match tokio::time::timeout(self.kill_grace, &mut wait_and_read).await {
                    Ok(_) => {}
                    Err(_) => {
                        warn!(pid, "shell child ignored SIGTERM; sending SIGKILL");
                        signal(pid, Sig::Kill);
                        let _ = wait_and_read.await;
                    }
                }
                return ToolOutput::err(&call.id, "cancelled");
            }
        };

        let status = match status {
            Ok(s) => s,
            Err(e) => return ToolOutput::err(&call.id, format!("wait error: {e}")),
        };

        let mut content = String::new();
        let stdout_text = String::from_utf8_lossy(&out_buf);
        let stderr_text = String::from_utf8_lossy(&err_buf);
        if !stdout_text.is_empty() {
            content.push_str(&truncate(&stdout_text, OUTPUT_LIMIT));
        }
        if !stderr_text.is_empty() {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str("[stderr]\n");
            content.push_str(&truncate(&stderr_text, OUTPUT_LIMIT));
        }
        if content.is_empty() {
            content = format!("[exit {}]", status.code().unwrap_or(-1));
        }

        if status.success() {
            ToolOutput::ok(&call.id, content)
        } else {
            let code = status.code().unwrap_or(-1);
            ToolOutput::err(&call.id, format!("[exit {code}]\n{content}"))
        }
    }
}

enum Sig {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal(pid: Option<u32>, sig: Sig) {
    if let Some(pid) = pid {
        let s = match sig {
            Sig::Term => libc::SIGTERM,
            Sig::Kill => libc::SIGKILL,
        };
        unsafe {
            libc::kill(pid as i32, s);
        }
    }
}

#[cfg(not(unix))]
fn signal(_pid: Option<u32>, _sig: Sig) {
    // kill_on_drop covers forcible termination on non-unix platforms.
}

fn truncate(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let mut cut = limit;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...[truncated {} bytes]", &s[..cut], s.len() - cut)
}
