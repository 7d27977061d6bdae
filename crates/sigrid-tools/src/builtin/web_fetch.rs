// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{ExecContext, Tool, ToolCall, ToolOutput};

const MAX_CONTENT_BYTES: usize = 200_000;

/// Fetches a URL and returns readable text.  HTML is converted to plain
/// text; other content types are returned as-is (up to the byte cap).
pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetches a URL over HTTP(S) and returns the page as plain text.\n\
         HTML is converted to text; JSON and other text types pass through.\n\
         Response bodies are capped at 200 KB."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The http(s) URL to fetch"
                }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    fn timeout_default(&self) -> Duration {
        Duration::from_secs(30)
    }

    async fn execute(&self, call: &ToolCall, ctx: &ExecContext) -> ToolOutput {
        let Some(url) = call.input.get("url").and_then(|v| v.as_str()) else {
            return ToolOutput::err(&call.id, "missing required parameter 'url'");
        };
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return ToolOutput::err(&call.id, "only http(s) URLs are supported");
        }

        debug!(url, "web_fetch tool");

        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(25))
            .build()
        {
            Ok(c) => c,
            Err(e) => return ToolOutput::err(&call.id, format!("client init error: {e}")),
        };

        let resp = tokio::select! {
            r = client.get(url).send() => r,
            _ = ctx.cancel.cancelled() => {
                return ToolOutput::err(&call.id, "cancelled");
            }
        };
        let resp = match resp {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, format!("fetch error: {e}")),
        };

        let status = resp.status();
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = match resp.text().await {
            Ok(b) => b,
            Err(e) => return ToolOutput::err(&call.id, format!("body read error: {e}")),
        };
        if !status.is_success() {
            return ToolOutput::err(&call.id, format!("HTTP {status}: {}", cap(&body)));
        }

        let text = if content_type.contains("text/html") {
            html2text::from_read(body.as_bytes(), 100)
        } else {
            body
        };
        ToolOutput::ok(&call.id, cap(&text))
    }
}

fn cap(s: &str) -> String {
    if s.len() <= MAX_CONTENT_BYTES {
        s.to_string()
    } else {
        let mut cut = MAX_CONTENT_BYTES;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}\n…[{} bytes omitted]", &s[..cut], s.len() - cut)
    }
}
