// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Transport links for MCP connections.
//!
//! Four shapes: a spawned child speaking newline-delimited JSON on
//! stdin/stdout, a WebSocket, plain HTTP request/response, and SSE
//! long-poll (POST for sends, an event stream for receives).  The
//! connection actor drives all of them through the same send/recv surface.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{bail, Context};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncBufReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::{debug, warn};

use sigrid_config::McpServerConfig;

/// Headers injected per server on each connect / outbound HTTP request.
pub type Headers = Vec<(String, String)>;

pub enum TransportLink {
    Stdio(StdioLink),
    Ws(WsLink),
    Http(HttpLink),
    Sse(SseLink),
    #[cfg(test)]
    Mock(MockLink),
}

impl TransportLink {
    pub async fn send(&mut self, text: &str) -> anyhow::Result<()> {
        match self {
            Self::Stdio(l) => l.send(text).await,
            Self::Ws(l) => l.send(text).await,
            Self::Http(l) => l.send(text).await,
            Self::Sse(l) => l.send(text).await,
            #[cfg(test)]
            Self::Mock(l) => l.send(text).await,
        }
    }

    /// Next inbound frame.  `None` means the link is gone (child exited,
    /// socket closed, stream ended).
    pub async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        match self {
            Self::Stdio(l) => l.recv().await,
            Self::Ws(l) => l.recv().await,
            Self::Http(l) => l.recv().await,
            Self::Sse(l) => l.recv().await,
            #[cfg(test)]
            Self::Mock(l) => l.recv().await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Self::Stdio(l) => l.close().await,
            Self::Ws(l) => l.close().await,
            Self::Http(_) | Self::Sse(_) => {}
            #[cfg(test)]
            Self::Mock(_) => {}
        }
    }
}

// ─── stdio ────────────────────────────────────────────────────────────────────

pub struct StdioLink {
    child: Child,
    writer: FramedWrite<tokio::process::ChildStdin, LinesCodec>,
    reader: tokio::io::Lines<tokio::io::BufReader<tokio::process::ChildStdout>>,
}

impl StdioLink {
    /// Spawn the configured child.  Reconnecting a stdio server means
    /// respawning it.
    pub fn spawn(config: &McpServerConfig, extra_env: &HashMap<String, String>) -> anyhow::Result<Self> {
        let command = config
            .command
            .as_deref()
            .context("stdio transport requires 'command'")?;
        let mut cmd = Command::new(command);
        cmd.args(&config.args)
            .envs(&config.env)
            .envs(extra_env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning MCP server '{command}'"))?;

        let stdin = child.stdin.take().context("child stdin unavailable")?;
        let stdout = child.stdout.take().context("child stdout unavailable")?;
        Ok(Self {
            child,
            writer: FramedWrite::new(stdin, LinesCodec::new()),
            reader: tokio::io::BufReader::new(stdout).lines(),
        })
    }

    async fn send(&mut self, text: &str) -> anyhow::Result<()> {
        self.writer
            .send(text.to_string())
            .await
            .context("writing to MCP child stdin")
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        match self.reader.next_line().await {
            Ok(Some(line)) => Some(Ok(line)),
            Ok(None) => None,
            Err(e) => Some(Err(e.into())),
        }
    }

    async fn close(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

// ─── WebSocket ────────────────────────────────────────────────────────────────

pub struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    /// The server's `x-last-request-id` response header from the upgrade,
    /// when present.  Drives replay after reconnect.
    pub acked_request_id: Option<String>,
}

impl WsLink {
    /// Connect, sending auth headers plus `X-Last-Request-Id` so the server
    /// can tell us where to resume.
    pub async fn connect(
        url: &str,
        headers: &Headers,
        last_request_id: Option<&str>,
    ) -> anyhow::Result<Self> {
        let mut request = url
            .into_client_request()
            .context("invalid WebSocket URL")?;
        for (k, v) in headers {
            request.headers_mut().insert(
                reqwest::header::HeaderName::from_bytes(k.as_bytes())
                    .context("invalid header name")?,
                v.parse().context("invalid header value")?,
            );
        }
        if let Some(id) = last_request_id {
            request
                .headers_mut()
                .insert("X-Last-Request-Id", id.parse().context("invalid request id")?);
        }

        let (ws, response) = connect_async(request)
            .await
            .context("WebSocket connect failed")?;
        let acked_request_id = response
            .headers()
            .get("x-last-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(status = %response.status(), acked = ?acked_request_id, "websocket connected");
        Ok(Self {
            ws,
            acked_request_id,
        })
    }

    async fn send(&mut self, text: &str) -> anyhow::Result<()> {
        self.ws
            .send(WsMessage::Text(text.to_string()))
            .await
            .context("websocket send failed")
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Text(t)) => return Some(Ok(t)),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue, // binary / protocol-level ping frames
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ─── HTTP request/response ────────────────────────────────────────────────────

pub struct HttpLink {
    client: reqwest::Client,
    url: String,
    headers: Headers,
    inbox_tx: mpsc::UnboundedSender<String>,
    inbox_rx: mpsc::UnboundedReceiver<String>,
}

impl HttpLink {
    pub fn new(url: &str, headers: Headers) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            headers,
            inbox_tx,
            inbox_rx,
        }
    }

    /// POST the frame; the response body (if any) becomes the next inbound
    /// frame.  Notifications produce empty bodies which are dropped.
    async fn send(&mut self, text: &str) -> anyhow::Result<()> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        let resp = builder
            .body(text.to_string())
            .send()
            .await
            .context("MCP http post failed")?;
        if !resp.status().is_success() {
            bail!("MCP http error {}", resp.status());
        }
        let body = resp.text().await.unwrap_or_default();
        if !body.trim().is_empty() {
            let _ = self.inbox_tx.send(body);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        self.inbox_rx.recv().await.map(Ok)
    }
}

// ─── SSE long-poll ────────────────────────────────────────────────────────────

pub struct SseLink {
    client: reqwest::Client,
    url: String,
    headers: Headers,
    events_rx: mpsc::UnboundedReceiver<String>,
}

impl SseLink {
    /// Open the event stream.  Sends go out as POSTs to the same endpoint;
    /// server-to-client frames arrive as `data:` lines on the stream.
    pub async fn connect(url: &str, headers: Headers) -> anyhow::Result<Self> {
        let client = reqwest::Client::new();
        let mut builder = client.get(url).header("accept", "text/event-stream");
        for (k, v) in &headers {
            builder = builder.header(k, v);
        }
        let resp = builder.send().await.context("SSE connect failed")?;
        if !resp.status().is_success() {
            bail!("SSE connect error {}", resp.status());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let Ok(bytes) = chunk else { break };
                buf.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = buf.find('\n') {
                    let line = buf[..pos].trim_end_matches('\r').to_string();
                    buf.drain(..=pos);
                    if let Some(data) = line.strip_prefix("data: ") {
                        if events_tx.send(data.trim().to_string()).is_err() {
                            return;
                        }
                    }
                }
            }
            warn!("SSE stream ended");
        });

        Ok(Self {
            client,
            url: url.to_string(),
            headers,
            events_rx,
        })
    }

    async fn send(&mut self, text: &str) -> anyhow::Result<()> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");
        for (k, v) in &self.headers {
            builder = builder.header(k, v);
        }
        let resp = builder
            .body(text.to_string())
            .send()
            .await
            .context("SSE post failed")?;
        if !resp.status().is_success() {
            bail!("SSE post error {}", resp.status());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        self.events_rx.recv().await.map(Ok)
    }
}

// ─── Test double ──────────────────────────────────────────────────────────────

#[cfg(test)]
pub struct MockLink {
    pub sent: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[cfg(test)]
impl MockLink {
    /// Returns (link, outbound-frames-receiver, inbound-frames-sender).
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedSender<String>,
    ) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                sent: sent_tx,
                inbound: in_rx,
            },
            sent_rx,
            in_tx,
        )
    }

    async fn send(&mut self, text: &str) -> anyhow::Result<()> {
        self.sent
            .send(text.to_string())
            .map_err(|_| anyhow::anyhow!("mock link closed"))
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        self.inbound.recv().await.map(Ok)
    }
}
