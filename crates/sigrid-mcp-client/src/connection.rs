// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! One actor task per MCP connection.
//!
//! The actor owns the transport link, the pending-request table, and (for
//! WebSocket) the replay ring buffer.  The public API submits work through
//! a command channel; nothing outside the actor touches the link.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use sigrid_config::{McpServerConfig, McpTransportKind};

use crate::rpc::{
    encode_error_response, encode_notification, encode_request, encode_response, parse_incoming,
    Incoming,
};
use crate::transport::{Headers, HttpLink, SseLink, StdioLink, TransportLink, WsLink};

/// Ring-buffer capacity for the WebSocket replay protocol.
const OUTBOX_CAPACITY: usize = 1000;
const RECONNECT_MAX_ATTEMPTS: u32 = 3;
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

/// Headers provider consulted on each connect and outbound HTTP request.
pub type HeaderProvider = Arc<dyn Fn(&str) -> Headers + Send + Sync>;

enum ConnCmd {
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<anyhow::Result<Value>>,
    },
    Notify {
        method: String,
        params: Value,
    },
    Close,
}

/// Cheap cloneable handle to a connection actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub server_name: String,
    cmd_tx: mpsc::Sender<ConnCmd>,
}

impl ConnectionHandle {
    /// Issue an RPC and await its response.
    pub async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnCmd::Request {
                method: method.to_string(),
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))?;
        reply_rx
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))?
    }

    pub async fn notify(&self, method: &str, params: Value) -> anyhow::Result<()> {
        self.cmd_tx
            .send(ConnCmd::Notify {
                method: method.to_string(),
                params,
            })
            .await
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    pub async fn close(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Close).await;
    }
}

struct SentRecord {
    uuid: String,
    text: String,
}

/// Messages after the server's acked uuid, in order.  Nothing is replayed
/// when the server gave no ack or the acked uuid has already rotated out
/// of the ring.
fn replay_after<'a>(outbox: &'a VecDeque<SentRecord>, acked: Option<&str>) -> Vec<&'a SentRecord> {
    let Some(acked) = acked else { return Vec::new() };
    let Some(pos) = outbox.iter().position(|r| r.uuid == acked) else {
        warn!(acked, "acked request id not in outbox; skipping replay");
        return Vec::new();
    };
    outbox.iter().skip(pos + 1).collect()
}

/// Exponential reconnect backoff capped at 30 s.
fn reconnect_delay(attempt: u32) -> Duration {
    let d = RECONNECT_BASE.saturating_mul(1u32 << attempt.min(10));
    d.min(RECONNECT_CAP)
}

struct ConnectionActor {
    name: String,
    config: McpServerConfig,
    headers: HeaderProvider,
    state: ConnState,
    link: Option<TransportLink>,
    next_id: i64,
    pending: HashMap<i64, oneshot::Sender<anyhow::Result<Value>>>,
    outbox: VecDeque<SentRecord>,
    last_sent_uuid: Option<String>,
}

enum Event {
    Cmd(Option<ConnCmd>),
    Link(Option<anyhow::Result<String>>),
    Ping,
}

/// Connect to the server and spawn its actor.
pub async fn spawn_connection(
    name: &str,
    config: McpServerConfig,
    headers: HeaderProvider,
) -> anyhow::Result<ConnectionHandle> {
    let mut actor = ConnectionActor {
        name: name.to_string(),
        config,
        headers,
        state: ConnState::Idle,
        link: None,
        next_id: 0,
        pending: HashMap::new(),
        outbox: VecDeque::new(),
        last_sent_uuid: None,
    };
    actor.connect().await?;
    Ok(spawn_actor(actor))
}

fn spawn_actor(actor: ConnectionActor) -> ConnectionHandle {
    let name = actor.name.clone();
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    tokio::spawn(actor.run(cmd_rx));
    ConnectionHandle {
        server_name: name,
        cmd_tx,
    }
}

async fn recv_link(link: Option<&mut TransportLink>) -> Option<anyhow::Result<String>> {
    match link {
        Some(l) => l.recv().await,
        None => futures_util::future::pending().await,
    }
}

impl ConnectionActor {
    fn is_ws(&self) -> bool {
        self.config.transport == McpTransportKind::Websocket
    }

    fn endpoint(&self, scheme_check: &[&str]) -> anyhow::Result<String> {
        let raw = self
            .config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("{:?} transport requires 'url'", self.config.transport))?;
        let parsed = url::Url::parse(raw).with_context(|| format!("invalid url '{raw}'"))?;
        if !scheme_check.contains(&parsed.scheme()) {
            anyhow::bail!(
                "unsupported scheme '{}' for {:?} transport",
                parsed.scheme(),
                self.config.transport
            );
        }
        Ok(raw.to_string())
    }

    async fn connect(&mut self) -> anyhow::Result<()> {
        self.state = ConnState::Connecting;
        let headers = (self.headers)(&self.name);
        let link = match self.config.transport {
            McpTransportKind::Stdio => {
                TransportLink::Stdio(StdioLink::spawn(&self.config, &HashMap::new())?)
            }
            McpTransportKind::Websocket => {
                let url = self.endpoint(&["ws", "wss"])?;
                let ws = WsLink::connect(&url, &headers, self.last_sent_uuid.as_deref()).await?;
                TransportLink::Ws(ws)
            }
            McpTransportKind::Http => {
                let url = self.endpoint(&["http", "https"])?;
                TransportLink::Http(HttpLink::new(&url, headers))
            }
            McpTransportKind::Sse => {
                let url = self.endpoint(&["http", "https"])?;
                TransportLink::Sse(SseLink::connect(&url, headers).await?)
            }
        };
        self.link = Some(link);
        self.state = ConnState::Connected;
        Ok(())
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ConnCmd>) {
        let ping_every = Duration::from_secs(self.config.ping_interval_secs.max(1));
        let mut ping = tokio::time::interval(ping_every);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; swallow it.
        ping.tick().await;
        let want_ping = self.is_ws();

        loop {
            let event = {
                let link = self.link.as_mut();
                tokio::select! {
                    cmd = cmd_rx.recv() => Event::Cmd(cmd),
                    msg = recv_link(link) => Event::Link(msg),
                    _ = ping.tick(), if want_ping => Event::Ping,
                }
            };

            match event {
                Event::Cmd(None) | Event::Cmd(Some(ConnCmd::Close)) => {
                    self.state = ConnState::Closing;
                    if let Some(link) = &mut self.link {
                        link.close().await;
                    }
                    self.fail_pending("connection closed");
                    self.state = ConnState::Closed;
                    debug!(server = %self.name, "connection closed");
                    return;
                }
                Event::Cmd(Some(ConnCmd::Request {
                    method,
                    params,
                    reply,
                })) => {
                    self.send_request(&method, params, Some(reply)).await;
                }
                Event::Cmd(Some(ConnCmd::Notify { method, params })) => {
                    let text = encode_notification(&method, &params);
                    if let Err(e) = self.send_text(&text).await {
                        warn!(server = %self.name, error = %e, "notification send failed");
                    }
                }
                Event::Link(Some(Ok(text))) => self.handle_incoming(&text).await,
                Event::Link(Some(Err(e))) => {
                    warn!(server = %self.name, error = %e, "transport error");
                    if !self.reconnect().await {
                        return;
                    }
                }
                Event::Link(None) => {
                    warn!(server = %self.name, "transport closed by peer");
                    if !self.reconnect().await {
                        return;
                    }
                }
                Event::Ping => {
                    if self.state == ConnState::Connected {
                        // Fire-and-forget keepalive; the response resolves a
                        // pending entry whose receiver is already gone.
                        self.send_request("ping", json!({}), None).await;
                    }
                }
            }
        }
    }

    async fn send_request(
        &mut self,
        method: &str,
        params: Value,
        reply: Option<oneshot::Sender<anyhow::Result<Value>>>,
    ) {
        self.next_id += 1;
        let id = self.next_id;
        let uuid = if self.is_ws() {
            Some(uuid::Uuid::new_v4().to_string())
        } else {
            None
        };
        let text = encode_request(id, method, &params, uuid.as_deref());

        if let Some(reply) = reply {
            self.pending.insert(id, reply);
        } else {
            // Keepalive: park a sender whose receiver is dropped.
            let (tx, _) = oneshot::channel();
            self.pending.insert(id, tx);
        }

        if let Some(u) = uuid {
            if self.outbox.len() == OUTBOX_CAPACITY {
                self.outbox.pop_front();
            }
            self.outbox.push_back(SentRecord {
                uuid: u.clone(),
                text: text.clone(),
            });
            self.last_sent_uuid = Some(u);
        }

        if let Err(e) = self.send_text(&text).await {
            warn!(server = %self.name, error = %e, "request send failed");
            if !self.is_ws() {
                // No replay protocol: fail the request immediately.
                if let Some(tx) = self.pending.remove(&id) {
                    let _ = tx.send(Err(e));
                }
            } else {
                let _ = self.reconnect().await;
            }
        }
    }

    async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
        match &mut self.link {
            Some(link) => link.send(text).await,
            None => Err(anyhow::anyhow!("not connected")),
        }
    }

    async fn handle_incoming(&mut self, text: &str) {
        let incoming = match parse_incoming(text) {
            Ok(i) => i,
            Err(e) => {
                warn!(server = %self.name, error = %e, "dropping malformed frame");
                return;
            }
        };
        match incoming {
            Incoming::Response { id, result } => {
                if let Some(tx) = self.pending.remove(&id) {
                    let _ = tx.send(result.map_err(|e| {
                        anyhow::anyhow!("rpc error {}: {}", e.code, e.message)
                    }));
                } else {
                    debug!(server = %self.name, id, "response for unknown request id");
                }
            }
            Incoming::Request { id, method, .. } => {
                let reply = if method == "ping" {
                    encode_response(id, &json!({}))
                } else {
                    encode_error_response(id, -32601, "method not found")
                };
                if let Err(e) = self.send_text(&reply).await {
                    warn!(server = %self.name, error = %e, "reply send failed");
                }
            }
            Incoming::Notification { method, params } => match method.as_str() {
                "notifications/cancelled" => {
                    if let Some(id) = params.get("requestId").and_then(|v| v.as_i64()) {
                        if let Some(tx) = self.pending.remove(&id) {
                            let _ = tx.send(Err(anyhow::anyhow!("cancelled by server")));
                        }
                    }
                }
                other => debug!(server = %self.name, method = other, "ignoring notification"),
            },
        }
    }

    /// Reconnect with capped exponential backoff.  Returns false when the
    /// connection is finally closed (actor should exit).
    async fn reconnect(&mut self) -> bool {
        match self.config.transport {
            // Request/response transports retry the next request instead.
            McpTransportKind::Http | McpTransportKind::Sse => {
                self.state = ConnState::Closed;
                self.link = None;
                self.fail_pending("connection closed");
                return false;
            }
            McpTransportKind::Stdio | McpTransportKind::Websocket => {}
        }

        self.state = ConnState::Reconnecting;
        self.link = None;

        for attempt in 0..RECONNECT_MAX_ATTEMPTS {
            let delay = reconnect_delay(attempt);
            debug!(server = %self.name, attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;

            match self.connect().await {
                Ok(()) => {
                    if self.is_ws() {
                        // Replay messages the server never saw, exactly once,
                        // in the original order.
                        let acked = match &self.link {
                            Some(TransportLink::Ws(ws)) => ws.acked_request_id.clone(),
                            _ => None,
                        };
                        let to_send: Vec<String> = replay_after(&self.outbox, acked.as_deref())
                            .into_iter()
                            .map(|r| r.text.clone())
                            .collect();
                        debug!(server = %self.name, count = to_send.len(), "replaying after reconnect");
                        for text in to_send {
                            if let Err(e) = self.send_text(&text).await {
                                warn!(server = %self.name, error = %e, "replay send failed");
                                break;
                            }
                        }
                    }
                    return true;
                }
                Err(e) => {
                    warn!(server = %self.name, attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        self.state = ConnState::Closed;
        self.fail_pending("connection closed");
        false
    }

    fn fail_pending(&mut self, reason: &str) {
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(anyhow::anyhow!("{reason}")));
        }
    }
}

// ─── Test constructor ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) fn spawn_with_link(name: &str, link: TransportLink) -> ConnectionHandle {
    let actor = ConnectionActor {
        name: name.to_string(),
        config: McpServerConfig {
            transport: McpTransportKind::Http,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: Some("http://mock".into()),
            ping_interval_secs: 3600,
        },
        headers: Arc::new(|_| Vec::new()),
        state: ConnState::Connected,
        link: Some(link),
        next_id: 0,
        pending: HashMap::new(),
        outbox: VecDeque::new(),
        last_sent_uuid: None,
    };
    spawn_actor(actor)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockLink;

    fn record(uuid: &str) -> SentRecord {
        SentRecord {
            uuid: uuid.into(),
            text: format!("msg-{uuid}"),
        }
    }

    // ── replay_after ──────────────────────────────────────────────────────────

    #[test]
    fn replays_exactly_the_messages_after_the_acked_uuid() {
        let outbox: VecDeque<SentRecord> =
            ["u1", "u2", "u3", "u4", "u5"].iter().map(|u| record(u)).collect();
        let replay = replay_after(&outbox, Some("u3"));
        let uuids: Vec<&str> = replay.iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(uuids, vec!["u4", "u5"]);
    }

    #[test]
    fn replay_preserves_order() {
        let outbox: VecDeque<SentRecord> =
            ["a", "b", "c"].iter().map(|u| record(u)).collect();
        let replay = replay_after(&outbox, Some("a"));
        assert_eq!(replay[0].uuid, "b");
        assert_eq!(replay[1].uuid, "c");
    }

    #[test]
    fn no_ack_means_no_replay() {
        let outbox: VecDeque<SentRecord> = ["a", "b"].iter().map(|u| record(u)).collect();
        assert!(replay_after(&outbox, None).is_empty());
    }

    #[test]
    fn unknown_ack_means_no_replay() {
        let outbox: VecDeque<SentRecord> = ["a", "b"].iter().map(|u| record(u)).collect();
        assert!(replay_after(&outbox, Some("zz")).is_empty());
    }

    #[test]
    fn ack_of_last_message_replays_nothing() {
        let outbox: VecDeque<SentRecord> = ["a", "b"].iter().map(|u| record(u)).collect();
        assert!(replay_after(&outbox, Some("b")).is_empty());
    }

    // ── reconnect backoff ─────────────────────────────────────────────────────

    #[test]
    fn reconnect_backoff_is_exponential_and_capped() {
        assert_eq!(reconnect_delay(0), Duration::from_secs(1));
        assert_eq!(reconnect_delay(1), Duration::from_secs(2));
        assert_eq!(reconnect_delay(2), Duration::from_secs(4));
        assert_eq!(reconnect_delay(10), Duration::from_secs(30));
        assert_eq!(reconnect_delay(30), Duration::from_secs(30));
    }

    // ── Actor behaviour (mock link) ───────────────────────────────────────────

    #[tokio::test]
    async fn request_response_preserves_id_exactly() {
        let (link, mut sent_rx, in_tx) = MockLink::pair();
        let handle = spawn_with_link("mock", TransportLink::Mock(link));

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request("tools/list", json!({})).await }
        });

        let frame = sent_rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["method"], "tools/list");
        let id = v["id"].as_i64().unwrap();

        in_tx
            .send(format!(
                r#"{{"jsonrpc":"2.0","id":{id},"result":{{"tools":[]}}}}"#
            ))
            .unwrap();

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result["tools"], json!([]));
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let (link, mut sent_rx, in_tx) = MockLink::pair();
        let handle = spawn_with_link("mock", TransportLink::Mock(link));

        for expected in 1..=3i64 {
            let h = handle.clone();
            let req = tokio::spawn(async move { h.request("ping", json!({})).await });
            let frame = sent_rx.recv().await.unwrap();
            let v: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(v["id"].as_i64().unwrap(), expected);
            in_tx
                .send(format!(r#"{{"jsonrpc":"2.0","id":{expected},"result":{{}}}}"#))
                .unwrap();
            req.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn inbound_ping_is_answered() {
        let (link, mut sent_rx, in_tx) = MockLink::pair();
        let _handle = spawn_with_link("mock", TransportLink::Mock(link));

        in_tx
            .send(r#"{"jsonrpc":"2.0","id":77,"method":"ping"}"#.to_string())
            .unwrap();
        let frame = sent_rx.recv().await.unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["id"], 77);
        assert!(v.get("result").is_some());
    }

    #[tokio::test]
    async fn cancelled_notification_fails_pending_request() {
        let (link, mut sent_rx, in_tx) = MockLink::pair();
        let handle = spawn_with_link("mock", TransportLink::Mock(link));

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request("tools/call", json!({"name": "slow"})).await }
        });
        let frame = sent_rx.recv().await.unwrap();
        let id = serde_json::from_str::<Value>(&frame).unwrap()["id"]
            .as_i64()
            .unwrap();

        in_tx
            .send(format!(
                r#"{{"jsonrpc":"2.0","method":"notifications/cancelled","params":{{"requestId":{id}}}}}"#
            ))
            .unwrap();

        let result = pending.await.unwrap();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cancelled"));
    }

    #[tokio::test]
    async fn close_fails_pending_with_connection_closed() {
        let (link, mut sent_rx, _in_tx) = MockLink::pair();
        let handle = spawn_with_link("mock", TransportLink::Mock(link));

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request("resources/list", json!({})).await }
        });
        let _ = sent_rx.recv().await.unwrap();
        handle.close().await;

        let result = pending.await.unwrap();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("connection closed"));
    }

    #[tokio::test]
    async fn rpc_error_surfaces_code_and_message() {
        let (link, mut sent_rx, in_tx) = MockLink::pair();
        let handle = spawn_with_link("mock", TransportLink::Mock(link));

        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.request("prompts/get", json!({})).await }
        });
        let frame = sent_rx.recv().await.unwrap();
        let id = serde_json::from_str::<Value>(&frame).unwrap()["id"]
            .as_i64()
            .unwrap();
        in_tx
            .send(format!(
                r#"{{"jsonrpc":"2.0","id":{id},"error":{{"code":-32602,"message":"bad params"}}}}"#
            ))
            .unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("-32602"));
        assert!(err.to_string().contains("bad params"));
    }
}
