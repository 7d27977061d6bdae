// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! JSON-RPC 2.0 framing.
//!
//! Requests carry monotonically increasing integer ids scoped to one
//! connection.  Outbound WebSocket messages additionally carry a `uuid`
//! extension field that drives the replay protocol on reconnect.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A parsed inbound message.
#[derive(Debug, Clone)]
pub enum Incoming {
    Response {
        id: i64,
        result: Result<Value, RpcError>,
    },
    Request {
        id: i64,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

/// Serialize an outbound request.  `uuid` is attached as a top-level
/// extension field when the transport participates in replay (WebSocket).
pub fn encode_request(id: i64, method: &str, params: &Value, uuid: Option<&str>) -> String {
    let mut msg = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(u) = uuid {
        msg["uuid"] = json!(u);
    }
    msg.to_string()
}

pub fn encode_notification(method: &str, params: &Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params,
    })
    .to_string()
}

pub fn encode_response(id: i64, result: &Value) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
    .to_string()
}

pub fn encode_error_response(id: i64, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    })
    .to_string()
}

/// Parse one inbound line/frame.
///
/// A frame that is not JSON, lacks the version marker, or is shaped like
/// none of request/response/notification is a protocol violation.
pub fn parse_incoming(text: &str) -> anyhow::Result<Incoming> {
    let v: Value = serde_json::from_str(text)
        .map_err(|e| anyhow::anyhow!("protocol violation: invalid JSON frame: {e}"))?;
    if v["jsonrpc"].as_str() != Some(JSONRPC_VERSION) {
        anyhow::bail!("protocol violation: missing jsonrpc version marker");
    }

    let id = v.get("id").and_then(|i| i.as_i64());
    let method = v.get("method").and_then(|m| m.as_str());

    match (id, method) {
        (Some(id), Some(method)) => Ok(Incoming::Request {
            id,
            method: method.to_string(),
            params: v.get("params").cloned().unwrap_or(Value::Null),
        }),
        (None, Some(method)) => Ok(Incoming::Notification {
            method: method.to_string(),
            params: v.get("params").cloned().unwrap_or(Value::Null),
        }),
        (Some(id), None) => {
            if let Some(err) = v.get("error") {
                let rpc_err: RpcError = serde_json::from_value(err.clone())
                    .map_err(|e| anyhow::anyhow!("protocol violation: malformed error: {e}"))?;
                Ok(Incoming::Response {
                    id,
                    result: Err(rpc_err),
                })
            } else {
                Ok(Incoming::Response {
                    id,
                    result: Ok(v.get("result").cloned().unwrap_or(Value::Null)),
                })
            }
        }
        (None, None) => anyhow::bail!("protocol violation: frame is neither request nor response"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
