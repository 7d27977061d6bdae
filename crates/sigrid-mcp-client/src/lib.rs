// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod connection;
mod multiplexer;
mod rpc;
mod transport;

pub use connection::{ConnState, ConnectionHandle, HeaderProvider};
pub use multiplexer::{synthesized_name, McpMultiplexer, McpTool, McpToolInfo};
pub use rpc::{
    encode_notification, encode_request, encode_response, parse_incoming, Incoming, RpcError,
    JSONRPC_VERSION, PROTOCOL_VERSION,
};
pub use transport::{Headers, TransportLink};
