// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, StreamEvent};

/// Lazy, cancellable sequence of [`StreamEvent`]s.
///
/// Dropping the stream aborts the underlying transport; no events are
/// emitted after the drop.
pub type EventStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// A streaming LLM transport.
///
/// Adapters (Anthropic direct, AWS Bedrock, Google Vertex, Foundry) share
/// this interface; their differences are hidden behind the authentication
/// closure injected at construction.  Transient transport and rate-limit
/// failures are retried inside the implementation — a stream handed to the
/// caller has already survived request admission.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Human-readable provider name for status display.
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_name(&self) -> &str;

    /// Send a completion request and return the event stream.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<EventStream>;
}
