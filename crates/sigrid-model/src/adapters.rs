// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter construction for the hosted provider endpoints.
//!
//! All four adapters (Anthropic direct, AWS Bedrock, Google Vertex, Foundry)
//! speak the same streaming message protocol; they differ in base URL and in
//! the authentication headers.  Each constructor here builds an
//! [`AnthropicClient`] with the appropriate header closure.  Credential
//! *minting* (SigV4 signing, OAuth2 token exchange) is an external
//! collaborator's job — the closures read already-minted material from the
//! environment.

use std::sync::Arc;

use anyhow::{bail, Context};

use sigrid_config::{ProviderAdapter, ProviderConfig};

use crate::{anthropic::AnthropicClient, ProviderClient};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Build the provider client selected by config + environment.
pub fn build_provider(cfg: &ProviderConfig) -> anyhow::Result<Arc<dyn ProviderClient>> {
    let base_url = cfg
        .base_url
        .clone()
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let max_output_tokens = cfg.max_output_tokens.unwrap_or(8192);

    let (name, headers): (&str, crate::anthropic::HeaderFn) = match cfg.adapter {
        ProviderAdapter::Direct => {
            let key = resolve_api_key(cfg).context("no API key configured")?;
            (
                "anthropic",
                Arc::new(move || {
                    vec![
                        ("x-api-key".to_string(), key.clone()),
                        ("anthropic-version".to_string(), API_VERSION.to_string()),
                    ]
                }),
            )
        }
        ProviderAdapter::Bedrock => {
            // Bedrock API keys are pre-minted bearer tokens; full SigV4
            // request signing lives outside the core runtime.
            let token = std::env::var("AWS_BEARER_TOKEN_BEDROCK")
                .context("AWS_BEARER_TOKEN_BEDROCK not set")?;
            (
                "bedrock",
                Arc::new(move || {
                    vec![(
                        "authorization".to_string(),
                        format!("Bearer {token}"),
                    )]
                }),
            )
        }
        ProviderAdapter::Vertex => {
            // OAuth2 access token minted by the ambient gcloud credential
            // chain before the process starts.
            let token = std::env::var("GOOGLE_VERTEX_ACCESS_TOKEN")
                .context("GOOGLE_VERTEX_ACCESS_TOKEN not set")?;
            (
                "vertex",
                Arc::new(move || {
                    vec![(
                        "authorization".to_string(),
                        format!("Bearer {token}"),
                    )]
                }),
            )
        }
        ProviderAdapter::Foundry => {
            let key =
                std::env::var("FOUNDRY_API_KEY").context("FOUNDRY_API_KEY not set")?;
            (
                "foundry",
                Arc::new(move || vec![("api-key".to_string(), key.clone())]),
            )
        }
    };

    if cfg.model.is_empty() {
        bail!("provider.model must be set");
    }

    Ok(Arc::new(AnthropicClient::new(
        name,
        cfg.model.clone(),
        base_url,
        max_output_tokens,
        cfg.retry.clone(),
        cfg.cache_system_prompt,
        cfg.cache_tools,
        headers,
    )))
}

/// Key resolution order: explicit config value, configured env var,
/// `ANTHROPIC_API_KEY`.
fn resolve_api_key(cfg: &ProviderConfig) -> Option<String> {
    if let Some(k) = &cfg.api_key {
        return Some(k.clone());
    }
    if let Some(var) = &cfg.api_key_env {
        if let Ok(k) = std::env::var(var) {
            return Some(k);
        }
    }
    std::env::var("ANTHROPIC_API_KEY").ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
