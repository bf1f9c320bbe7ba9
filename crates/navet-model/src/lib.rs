// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Chat-completions model layer for the navet hub.
//!
//! The agent loop depends only on the [`ModelProvider`] trait: one
//! `complete` call per reasoning step, returning a stream of
//! [`ResponseEvent`]s.  The OpenAI-compatible driver covers every hosted or
//! local endpoint that speaks the `/chat/completions` wire format; the mock
//! providers exist for deterministic tests.

pub mod mock;
mod openai_compat;
mod provider;
mod types;

use std::sync::Arc;

pub use openai_compat::OpenAICompatProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use types::{
    CompletionRequest, FunctionCall, Message, MessageContent, ResponseEvent, Role, ToolSchema,
};

/// Build a provider from configuration.
///
/// `provider: openai` selects the OpenAI-compatible driver (the `base_url`
/// override makes it speak to any compatible endpoint); `provider: mock`
/// selects the echoing mock.  The API key is resolved from `api_key` first,
/// then from the `api_key_env` environment variable.
pub fn from_config(cfg: &navet_config::ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match cfg.provider.as_str() {
        "mock" => Ok(Arc::new(mock::MockProvider)),
        "openai" => {
            let api_key = cfg
                .api_key
                .clone()
                .or_else(|| cfg.api_key_env.as_ref().and_then(|v| std::env::var(v).ok()));
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            Ok(Arc::new(OpenAICompatProvider::new(
                "openai",
                cfg.name.clone(),
                api_key,
                &base_url,
                cfg.max_tokens,
                cfg.temperature,
            )))
        }
        other => anyhow::bail!("unknown model provider {other:?} (expected \"openai\" or \"mock\")"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
