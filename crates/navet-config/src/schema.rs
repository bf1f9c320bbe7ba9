// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Model endpoint configuration.
///
/// The hub talks to any OpenAI-compatible `/chat/completions` endpoint.
/// `provider: mock` selects the deterministic in-process provider and is only
/// useful for tests and demos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" (any OpenAI-compatible endpoint) | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or vLLM.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            name: "gpt-4o-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Timing knobs for the service lifecycle loops.  All values are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    /// Period of the background health-probe loop.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// A service whose last heartbeat is older than this is expired and
    /// queued for reconnection.  A heartbeat exactly this old is still fresh.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Period of the background reconnection loop.
    #[serde(default = "default_reconnection_interval")]
    pub reconnection_interval: u64,
    /// Deadline for each health-probe HTTP request.
    #[serde(default = "default_http_timeout")]
    pub http_timeout: u64,
}

fn default_heartbeat_interval() -> u64 {
    60
}
fn default_heartbeat_timeout() -> u64 {
    180
}
fn default_reconnection_interval() -> u64 {
    60
}
fn default_http_timeout() -> u64 {
    10
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            reconnection_interval: default_reconnection_interval(),
            http_timeout: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Upper bound on model calls per query; the loop always terminates.
    #[serde(default = "default_max_iterations")]
    pub react_max_iterations: u32,
    /// Record an execution trace for every collected query.
    #[serde(default)]
    pub react_enable_trace: bool,
}

fn default_max_iterations() -> u32 {
    25
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            react_max_iterations: default_max_iterations(),
            react_enable_trace: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Listen address of the public HTTP surface.
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:18200".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
