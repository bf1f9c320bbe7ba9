// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool advertised by a server's `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Declared parameter schema.  Servers are free to report anything here;
    /// the registry normalizes it into an object schema before the model
    /// ever sees it.
    #[serde(rename = "inputSchema", default = "empty_object")]
    pub input_schema: Value,
}

fn empty_object() -> Value {
    serde_json::json!({})
}

/// Result of a `tools/call` invocation.
///
/// `content` is kept as raw JSON blocks: callers extract the text of the
/// first block and treat any other shape as "unexpected format", so a typed
/// enum would only obscure that contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<Value>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Text of the first content block, when the block is `{"type":"text",…}`
    /// shaped (any object carrying a string `text` field qualifies).
    pub fn first_text(&self) -> Option<&str> {
        self.content.first()?.get("text")?.as_str()
    }

    /// Convenience constructor for tests and fakes.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![serde_json::json!({ "type": "text", "text": text.into() })],
            is_error: false,
        }
    }
}

/// Failure of an operation on an established session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The per-request deadline elapsed.
    #[error("request timed out")]
    Timeout,
    /// The server answered with a JSON-RPC error or an unparseable payload.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The HTTP POST carrying the request failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// The event stream ended; the session is gone.
    #[error("session closed")]
    Closed,
}

/// Failure while *opening* the event stream.  This classification is the
/// retry boundary: connect-class failures are retried by the hub, an HTTP
/// status is not.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// DNS / TCP connect failure.
    #[error("could not connect: {0}")]
    Connect(String),
    /// Connect attempt exceeded its deadline.
    #[error("connect timed out")]
    Timeout,
    /// The server answered the stream request with a non-success status.
    #[error("server returned HTTP {0}")]
    Status(u16),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
