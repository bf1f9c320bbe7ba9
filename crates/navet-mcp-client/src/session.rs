// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::Value;

use crate::{CallToolResult, SessionError, ToolDescriptor};

/// Capability over an opened tool-server transport.
///
/// `initialize` must be invoked before `list_tools` or `call_tool`.  All
/// three operations carry the session's request deadline.  Dropping the
/// session releases the underlying stream; release never blocks.
#[async_trait]
pub trait ToolSession: Send + Sync {
    /// Perform the protocol handshake.
    async fn initialize(&self) -> Result<(), SessionError>;

    /// The tool manifest this server advertises.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, SessionError>;

    /// Invoke one tool with a JSON argument object.
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult, SessionError>;
}
