// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tool-server session layer.
//!
//! A tool server is a long-lived process reached over a server-sent-event
//! transport carrying bidirectional JSON-RPC.  Opening the stream yields a
//! [`ToolSession`]: a capability offering exactly three operations —
//! `initialize`, `list_tools`, `call_tool` — all bounded by a per-request
//! deadline.  The hub stores sessions as trait objects so tests can substitute
//! in-memory fakes for the wire transport.

pub mod mock;
mod session;
mod sse;
mod types;

pub use session::ToolSession;
pub use sse::SseSession;
pub use types::{CallToolResult, ConnectError, SessionError, ToolDescriptor};
