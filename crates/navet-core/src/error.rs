// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Why an attach failed.
///
/// The classification decides recovery: connect-class failures
/// ([`Unreachable`](AttachError::Unreachable) and
/// [`BadGateway`](AttachError::BadGateway)) go onto the pending-reconnect set
/// and surface as 502; everything else surfaces as 500 with no auto-retry.
#[derive(Debug, Error)]
pub enum AttachError {
    /// DNS / TCP connect / connect-timeout, after bounded retries.
    #[error("could not connect to service: {0}")]
    Unreachable(String),
    /// The target answered the stream request with 502.
    #[error("target service returned 502 Bad Gateway")]
    BadGateway,
    /// Any other HTTP status on the stream request.
    #[error("target service returned HTTP {0}")]
    HttpStatus(u16),
    /// Timeout during `initialize` or `list_tools` after the stream opened.
    #[error("protocol interaction timed out")]
    ProtocolTimeout,
    /// Anything else that broke session setup.
    #[error("service initialization or setup failed: {0}")]
    Setup(String),
}

impl AttachError {
    /// Connect-class failures are retried by the reconnection loop.
    pub fn is_connection_issue(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::BadGateway)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
