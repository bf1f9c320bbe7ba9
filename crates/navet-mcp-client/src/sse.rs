// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SSE JSON-RPC session transport.
//!
//! The server holds a long-lived `text/event-stream` response open.  Its
//! first frame is an `endpoint` event naming the HTTP endpoint that accepts
//! JSON-RPC request POSTs; responses come back asynchronously as `message`
//! frames on the stream.  A background reader task routes each response to
//! the oneshot slot registered under its request id.
//!
//! Dropping the session aborts the reader task and thereby the stream —
//! release happens on every exit path and never blocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{CallToolResult, ConnectError, SessionError, ToolDescriptor, ToolSession};

const PROTOCOL_VERSION: &str = "2024-11-05";

type PendingMap = Arc<Mutex<HashMap<i64, oneshot::Sender<Value>>>>;

/// A live session over one SSE stream.
pub struct SseSession {
    client: reqwest::Client,
    /// JSON-RPC POST endpoint announced by the server's `endpoint` frame.
    endpoint: String,
    timeout: Duration,
    next_id: AtomicI64,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

impl SseSession {
    /// Open the event stream and complete the endpoint handshake.
    ///
    /// `timeout` bounds the stream request, the handshake wait, and every
    /// subsequent request on the session.  Classification of failures here is
    /// the hub's retry boundary: [`ConnectError::Connect`] and
    /// [`ConnectError::Timeout`] are retryable, [`ConnectError::Status`] is
    /// not.
    pub async fn connect(
        url: &str,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        let send = client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send();
        let resp = match tokio::time::timeout(timeout, send).await {
            Err(_) => return Err(ConnectError::Timeout),
            Ok(Err(e)) => return Err(classify_connect_failure(e)),
            Ok(Ok(r)) => r,
        };
        if !resp.status().is_success() {
            return Err(ConnectError::Status(resp.status().as_u16()));
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(resp.bytes_stream(), pending.clone(), endpoint_tx));

        let announced = match tokio::time::timeout(timeout, endpoint_rx).await {
            Err(_) => {
                reader.abort();
                return Err(ConnectError::Timeout);
            }
            Ok(Err(_)) => {
                reader.abort();
                return Err(ConnectError::Connect(
                    "stream closed before endpoint announcement".to_string(),
                ));
            }
            Ok(Ok(path)) => path,
        };
        let endpoint = match resolve_endpoint(url, &announced) {
            Ok(e) => e,
            Err(e) => {
                reader.abort();
                return Err(ConnectError::Connect(e));
            }
        };
        debug!(url, endpoint = %endpoint, "SSE session established");

        Ok(Self {
            client,
            endpoint,
            timeout,
            next_id: AtomicI64::new(1),
            pending,
            reader,
        })
    }

    /// POST one JSON-RPC request and await its routed response.
    async fn request(&self, method: &str, params: Value) -> Result<Value, SessionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let posted = self.client.post(&self.endpoint).json(&body).send().await;
        match posted {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(SessionError::Transport(format!(
                    "endpoint returned HTTP {}",
                    resp.status()
                )));
            }
            Err(e) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(SessionError::Transport(e.to_string()));
            }
        }

        let reply = match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                return Err(SessionError::Timeout);
            }
            // The reader dropped our slot: stream ended.
            Ok(Err(_)) => return Err(SessionError::Closed),
            Ok(Ok(v)) => v,
        };

        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(SessionError::Protocol(err.to_string()));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    /// POST a JSON-RPC notification (no id, no response).
    async fn notify(&self, method: &str, params: Value) -> Result<(), SessionError> {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params });
        self.client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        Ok(())
    }
}

impl Drop for SseSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl ToolSession for SseSession {
    async fn initialize(&self) -> Result<(), SessionError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": { "name": "navet", "version": env!("CARGO_PKG_VERSION") },
            }),
        )
        .await?;
        self.notify("notifications/initialized", json!({})).await
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, SessionError> {
        let result = self.request("tools/list", json!({})).await?;
        serde_json::from_value(result.get("tools").cloned().unwrap_or(Value::Null))
            .map_err(|e| SessionError::Protocol(format!("malformed tools/list result: {e}")))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, SessionError> {
        let result = self
            .request("tools/call", json!({ "name": name, "arguments": arguments }))
            .await?;
        serde_json::from_value(result)
            .map_err(|e| SessionError::Protocol(format!("malformed tools/call result: {e}")))
    }
}

fn classify_connect_failure(e: reqwest::Error) -> ConnectError {
    if e.is_timeout() {
        ConnectError::Timeout
    } else {
        ConnectError::Connect(e.to_string())
    }
}

/// Resolve the announced endpoint against the stream URL.  Servers send
/// either an absolute URL or a path like `/messages?session_id=…`.
fn resolve_endpoint(base: &str, announced: &str) -> Result<String, String> {
    let base = url::Url::parse(base).map_err(|e| format!("invalid stream URL {base:?}: {e}"))?;
    base.join(announced)
        .map(|u| u.to_string())
        .map_err(|e| format!("invalid endpoint announcement {announced:?}: {e}"))
}

// ─── Stream reading ───────────────────────────────────────────────────────────

async fn read_loop<S, B>(stream: S, pending: PendingMap, endpoint_tx: oneshot::Sender<String>)
where
    S: Stream<Item = Result<B, reqwest::Error>>,
    B: AsRef<[u8]>,
{
    let mut stream = std::pin::pin!(stream);
    let mut parser = SseFrameParser::default();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "SSE stream error; closing session");
                break;
            }
        };
        for frame in parser.push(&String::from_utf8_lossy(bytes.as_ref())) {
            match frame.event.as_str() {
                "endpoint" => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(frame.data);
                    }
                }
                "message" => route_message(&pending, &frame.data),
                other => debug!(event = other, "ignoring SSE event"),
            }
        }
    }

    // Stream ended: drop all pending slots so in-flight requests observe
    // Closed instead of hanging until their deadline.
    pending.lock().unwrap().clear();
}

fn route_message(pending: &PendingMap, data: &str) {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "discarding unparseable message frame");
            return;
        }
    };
    let Some(id) = v.get("id").and_then(Value::as_i64) else {
        // Server-initiated notification; this client has none to handle.
        debug!("ignoring message frame without id");
        return;
    };
    let slot = pending.lock().unwrap().remove(&id);
    match slot {
        Some(tx) => {
            let _ = tx.send(v);
        }
        None => warn!(id, "response for unknown request id"),
    }
}

/// Incremental SSE frame parser.
///
/// Frames are `event:`/`data:` field lines terminated by a blank line; a
/// frame may arrive split across TCP chunks, so complete lines are consumed
/// and the tail stays buffered.
#[derive(Default)]
struct SseFrameParser {
    buf: String,
    event: Option<String>,
    data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SseFrame {
    event: String,
    data: String,
}

impl SseFrameParser {
    fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buf.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line = self.buf[..nl].trim_end_matches('\r').to_string();
            self.buf = self.buf[nl + 1..].to_string();

            if line.is_empty() {
                if self.event.is_some() || !self.data.is_empty() {
                    frames.push(SseFrame {
                        event: self
                            .event
                            .take()
                            .unwrap_or_else(|| "message".to_string()),
                        data: std::mem::take(&mut self.data),
                    });
                }
                continue;
            }
            if let Some(v) = line.strip_prefix("event:") {
                self.event = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(v.strip_prefix(' ').unwrap_or(v));
            }
            // id:, retry:, and comment lines carry nothing this client uses.
        }
        frames
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
