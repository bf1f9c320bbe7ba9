// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! End-to-end tests for [`SseSession`] against an in-process fake MCP server.
//!
//! The fake speaks the real wire protocol: a `GET /sse` stream whose first
//! frame announces the message endpoint, and a `POST /messages` endpoint that
//! pushes JSON-RPC responses back over the stream.  This exercises the full
//! handshake, response routing, error mapping, and timeout paths exactly as a
//! live tool server would.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use navet_mcp_client::{ConnectError, SessionError, SseSession, ToolSession};

// ── Fake MCP server ───────────────────────────────────────────────────────────

#[derive(Clone, Default)]
struct ServerState {
    /// Sender half of the live SSE connection, installed by the GET handler.
    tx: Arc<Mutex<Option<tokio::sync::mpsc::Sender<String>>>>,
}

async fn sse_handler(
    State(st): State<ServerState>,
) -> Sse<impl futures::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(16);
    *st.tx.lock().unwrap() = Some(tx);

    let endpoint =
        futures::stream::once(async { Ok(Event::default().event("endpoint").data("/messages")) });
    let messages =
        ReceiverStream::new(rx).map(|body| Ok(Event::default().event("message").data(body)));
    Sse::new(endpoint.chain(messages))
}

async fn messages_handler(State(st): State<ServerState>, Json(req): Json<Value>) -> StatusCode {
    let id = req["id"].clone();
    let method = req["method"].as_str().unwrap_or("");

    let response = match method {
        "initialize" => Some(json!({
            "jsonrpc": "2.0", "id": id,
            "result": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": { "name": "fake-weather", "version": "0.0.0" }
            }
        })),
        "tools/list" => Some(json!({
            "jsonrpc": "2.0", "id": id,
            "result": {
                "tools": [{
                    "name": "get_weather",
                    "description": "Weather lookup",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "city": { "type": "string" } },
                        "required": ["city"]
                    }
                }]
            }
        })),
        "tools/call" => {
            let name = req["params"]["name"].as_str().unwrap_or("");
            match name {
                "boom" => Some(json!({
                    "jsonrpc": "2.0", "id": id,
                    "error": { "code": -32000, "message": "kaboom" }
                })),
                // Never answered; exercises the request deadline.
                "slow" => None,
                _ => {
                    let city = req["params"]["arguments"]["city"].as_str().unwrap_or("?");
                    Some(json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {
                            "content": [{ "type": "text", "text": format!("sunny in {city}") }],
                            "isError": false
                        }
                    }))
                }
            }
        }
        // notifications/initialized and anything else: accepted, no reply.
        _ => None,
    };

    if let Some(resp) = response {
        let tx = st.tx.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(resp.to_string()).await;
        }
    }
    StatusCode::ACCEPTED
}

async fn bad_gateway() -> StatusCode {
    StatusCode::BAD_GATEWAY
}

async fn spawn_server() -> SocketAddr {
    let app = Router::new()
        .route("/sse", get(sse_handler))
        .route("/messages", post(messages_handler))
        .route("/broken/sse", get(bad_gateway))
        .with_state(ServerState::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_list_and_call() {
    let addr = spawn_server().await;
    let url = format!("http://{addr}/sse");
    let session = SseSession::connect(&url, client(), Duration::from_secs(5))
        .await
        .unwrap();

    session.initialize().await.unwrap();

    let tools = session.list_tools().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "get_weather");
    assert_eq!(tools[0].input_schema["type"], "object");

    let result = session
        .call_tool("get_weather", json!({ "city": "beijing" }))
        .await
        .unwrap();
    assert_eq!(result.first_text(), Some("sunny in beijing"));
    assert!(!result.is_error);
}

#[tokio::test]
async fn json_rpc_error_maps_to_protocol_error() {
    let addr = spawn_server().await;
    let url = format!("http://{addr}/sse");
    let session = SseSession::connect(&url, client(), Duration::from_secs(5))
        .await
        .unwrap();
    session.initialize().await.unwrap();

    let err = session.call_tool("boom", json!({})).await.unwrap_err();
    match err {
        SessionError::Protocol(msg) => assert!(msg.contains("kaboom"), "got: {msg}"),
        other => panic!("expected protocol error, got {other:?}"),
    }
}

#[tokio::test]
async fn unanswered_request_hits_deadline() {
    let addr = spawn_server().await;
    let url = format!("http://{addr}/sse");
    let session = SseSession::connect(&url, client(), Duration::from_millis(300))
        .await
        .unwrap();
    session.initialize().await.unwrap();

    let err = session.call_tool("slow", json!({})).await.unwrap_err();
    assert!(matches!(err, SessionError::Timeout), "got {err:?}");
}

#[tokio::test]
async fn refused_connection_is_connect_class() {
    // Port 1 is never listening.
    let result = SseSession::connect(
        "http://127.0.0.1:1/sse",
        client(),
        Duration::from_secs(2),
    )
    .await;
    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert!(
        matches!(err, ConnectError::Connect(_) | ConnectError::Timeout),
        "got {err:?}"
    );
}

#[tokio::test]
async fn http_status_is_not_connect_class() {
    let addr = spawn_server().await;
    let result = SseSession::connect(
        &format!("http://{addr}/broken/sse"),
        client(),
        Duration::from_secs(2),
    )
    .await;
    let err = match result {
        Err(e) => e,
        Ok(_) => panic!("expected an error"),
    };
    assert!(matches!(err, ConnectError::Status(502)), "got {err:?}");
}

#[tokio::test]
async fn two_sessions_do_not_cross_route() {
    // Two independent servers and sessions; responses must never leak
    // between streams because each session owns its own pending map.
    let a = spawn_server().await;
    let b = spawn_server().await;
    let sa = SseSession::connect(&format!("http://{a}/sse"), client(), Duration::from_secs(5))
        .await
        .unwrap();
    let sb = SseSession::connect(&format!("http://{b}/sse"), client(), Duration::from_secs(5))
        .await
        .unwrap();
    sa.initialize().await.unwrap();
    sb.initialize().await.unwrap();

    let (ra, rb) = tokio::join!(
        sa.call_tool("get_weather", json!({ "city": "oslo" })),
        sb.call_tool("get_weather", json!({ "city": "lund" })),
    );
    assert_eq!(ra.unwrap().first_text(), Some("sunny in oslo"));
    assert_eq!(rb.unwrap().first_text(), Some("sunny in lund"));
}
