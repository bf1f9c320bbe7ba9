// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{error, info, warn};

use navet_core::events::StreamRecord;

use crate::App;

// ── Request shapes ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub url: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub include_trace: bool,
    #[serde(default)]
    pub stream: bool,
}

fn default_mode() -> String {
    "react".to_string()
}

#[derive(Debug, Deserialize)]
pub struct StreamQueryRequest {
    pub query: String,
    /// Emit model output at token granularity instead of one record per step.
    #[serde(default)]
    pub tokens: bool,
}

#[derive(Debug, Deserialize)]
pub struct StreamQueryParams {
    pub query: Option<String>,
    #[serde(default)]
    pub tokens: bool,
}

#[derive(Debug, Deserialize)]
pub struct ServiceQuery {
    pub url: String,
}

// ── /register ─────────────────────────────────────────────────────────────────

pub async fn register(
    State(app): State<Arc<App>>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let name = if req.name.is_empty() {
        derive_service_name(&req.url)
    } else {
        req.name.clone()
    };
    info!(url = %req.url, service = %name, "received registration request");

    match app.orchestrator.register_service(&req.url, &name).await {
        Ok(message) => {
            if let Some(path) = &app.servers_path {
                if let Err(e) = navet_config::servers::add_server(path, &name, &req.url) {
                    warn!(error = %e, "could not persist server registration");
                }
            }
            (
                StatusCode::OK,
                Json(json!({ "status": "success", "message": message })),
            )
                .into_response()
        }
        Err(e) => {
            error!(url = %req.url, error = %e, "registration failed");
            let status = if e.is_connection_issue() {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(json!({ "detail": e.to_string() }))).into_response()
        }
    }
}

/// Default display name when the caller omits one: the second-to-last
/// URL segment, i.e. the host part of a canonical `http://host:port/sse`.
fn derive_service_name(url: &str) -> String {
    let parts: Vec<&str> = url.split('/').collect();
    if parts.len() >= 2 {
        parts[parts.len() - 2].to_string()
    } else {
        url.to_string()
    }
}

// ── /query ────────────────────────────────────────────────────────────────────

pub async fn query(State(app): State<Arc<App>>, Json(req): Json<QueryRequest>) -> Response {
    info!(mode = %req.mode, "received query request");
    if req.stream {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "For streaming responses, please use the /query_stream endpoint"
            })),
        )
            .into_response();
    }

    let (result, trace) = match req.mode.as_str() {
        "standard" => (app.agent.process_query_standard(&req.query).await, None),
        _ if req.include_trace => {
            let (result, trace) = app.agent.process_query_with_trace(&req.query).await;
            (result, Some(trace))
        }
        _ => (app.agent.process_query(&req.query).await.0, None),
    };

    if result.starts_with("Error:") {
        error!(result = %result, "error processing query");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "detail": result })),
        )
            .into_response();
    }

    let mut body = json!({ "result": result });
    if let Some(trace) = trace {
        if !trace.is_empty() {
            body["execution_trace"] = serde_json::to_value(&trace).unwrap_or(Value::Null);
        }
    }
    (StatusCode::OK, Json(body)).into_response()
}

// ── /query_stream ─────────────────────────────────────────────────────────────

pub async fn query_stream_post(
    State(app): State<Arc<App>>,
    Json(req): Json<StreamQueryRequest>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!("received streaming query");
    stream_response(app, Some(req.query), req.tokens)
}

/// GET variant for EventSource clients.  A missing `query` parameter yields
/// a single terminal error record rather than an HTTP failure, so browser
/// stream consumers always get a well-formed event sequence.
pub async fn query_stream_get(
    State(app): State<Arc<App>>,
    Query(params): Query<StreamQueryParams>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!("received GET streaming query");
    stream_response(app, params.query, params.tokens)
}

fn stream_response(
    app: Arc<App>,
    query: Option<String>,
    tokens: bool,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (tx, rx) = mpsc::channel::<StreamRecord>(64);
    match query {
        None => {
            warn!("streaming query request without query parameter");
            let _ = tx.try_send(StreamRecord::final_result(
                "Error: Missing required query parameter",
            ));
        }
        Some(q) => {
            let agent = app.agent.clone();
            tokio::spawn(async move {
                if tokens {
                    agent.stream_query_tokens(&q, tx).await;
                } else {
                    agent.stream_query(&q, tx).await;
                }
            });
        }
    }
    Sse::new(ReceiverStream::new(rx).map(|record| Event::default().json_data(&record)))
}

// ── /health ───────────────────────────────────────────────────────────────────

pub async fn health(State(app): State<Arc<App>>) -> Json<Value> {
    let registry = app.orchestrator.registry();
    let services: Vec<Value> = registry
        .all_service_urls()
        .into_iter()
        .filter_map(|url| {
            let details = registry.service_details(&url)?;
            let healthy = app.orchestrator.is_service_healthy(&url);
            Some(json!({
                "url": details.url,
                "name": details.name,
                "last_heartbeat": details.last_heartbeat,
                "status": if healthy { "healthy" } else { "unhealthy" },
            }))
        })
        .collect();

    Json(json!({
        "orchestrator_status": "running",
        "active_services": registry.session_count(),
        "total_tools": registry.tool_count(),
        "pending_reconnection_count": app.orchestrator.pending_count(),
        "react_enabled": true,
        "connected_services_details": services,
    }))
}

// ── /service_info ─────────────────────────────────────────────────────────────

pub async fn service_info(
    State(app): State<Arc<App>>,
    Query(params): Query<ServiceQuery>,
) -> Response {
    info!(url = %params.url, "received service info request");
    match app.orchestrator.registry().service_details(&params.url) {
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": format!("Service not found: {}", params.url) })),
        )
            .into_response(),
        Some(details) => {
            let healthy = app.orchestrator.is_service_healthy(&params.url);
            let mut service = serde_json::to_value(&details).unwrap_or(Value::Null);
            service["status"] = json!(if healthy { "healthy" } else { "unhealthy" });
            (StatusCode::OK, Json(json!({ "service": service }))).into_response()
        }
    }
}

// ── /remove_service ───────────────────────────────────────────────────────────

pub async fn remove_service(
    State(app): State<Arc<App>>,
    Query(params): Query<ServiceQuery>,
) -> Response {
    info!(url = %params.url, "received remove service request");
    let registry = app.orchestrator.registry();
    let Some(details) = registry.service_details(&params.url) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": format!("Service not found: {}", params.url) })),
        )
            .into_response();
    };

    let name = details.name.clone();
    app.orchestrator.disconnect_service(&params.url);
    (
        StatusCode::OK,
        Json(json!({
            "status": "success",
            "message": format!("Service {name} successfully removed"),
            "service": serde_json::to_value(&details).unwrap_or(Value::Null),
        })),
    )
        .into_response()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
