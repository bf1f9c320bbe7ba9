// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Public HTTP surface of the hub.
//!
//! Thin request/response endpoints over the orchestrator and the agent:
//!
//! | route                  | purpose                                        |
//! |------------------------|------------------------------------------------|
//! | `POST /register`       | attach a tool server (502 queues a reconnect)  |
//! | `POST /query`          | collected query, optional trace                |
//! | `POST /query_stream`   | SSE stream of agent steps (or tokens)          |
//! | `GET  /query_stream`   | same, query in the URL                         |
//! | `GET  /health`         | hub status and per-service health              |
//! | `GET  /service_info`   | details for one service                        |
//! | `POST /remove_service` | detach a service                               |
//!
//! All state is an explicit [`App`] value injected into the handlers; there
//! is no hidden singleton.

mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tracing::info;

use navet_core::{Orchestrator, ReactAgent};

/// Everything the handlers need.
pub struct App {
    pub orchestrator: Arc<Orchestrator>,
    pub agent: Arc<ReactAgent>,
    /// Persistent server file appended to on successful registration.
    /// `None` disables persistence (tests, ephemeral runs).
    pub servers_path: Option<PathBuf>,
}

/// Assemble the router over shared state.
pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/register", post(routes::register))
        .route("/query", post(routes::query))
        .route(
            "/query_stream",
            post(routes::query_stream_post).get(routes::query_stream_get),
        )
        .route("/health", get(routes::health))
        .route("/service_info", get(routes::service_info))
        .route("/remove_service", post(routes::remove_service))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

/// Bind and serve until the process is told to stop.
pub async fn serve(app: Arc<App>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "public HTTP surface listening");
    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
