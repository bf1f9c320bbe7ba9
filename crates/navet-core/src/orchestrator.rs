// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Connection lifecycle: attach, detach, heartbeat, auto-reconnect.
//!
//! # Attach
//!
//! Opening the stream is retried up to three times with a one-second backoff,
//! but only for connect-class failures — a protocol error or timeout after
//! the stream is open is not retried here; the reconnection loop owns the
//! long tail.  Each phase (open, initialize, list_tools) is bounded by a
//! 30-second deadline.
//!
//! # Heartbeat
//!
//! One background task snapshots the registry each period.  Services whose
//! last heartbeat is older than `heartbeat_timeout` are expired: detached and
//! queued for reconnection.  Everything else gets one `GET <url>/health`
//! probe; a 2xx refreshes the timestamp, anything else is only logged.  A
//! single failed probe never expires a service — expiry is time-based, so a
//! brief network blip does not cost a reconnection cycle.
//!
//! # Reconnect
//!
//! A second task retries every pending URL once per period, concurrently.
//! Success removes the URL from the pending set inside the attach itself; no
//! extra backoff is applied across ticks, the interval is the backoff.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use navet_config::HubConfig;
use navet_mcp_client::{ConnectError, SessionError, SseSession, ToolSession};

use crate::{prompts, AttachError, ServiceEntry, ServiceRegistry, ToolDef};

/// Deadline for each attach phase: stream open, initialize, list_tools.
const ATTACH_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_RETRIES: u32 = 3;
const CONNECT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Opens sessions.  The production implementation dials SSE; tests inject
/// scripted sessions through [`StaticConnector`].
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn ToolSession>, ConnectError>;
}

/// Production connector: one [`SseSession`] per attach.
///
/// Owns a dedicated HTTP client with **no** global request deadline — the
/// event stream must outlive any single request, so only per-operation
/// deadlines apply.
pub struct SseConnector {
    client: reqwest::Client,
}

impl SseConnector {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for SseConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionConnector for SseConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn ToolSession>, ConnectError> {
        let session = SseSession::connect(url, self.client.clone(), ATTACH_TIMEOUT).await?;
        Ok(Arc::new(session))
    }
}

pub struct Orchestrator {
    registry: Arc<ServiceRegistry>,
    connector: Arc<dyn SessionConnector>,
    /// Shared bounded HTTP client for health probes.
    http: reqwest::Client,
    config: HubConfig,
    /// URLs awaiting reconnection.  Disjoint from attached URLs immediately
    /// after every successful attach.
    pending: Mutex<HashSet<String>>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        connector: Arc<dyn SessionConnector>,
        http: reqwest::Client,
        config: HubConfig,
    ) -> Self {
        Self {
            registry,
            connector,
            http,
            config,
            pending: Mutex::new(HashSet::new()),
            monitors: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    fn pending_lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.pending_lock().iter().cloned().collect();
        urls.sort();
        urls
    }

    pub fn pending_count(&self) -> usize {
        self.pending_lock().len()
    }

    pub fn pending_contains(&self, url: &str) -> bool {
        self.pending_lock().contains(url)
    }

    // ── Attach / detach ───────────────────────────────────────────────────────

    /// Connect to a tool server and install its tools.
    ///
    /// A URL that is already attached is detached first — re-attach is
    /// detach-then-attach, never an in-place mutation.  On success the URL is
    /// removed from the pending-reconnect set and a human-readable summary of
    /// the installed tools is returned.
    pub async fn connect_service(&self, url: &str, name: &str) -> Result<String, AttachError> {
        let display_name = if name.is_empty() { url } else { name };

        if self.registry.session_for(url).is_some() {
            warn!(service = display_name, url, "already registered; reconnecting");
            self.disconnect_service(url);
        }

        info!(service = display_name, url, "attempting to connect");
        let session = self.open_stream_with_retry(url, display_name).await?;

        match tokio::time::timeout(ATTACH_TIMEOUT, session.initialize()).await {
            Ok(Ok(())) => debug!(service = display_name, "session initialized"),
            Ok(Err(SessionError::Timeout)) | Err(_) => return Err(AttachError::ProtocolTimeout),
            Ok(Err(e)) => return Err(AttachError::Setup(e.to_string())),
        }

        let descriptors = match tokio::time::timeout(ATTACH_TIMEOUT, session.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(SessionError::Timeout)) | Err(_) => return Err(AttachError::ProtocolTimeout),
            Ok(Err(e)) => return Err(AttachError::Setup(e.to_string())),
        };

        let tools: Vec<ToolDef> = descriptors
            .into_iter()
            .map(|d| ToolDef {
                description: prompts::enhance_tool_description(&d.description, &d.name),
                name: d.name,
                parameters: d.input_schema,
            })
            .collect();

        let added = self.registry.add(url, session, tools, display_name);
        self.pending_lock().remove(url);
        info!(service = display_name, url, "connected; removed from pending reconnection");

        let added_list = if added.is_empty() {
            "none".to_string()
        } else {
            added.join(", ")
        };
        Ok(format!("Connection successful. Added tools: {added_list}"))
    }

    /// [`connect_service`](Self::connect_service) plus the registration
    /// policy: connect-class failures are queued for auto-reconnect.
    pub async fn register_service(&self, url: &str, name: &str) -> Result<String, AttachError> {
        match self.connect_service(url, name).await {
            Ok(msg) => Ok(msg),
            Err(e) => {
                if e.is_connection_issue() {
                    info!(url, "adding service to auto-reconnect list");
                    self.pending_lock().insert(url.to_string());
                }
                Err(e)
            }
        }
    }

    /// Remove the service's routing.  The underlying stream is released when
    /// the last session handle drops; removal itself never blocks on it.
    pub fn disconnect_service(&self, url: &str) -> Option<ServiceEntry> {
        info!(url, "removing service from active registry");
        self.registry.remove(url)
    }

    async fn open_stream_with_retry(
        &self,
        url: &str,
        display_name: &str,
    ) -> Result<Arc<dyn ToolSession>, AttachError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let connect = self.connector.connect(url);
            let outcome = match tokio::time::timeout(ATTACH_TIMEOUT, connect).await {
                Ok(r) => r,
                Err(_) => Err(ConnectError::Timeout),
            };
            match outcome {
                Ok(session) => return Ok(session),
                Err(e @ (ConnectError::Connect(_) | ConnectError::Timeout))
                    if attempt < CONNECT_RETRIES =>
                {
                    warn!(
                        service = display_name,
                        attempt,
                        max = CONNECT_RETRIES,
                        error = %e,
                        "connection failed; retrying"
                    );
                    tokio::time::sleep(CONNECT_RETRY_BACKOFF).await;
                }
                Err(ConnectError::Connect(e)) => return Err(AttachError::Unreachable(e)),
                Err(ConnectError::Timeout) => {
                    return Err(AttachError::Unreachable("connect timed out".to_string()))
                }
                Err(ConnectError::Status(502)) => return Err(AttachError::BadGateway),
                Err(ConnectError::Status(code)) => return Err(AttachError::HttpStatus(code)),
            }
        }
    }

    // ── Health ────────────────────────────────────────────────────────────────

    /// A URL is healthy iff it is attached and its last heartbeat is within
    /// the configured timeout.
    pub fn is_service_healthy(&self, url: &str) -> bool {
        match self.registry.last_heartbeat(url) {
            Some(last) => heartbeat_fresh(last, Utc::now(), self.heartbeat_timeout()),
            None => false,
        }
    }

    /// Capability handed to the agent driver, so it can consult health at
    /// tool-dispatch time without holding a reference back to the hub.
    pub fn health_checker(self: &Arc<Self>) -> crate::HealthCheck {
        let this = Arc::clone(self);
        Arc::new(move |url: &str| this.is_service_healthy(url))
    }

    fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.heartbeat_timeout as i64)
    }

    /// One heartbeat cycle: expire stale services, then probe the rest.
    ///
    /// Expiries are applied before any probe is awaited; an expired URL is
    /// never probed in the same tick.
    pub async fn heartbeat_tick(&self) {
        debug!("running periodic health checks");
        let now = Utc::now();
        let timeout = self.heartbeat_timeout();

        let mut expired = Vec::new();
        let mut live = Vec::new();
        for url in self.registry.all_service_urls() {
            match self.registry.last_heartbeat(&url) {
                Some(last) if heartbeat_fresh(last, now, timeout) => live.push(url),
                Some(last) => {
                    warn!(url = %url, last = %last, "service heartbeat timed out; disconnecting");
                    self.pending_lock().insert(url.clone());
                    expired.push(url);
                }
                None => {
                    warn!(url = %url, "missing heartbeat record for active service; disconnecting");
                    self.pending_lock().insert(url.clone());
                    expired.push(url);
                }
            }
        }

        for url in &expired {
            self.disconnect_service(url);
        }

        join_all(live.iter().map(|url| self.probe_health(url))).await;

        debug!(
            active = self.registry.session_count(),
            pending = self.pending_count(),
            "health check cycle complete"
        );
    }

    /// One `GET <url>/health` probe.  Success refreshes the heartbeat;
    /// failures are logged and otherwise ignored.
    async fn probe_health(&self, url: &str) {
        let probe_url = health_url(url);
        match self.http.get(&probe_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.registry.update_health(url);
                debug!(url = %probe_url, "health check succeeded");
            }
            Ok(resp) => {
                warn!(url = %probe_url, status = %resp.status(), "health check failed");
            }
            Err(e) if e.is_timeout() => warn!(url = %probe_url, "health check timed out"),
            Err(e) => warn!(url = %probe_url, error = %e, "health check network error"),
        }
    }

    // ── Reconnection ──────────────────────────────────────────────────────────

    /// One reconnection cycle: retry every pending URL concurrently.  A
    /// successful attach removes the URL from the set; failures stay for the
    /// next tick.
    pub async fn reconnect_tick(&self) {
        let urls = self.pending_urls();
        if urls.is_empty() {
            return;
        }
        info!(count = urls.len(), ?urls, "attempting to reconnect services");

        let results = join_all(urls.iter().map(|url| self.connect_service(url, ""))).await;
        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(_) => info!(url = %url, "reconnection successful"),
                Err(e) => warn!(url = %url, error = %e, "reconnection attempt failed"),
            }
        }
    }

    // ── Background monitors ───────────────────────────────────────────────────

    /// Spawn the heartbeat and reconnection loops.  Idempotent per process
    /// lifetime: meant to be called once at startup.
    pub fn start_monitoring(self: &Arc<Self>) {
        let heartbeat_period = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let reconnect_period = Duration::from_secs(self.config.reconnection_interval.max(1));
        info!(
            heartbeat_interval = heartbeat_period.as_secs(),
            reconnection_interval = reconnect_period.as_secs(),
            "starting hub monitors"
        );

        let this = Arc::clone(self);
        let heartbeat = tokio::spawn(async move {
            loop {
                tokio::time::sleep(heartbeat_period).await;
                this.heartbeat_tick().await;
            }
        });

        let this = Arc::clone(self);
        let reconnect = tokio::spawn(async move {
            loop {
                tokio::time::sleep(reconnect_period).await;
                this.reconnect_tick().await;
            }
        });

        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        monitors.push(heartbeat);
        monitors.push(reconnect);
    }

    /// Cancel the background loops.  Attached sessions stay routable; their
    /// streams close when the registry (and its session handles) drop.
    pub fn shutdown(&self) {
        let mut monitors = self.monitors.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in monitors.drain(..) {
            handle.abort();
        }
        info!("hub monitors stopped");
    }
}

/// Freshness predicate for heartbeat expiry.  Boundary-inclusive: a
/// heartbeat exactly `timeout` old is still fresh.
pub fn heartbeat_fresh(
    last: DateTime<Utc>,
    now: DateTime<Utc>,
    timeout: chrono::Duration,
) -> bool {
    now.signed_duration_since(last) <= timeout
}

/// Probe endpoint for a server URL: `<url>/health` with duplicate slashes
/// collapsed.
fn health_url(server_url: &str) -> String {
    format!("{}/health", server_url.trim_end_matches('/'))
}

// ─── Test connector ───────────────────────────────────────────────────────────

/// Scripted connect outcome for [`StaticConnector`].
#[derive(Clone)]
pub enum StaticOutcome {
    Session(Arc<dyn ToolSession>),
    /// TCP-level refusal.
    Unreachable,
    /// HTTP 502 from the stream request.
    GatewayError,
    /// Any other HTTP status.
    HttpError(u16),
}

/// Table-driven [`SessionConnector`] for tests: each URL maps to a scripted
/// outcome, swappable at runtime to model servers that die and come back.
#[derive(Default)]
pub struct StaticConnector {
    outcomes: Mutex<std::collections::HashMap<String, StaticOutcome>>,
    attempts: Mutex<std::collections::HashMap<String, u32>>,
}

impl StaticConnector {
    pub fn set(&self, url: &str, outcome: StaticOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), outcome);
    }

    /// How many times `connect` was called for `url`.
    pub fn attempts(&self, url: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SessionConnector for StaticConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn ToolSession>, ConnectError> {
        *self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(url.to_string())
            .or_insert(0) += 1;
        let outcome = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned();
        match outcome {
            Some(StaticOutcome::Session(s)) => Ok(s),
            Some(StaticOutcome::Unreachable) | None => {
                Err(ConnectError::Connect("connection refused".to_string()))
            }
            Some(StaticOutcome::GatewayError) => Err(ConnectError::Status(502)),
            Some(StaticOutcome::HttpError(code)) => Err(ConnectError::Status(code)),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
