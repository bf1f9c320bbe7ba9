// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Service registry: the index of attached tool servers.
//!
//! Four maps live under one mutex and move together: `url → session`,
//! `url → last heartbeat`, `tool name → definition`, `tool name → owner url`.
//! Tool names are globally unique across all attached services; on conflict
//! the first writer wins and the newcomer's tool is skipped.  Removing a
//! service atomically removes every tool it owns.
//!
//! No method suspends.  Callers in async context hold the lock for a handful
//! of map operations at most.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use navet_mcp_client::ToolSession;

/// A tool as installed in the registry and advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDef {
    pub name: String,
    pub description: String,
    /// Always an object-typed JSON Schema; see [`normalize_parameters`].
    pub parameters: Value,
}

/// An attached service: the opaque session handle plus the attributes the
/// hub assigned at attach time.
#[derive(Clone)]
pub struct ServiceEntry {
    pub session: Arc<dyn ToolSession>,
    pub url: String,
    pub name: String,
}

/// Details of one service as reported by the public surface.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDetails {
    pub url: String,
    pub name: String,
    pub tools: Vec<String>,
    pub tool_count: usize,
    pub last_heartbeat: String,
    pub connected: bool,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<String, ServiceEntry>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    tool_defs: HashMap<String, ToolDef>,
    /// tool name → owning service URL.  Owner URLs are always present in
    /// `sessions`; removal keeps the two in lockstep.
    tool_owners: HashMap<String, String>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    state: Mutex<RegistryState>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a service and its tools.  Returns the names actually added;
    /// names already owned by another service are skipped.
    ///
    /// The caller detaches first on re-attach; if it did not, the stale
    /// entry is removed here so the four maps never diverge.
    pub fn add(
        &self,
        url: &str,
        session: Arc<dyn ToolSession>,
        tools: Vec<ToolDef>,
        name: &str,
    ) -> Vec<String> {
        let mut state = self.state();
        if state.sessions.contains_key(url) {
            warn!(url, "adding already registered service; replacing");
            remove_locked(&mut state, url);
        }

        let display_name = if name.is_empty() { url } else { name };
        state.sessions.insert(
            url.to_string(),
            ServiceEntry {
                session,
                url: url.to_string(),
                name: display_name.to_string(),
            },
        );
        state.heartbeats.insert(url.to_string(), Utc::now());

        let mut added = Vec::new();
        for tool in tools {
            if state.tool_defs.contains_key(&tool.name) {
                warn!(
                    tool = %tool.name,
                    service = display_name,
                    url,
                    "tool name conflict; keeping existing owner and skipping this tool"
                );
                continue;
            }
            let def = ToolDef {
                name: tool.name,
                description: tool.description,
                parameters: normalize_parameters(tool.parameters),
            };
            state.tool_owners.insert(def.name.clone(), url.to_string());
            added.push(def.name.clone());
            state.tool_defs.insert(def.name.clone(), def);
        }
        debug!(service = display_name, url, tools = ?added, "service added");
        added
    }

    /// Remove a service and every tool it owns.  Idempotent: removing an
    /// unknown URL returns `None` and changes nothing.
    pub fn remove(&self, url: &str) -> Option<ServiceEntry> {
        let mut state = self.state();
        let entry = remove_locked(&mut state, url);
        if entry.is_none() {
            warn!(url, "attempted to remove unknown service");
        }
        entry
    }

    pub fn session_for(&self, url: &str) -> Option<ServiceEntry> {
        self.state().sessions.get(url).cloned()
    }

    pub fn session_for_tool(&self, tool_name: &str) -> Option<ServiceEntry> {
        let state = self.state();
        let owner = state.tool_owners.get(tool_name)?;
        state.sessions.get(owner).cloned()
    }

    /// Snapshot of every installed tool, safe to iterate without the lock.
    pub fn all_tools(&self) -> Vec<ToolDef> {
        let state = self.state();
        let mut tools: Vec<ToolDef> = state.tool_defs.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Names of the tools owned by one service.
    pub fn tools_for_service(&self, url: &str) -> Vec<String> {
        let state = self.state();
        let mut names: Vec<String> = state
            .tool_owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == url)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Record a heartbeat.  No-op for unknown URLs; only attached services
    /// accrue freshness.
    pub fn update_health(&self, url: &str) {
        let mut state = self.state();
        if state.sessions.contains_key(url) {
            state.heartbeats.insert(url.to_string(), Utc::now());
            debug!(url, "heartbeat recorded");
        }
    }

    pub fn last_heartbeat(&self, url: &str) -> Option<DateTime<Utc>> {
        self.state().heartbeats.get(url).copied()
    }

    pub fn service_details(&self, url: &str) -> Option<ServiceDetails> {
        let name = self.session_for(url)?.name;
        let tools = self.tools_for_service(url);
        Some(ServiceDetails {
            url: url.to_string(),
            name,
            tool_count: tools.len(),
            tools,
            last_heartbeat: self
                .last_heartbeat(url)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "N/A".to_string()),
            connected: true,
        })
    }

    pub fn all_service_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self.state().sessions.keys().cloned().collect();
        urls.sort();
        urls
    }

    pub fn tool_count(&self) -> usize {
        self.state().tool_defs.len()
    }

    pub fn session_count(&self) -> usize {
        self.state().sessions.len()
    }
}

fn remove_locked(state: &mut RegistryState, url: &str) -> Option<ServiceEntry> {
    let entry = state.sessions.remove(url)?;
    state.heartbeats.remove(url);

    let owned: Vec<String> = state
        .tool_owners
        .iter()
        .filter(|(_, owner)| owner.as_str() == url)
        .map(|(name, _)| name.clone())
        .collect();
    for name in &owned {
        state.tool_defs.remove(name);
        state.tool_owners.remove(name);
    }
    debug!(url, tools = ?owned, "service removed");
    Some(entry)
}

/// Coerce a declared parameter schema into an object-typed JSON Schema.
///
/// The model-facing function-calling API requires `{"type":"object",…}`.
/// Anything else is wrapped: the original value becomes `properties` and its
/// top-level keys become `required`.
pub fn normalize_parameters(params: Value) -> Value {
    let is_object_schema = params
        .as_object()
        .map(|m| m.get("type").and_then(Value::as_str) == Some("object"))
        .unwrap_or(false);
    if is_object_schema {
        return params;
    }
    let required: Vec<Value> = params
        .as_object()
        .map(|m| m.keys().cloned().map(Value::String).collect())
        .unwrap_or_default();
    serde_json::json!({
        "type": "object",
        "properties": params,
        "required": required,
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
