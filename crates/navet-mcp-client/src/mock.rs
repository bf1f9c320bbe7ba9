// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-memory [`ToolSession`] fake for tests.
//!
//! Shipped as a regular module (not `cfg(test)`) so downstream crates can
//! drive the hub and agent against scripted tool servers without a network.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::{CallToolResult, SessionError, ToolDescriptor, ToolSession};

/// How the fake answers the `initialize` handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitBehavior {
    #[default]
    Succeed,
    /// Protocol-level refusal.
    Refuse,
    /// The handshake never completes within its deadline.
    TimeOut,
}

/// Scripted tool session: a fixed manifest plus canned per-tool results.
pub struct MockToolSession {
    tools: Vec<ToolDescriptor>,
    /// Canned result text per tool name.  A missing entry echoes the call
    /// arguments back, which is usually enough for routing tests.
    results: HashMap<String, String>,
    /// Canned full results, for exercising non-text content shapes.
    raw_results: HashMap<String, CallToolResult>,
    /// Tool names whose invocation fails with a transport error.
    failing: Vec<String>,
    pub init_behavior: InitBehavior,
    /// Every `call_tool` made against this session, in order.
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl MockToolSession {
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self {
            tools,
            results: HashMap::new(),
            raw_results: HashMap::new(),
            failing: Vec::new(),
            init_behavior: InitBehavior::Succeed,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Descriptor helper with an object schema declaring one string property.
    pub fn tool(name: &str, description: &str, property: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": { property: { "type": "string" } },
                "required": [property]
            }),
        }
    }

    pub fn with_result(mut self, tool: &str, text: &str) -> Self {
        self.results.insert(tool.to_string(), text.to_string());
        self
    }

    /// Canned full [`CallToolResult`], e.g. a non-text content block.
    pub fn with_raw_result(mut self, tool: &str, result: CallToolResult) -> Self {
        self.raw_results.insert(tool.to_string(), result);
        self
    }

    /// Make invocations of `tool` fail with a transport error.
    pub fn with_failing(mut self, tool: &str) -> Self {
        self.failing.push(tool.to_string());
        self
    }

    pub fn with_init_behavior(mut self, behavior: InitBehavior) -> Self {
        self.init_behavior = behavior;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolSession for MockToolSession {
    async fn initialize(&self) -> Result<(), SessionError> {
        match self.init_behavior {
            InitBehavior::Succeed => Ok(()),
            InitBehavior::Refuse => Err(SessionError::Protocol("initialize refused".into())),
            InitBehavior::TimeOut => Err(SessionError::Timeout),
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, SessionError> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, SessionError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));
        if self.failing.iter().any(|t| t == name) {
            return Err(SessionError::Transport(format!("{name} exploded")));
        }
        if let Some(raw) = self.raw_results.get(name) {
            return Ok(raw.clone());
        }
        let text = self
            .results
            .get(name)
            .cloned()
            .unwrap_or_else(|| arguments.to_string());
        Ok(CallToolResult::text(text))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
