// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Wire shapes for the agent's emission modes.
//!
//! Step-streamed and token-streamed queries serialize one [`StreamRecord`]
//! per event; collected queries optionally carry a list of [`TraceStep`]s.
//! Field names and the terminal `is_final` record are part of the public
//! HTTP contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One server-sent event of a streamed query.
///
/// Exactly one of `thinking_step` / `token_chunk` is set on intermediate
/// records; terminal records set `is_final` and `result` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamRecord {
    pub thinking_step: Option<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_chunk: Option<TokenChunk>,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl StreamRecord {
    pub fn step(step: StepRecord) -> Self {
        Self {
            thinking_step: Some(step),
            token_chunk: None,
            is_final: false,
            result: None,
        }
    }

    pub fn token(chunk: TokenChunk) -> Self {
        Self {
            thinking_step: None,
            token_chunk: Some(chunk),
            is_final: false,
            result: None,
        }
    }

    pub fn final_result(result: impl Into<String>) -> Self {
        Self {
            thinking_step: None,
            token_chunk: None,
            is_final: true,
            result: Some(result.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    ToolCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Start,
    Complete,
}

/// One state transition of the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub id: String,
    pub status: StepStatus,
    /// Model reasoning text (`thinking` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool name (`tool_call` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Parsed tool arguments (`tool_call` steps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Tool result text (`tool_call` completion).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl StepRecord {
    pub fn thinking(id: &str, content: &str, status: StepStatus) -> Self {
        Self {
            kind: StepKind::Thinking,
            id: id.to_string(),
            status,
            content: Some(content.to_string()),
            tool: None,
            params: None,
            result: None,
        }
    }

    pub fn tool_start(id: &str, tool: &str, params: Value) -> Self {
        Self {
            kind: StepKind::ToolCall,
            id: id.to_string(),
            status: StepStatus::Start,
            content: None,
            tool: Some(tool.to_string()),
            params: Some(params),
            result: None,
        }
    }

    pub fn tool_complete(id: &str, tool: &str, params: Value, result: &str) -> Self {
        Self {
            kind: StepKind::ToolCall,
            id: id.to_string(),
            status: StepStatus::Complete,
            content: None,
            tool: Some(tool.to_string()),
            params: Some(params),
            result: Some(result.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Thinking,
    Content,
}

/// One model token from a token-streamed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenChunk {
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub content: String,
    /// Groups thinking tokens under the enclosing thinking step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_id: Option<String>,
}

/// One entry of a collected query's execution trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceStep {
    Thinking { content: String },
    ToolCall { tool: String, result: String },
}

/// Render a trace for debug logging.
pub fn format_execution_trace(trace: &[TraceStep]) -> String {
    trace
        .iter()
        .map(|step| match step {
            TraceStep::Thinking { content } => format!("Thinking: {content}"),
            TraceStep::ToolCall { tool, result } => format!("Tool {tool}: {result}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
