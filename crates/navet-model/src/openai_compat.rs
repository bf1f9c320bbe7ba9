// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion driver.
//!
//! Every hosted or local endpoint that speaks the `/chat/completions` wire
//! format (OpenAI, Groq, vLLM, llama.cpp, LiteLLM proxies, …) is covered by
//! this single driver; the base URL and auth are configuration.
//!
//! Streaming responses arrive as SSE `data:` lines.  A single event may be
//! split across multiple TCP packets, so parsing maintains a carry-over line
//! buffer and only complete `\n`-terminated lines are interpreted.

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::{provider::ResponseStream, CompletionRequest, ResponseEvent, Role};

/// OpenAI-compatible chat completion provider.
pub struct OpenAICompatProvider {
    /// Provider id returned by `ModelProvider::name()`.
    driver_name: &'static str,
    /// Model id forwarded to the API.
    model: String,
    /// API key (pre-resolved from config or env).  `None` → no auth header,
    /// which is what local servers expect.
    api_key: Option<String>,
    /// Full chat completions URL, e.g. `https://api.openai.com/v1/chat/completions`.
    chat_url: String,
    max_tokens: u32,
    temperature: f32,
    client: reqwest::Client,
}

impl OpenAICompatProvider {
    /// Construct a provider from an API base that ends **before**
    /// `/chat/completions`, e.g. `https://api.openai.com/v1`.
    pub fn new(
        driver_name: &'static str,
        model: String,
        api_key: Option<String>,
        base_url: &str,
        max_tokens: Option<u32>,
        temperature: Option<f32>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            driver_name,
            model,
            api_key,
            chat_url: format!("{base}/chat/completions"),
            max_tokens: max_tokens.unwrap_or(4096),
            temperature: temperature.unwrap_or(0.2),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl crate::ModelProvider for OpenAICompatProvider {
    fn name(&self) -> &str {
        self.driver_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<ResponseStream> {
        let messages = build_openai_messages(&req.messages);

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": req.stream,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.driver_name,
            model = %self.model,
            tool_count = tools.len(),
            message_count = req.messages.len(),
            stream = req.stream,
            "sending completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.driver_name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.driver_name);
        }

        if !req.stream {
            // Single JSON body; synthesize the streaming event sequence.
            let body: Value = resp.json().await.context("parsing completion body")?;
            let events: Vec<anyhow::Result<ResponseEvent>> =
                events_from_response_body(&body).into_iter().map(Ok).collect();
            return Ok(Box::pin(futures::stream::iter(events)));
        }

        let byte_stream = resp.bytes_stream();
        // SSE events can be split across multiple TCP packets.  Maintain a
        // line buffer across chunks; emit events only for complete lines.
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<ResponseEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn role_str(r: &Role) -> &'static str {
    match r {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

/// Serialize the conversation into OpenAI wire messages.
///
/// Assistant tool-call turns become `{"content": null, "tool_calls": […]}`;
/// tool results become `{"role": "tool", "tool_call_id": …, "content": …}`.
fn build_openai_messages(messages: &[crate::Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| match &m.content {
            crate::MessageContent::Text(t) => json!({
                "role": role_str(&m.role),
                "content": t,
            }),
            crate::MessageContent::ToolCall {
                tool_call_id,
                function,
            } => json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": tool_call_id,
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "arguments": function.arguments,
                    }
                }]
            }),
            crate::MessageContent::ToolResult {
                tool_call_id,
                content,
            } => json!({
                "role": "tool",
                "tool_call_id": tool_call_id,
                "content": content,
            }),
        })
        .collect()
}

/// Parse a single complete SSE `data:` line into a [`ResponseEvent`].
///
/// Returns `None` for empty lines, comment lines, or unparseable data.
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<ResponseEvent>> {
    let data = line.strip_prefix("data: ")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ResponseEvent::Done));
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v).map(Ok)
}

/// Drain all complete `\n`-terminated SSE lines from `buf`.
///
/// Any trailing incomplete line (bytes not yet terminated by `\n`) is left
/// in `buf` so it can be extended by the next TCP chunk.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<ResponseEvent>> {
    let mut events = Vec::new();
    while let Some(nl_pos) = buf.find('\n') {
        // Strip the optional Windows-style \r before \n.
        let line = buf[..nl_pos].trim_end_matches('\r').to_string();
        // Advance buffer past the consumed line including the \n.
        *buf = buf[nl_pos + 1..].to_string();
        if let Some(ev) = parse_sse_data_line(&line) {
            events.push(ev);
        }
    }
    events
}

/// Interpret one streaming chunk object.  Returns `None` for chunks that
/// carry nothing the agent consumes (usage-only chunks, bare finish markers).
fn parse_sse_chunk(v: &Value) -> Option<ResponseEvent> {
    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    // Tool call delta — each chunk carries one fragment; the "index" field
    // routes accumulation for parallel tool calls in the agent.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        let index = tc["index"].as_u64().unwrap_or(0) as u32;
        let id = tc["id"].as_str().unwrap_or("").to_string();
        let name = tc["function"]["name"].as_str().unwrap_or("").to_string();
        let args = tc["function"]["arguments"]
            .as_str()
            .unwrap_or("")
            .to_string();
        return Some(ResponseEvent::ToolCall {
            index,
            id,
            name,
            arguments: args,
        });
    }

    if let Some(content) = delta["content"].as_str() {
        if !content.is_empty() {
            return Some(ResponseEvent::TextDelta(content.to_string()));
        }
    }

    None
}

/// Convert a non-streaming completion body into the event sequence the
/// streaming path would have produced.
fn events_from_response_body(v: &Value) -> Vec<ResponseEvent> {
    let mut events = Vec::new();
    let choice = &v["choices"][0];
    let message = &choice["message"];

    if let Some(content) = message["content"].as_str() {
        if !content.is_empty() {
            events.push(ResponseEvent::TextDelta(content.to_string()));
        }
    }

    if let Some(tool_calls) = message["tool_calls"].as_array() {
        for (i, tc) in tool_calls.iter().enumerate() {
            events.push(ResponseEvent::ToolCall {
                index: i as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"]
                    .as_str()
                    .unwrap_or("")
                    .to_string(),
            });
        }
    }

    events.push(ResponseEvent::Done);
    events
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
