// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The ReAct agent: a bounded think → act → observe loop over a chat model.
//!
//! One state machine, three emission modes:
//!
//! - **collected** — returns only the final string, optionally with a trace;
//! - **step-streamed** — one record per state transition (thinking steps,
//!   tool calls, a terminal result);
//! - **token-streamed** — model output at token granularity, with inline
//!   `<think>…</think>` markers split into a separate thinking channel.
//!
//! Every failure inside the loop — unknown tool, unhealthy service, argument
//! parse error, invocation error — becomes a result *string fed back to the
//! model*, which is free to retry or give up.  The driver itself never
//! re-invokes a tool.  Termination is guaranteed by the iteration bound.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use navet_config::AgentConfig;
use navet_model::{CompletionRequest, Message, ModelProvider, ResponseEvent, ToolSchema};

use crate::events::{StepRecord, StepStatus, StreamRecord, TokenChunk, TokenKind, TraceStep};
use crate::prompts::{react_system_prompt, STANDARD_SYSTEM_PROMPT};
use crate::registry::{ServiceRegistry, ToolDef};

/// Health capability consulted at tool-dispatch time.  Injected so the agent
/// holds no reference back into the orchestrator.
pub type HealthCheck = Arc<dyn Fn(&str) -> bool + Send + Sync>;

pub struct ReactAgent {
    model: Arc<dyn ModelProvider>,
    registry: Arc<ServiceRegistry>,
    health: HealthCheck,
    max_iterations: u32,
    enable_trace: bool,
}

/// One completed model turn: accumulated text plus any requested tool calls.
struct Turn {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
}

#[derive(Debug, Clone)]
struct ToolCallRequest {
    id: String,
    name: String,
    arguments: String,
}

impl ReactAgent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        registry: Arc<ServiceRegistry>,
        health: HealthCheck,
        config: &AgentConfig,
    ) -> Self {
        Self {
            model,
            registry,
            health,
            max_iterations: config.react_max_iterations.max(1),
            enable_trace: config.react_enable_trace,
        }
    }

    // ── Collected mode ────────────────────────────────────────────────────────

    /// Run the loop to completion and return the final answer, with a trace
    /// when tracing is enabled in configuration.
    pub async fn process_query(&self, query: &str) -> (String, Option<Vec<TraceStep>>) {
        let (result, trace) = self.run_collected(query, self.enable_trace).await;
        (result, if self.enable_trace { Some(trace) } else { None })
    }

    /// Like [`process_query`](Self::process_query) but always records the
    /// trace, regardless of configuration.
    pub async fn process_query_with_trace(&self, query: &str) -> (String, Vec<TraceStep>) {
        self.run_collected(query, true).await
    }

    async fn run_collected(&self, query: &str, record_trace: bool) -> (String, Vec<TraceStep>) {
        let tools = self.registry.all_tools();
        let schemas = to_schemas(&tools);
        let mut messages = vec![
            Message::system(react_system_prompt(&tools)),
            Message::user(query),
        ];
        let mut trace = Vec::new();

        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            info!(iteration = iterations, "starting ReAct iteration");

            let turn = match self.collect_turn(&messages, &schemas).await {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "model call failed; terminating loop");
                    return (format!("Error processing your request. ({e})"), trace);
                }
            };

            if let Some(tc) = turn.tool_calls.into_iter().next() {
                info!(tool = %tc.name, "model requested tool call");
                if record_trace {
                    trace.push(TraceStep::Thinking {
                        content: turn.text.clone(),
                    });
                }
                messages.push(Message::tool_call(&tc.id, &tc.name, &tc.arguments));
                let result = self.dispatch(&tc.name, &tc.arguments).await;
                if record_trace {
                    trace.push(TraceStep::ToolCall {
                        tool: tc.name.clone(),
                        result: result.clone(),
                    });
                }
                messages.push(Message::tool_result(&tc.id, &result));
                continue;
            }

            info!("model provided final answer; ending ReAct loop");
            return (turn.text.trim().to_string(), trace);
        }

        warn!(max = self.max_iterations, "maximum ReAct iterations reached");
        let last = messages.last().map(|m| m.content_text()).unwrap_or("");
        (
            format!(
                "Processing your request exceeded the maximum iteration limit ({}). {last}",
                self.max_iterations
            ),
            trace,
        )
    }

    /// Single-shot mode: one model call and at most one tool dispatch, whose
    /// text is returned directly.
    pub async fn process_query_standard(&self, query: &str) -> String {
        let tools = self.registry.all_tools();
        let schemas = to_schemas(&tools);
        let messages = vec![Message::system(STANDARD_SYSTEM_PROMPT), Message::user(query)];

        let turn = match self.collect_turn(&messages, &schemas).await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "model call failed");
                return format!("Error processing your request. ({e})");
            }
        };

        match turn.tool_calls.into_iter().next() {
            Some(tc) => {
                info!(tool = %tc.name, "model requested tool call");
                match serde_json::from_str::<Value>(&tc.arguments) {
                    Ok(args) => self.invoke(&tc.name, args).await,
                    Err(e) => {
                        error!(tool = %tc.name, error = %e, "argument parsing failed");
                        format!("Error: Unable to parse parameters for tool '{}'.", tc.name)
                    }
                }
            }
            None => turn.text.trim().to_string(),
        }
    }

    // ── Step-streamed mode ────────────────────────────────────────────────────

    /// Run the loop, emitting one [`StreamRecord`] per state transition.
    /// The terminal record has `is_final` set; the channel closes afterwards.
    pub async fn stream_query(&self, query: &str, tx: mpsc::Sender<StreamRecord>) {
        let tools = self.registry.all_tools();
        let schemas = to_schemas(&tools);
        let mut messages = vec![
            Message::system(react_system_prompt(&tools)),
            Message::user(query),
        ];

        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            info!(iteration = iterations, "starting streaming ReAct iteration");

            let turn = match self.collect_turn(&messages, &schemas).await {
                Ok(t) => t,
                Err(e) => {
                    error!(error = %e, "model call failed; terminating loop");
                    let _ = tx
                        .send(StreamRecord::final_result(format!(
                            "Error processing your request. ({e})"
                        )))
                        .await;
                    return;
                }
            };

            let step_id = format!("step-{}", Uuid::new_v4());
            let _ = tx
                .send(StreamRecord::step(StepRecord::thinking(
                    &step_id,
                    &turn.text,
                    StepStatus::Start,
                )))
                .await;
            let _ = tx
                .send(StreamRecord::step(StepRecord::thinking(
                    &step_id,
                    &turn.text,
                    StepStatus::Complete,
                )))
                .await;

            if let Some(tc) = turn.tool_calls.into_iter().next() {
                info!(tool = %tc.name, "model requested tool call");
                messages.push(Message::tool_call(&tc.id, &tc.name, &tc.arguments));

                let tool_step_id = format!("tool-{}", Uuid::new_v4());
                let (params, result) = match serde_json::from_str::<Value>(&tc.arguments) {
                    Ok(args) => {
                        let _ = tx
                            .send(StreamRecord::step(StepRecord::tool_start(
                                &tool_step_id,
                                &tc.name,
                                args.clone(),
                            )))
                            .await;
                        let result = self.invoke(&tc.name, args.clone()).await;
                        (args, result)
                    }
                    Err(e) => {
                        let params = serde_json::json!({
                            "error": format!("Unable to parse parameters: {e}")
                        });
                        let _ = tx
                            .send(StreamRecord::step(StepRecord::tool_start(
                                &tool_step_id,
                                &tc.name,
                                params.clone(),
                            )))
                            .await;
                        let result = format!(
                            "Error: Unable to parse parameters for tool '{}': {e}",
                            tc.name
                        );
                        (params, result)
                    }
                };
                let _ = tx
                    .send(StreamRecord::step(StepRecord::tool_complete(
                        &tool_step_id,
                        &tc.name,
                        params,
                        &result,
                    )))
                    .await;
                messages.push(Message::tool_result(&tc.id, &result));
                continue;
            }

            info!("model provided final answer; ending streaming ReAct loop");
            let _ = tx
                .send(StreamRecord::final_result(turn.text.trim().to_string()))
                .await;
            return;
        }

        warn!(max = self.max_iterations, "maximum ReAct iterations reached");
        let last = messages.last().map(|m| m.content_text()).unwrap_or("");
        let _ = tx
            .send(StreamRecord::final_result(format!(
                "Processing your request exceeded the maximum iteration limit ({}). {last}",
                self.max_iterations
            )))
            .await;
    }

    // ── Token-streamed mode ───────────────────────────────────────────────────

    /// Run the loop with streaming token deltas.  Content inside inline
    /// `<think>…</think>` markers is emitted as thinking tokens under a
    /// shared thinking id; content outside is emitted as answer tokens; a
    /// tool-call delta switches into the tool-call subflow.
    pub async fn stream_query_tokens(&self, query: &str, tx: mpsc::Sender<StreamRecord>) {
        let tools = self.registry.all_tools();
        let schemas = to_schemas(&tools);
        let mut system = react_system_prompt(&tools);
        system.push_str("\n\nWhen thinking, surround your thoughts with <think></think> tags.");
        let mut messages = vec![Message::system(system), Message::user(query)];

        let mut final_answer = String::new();

        let mut iterations = 0;
        while iterations < self.max_iterations {
            iterations += 1;
            info!(iteration = iterations, "starting token streaming ReAct iteration");

            let req = CompletionRequest {
                messages: messages.clone(),
                tools: schemas.clone(),
                stream: true,
            };
            let mut stream = match self.model.complete(req).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "model call failed; terminating loop");
                    let _ = tx
                        .send(StreamRecord::final_result(format!(
                            "Error processing your request. ({e})"
                        )))
                        .await;
                    return;
                }
            };

            let mut splitter = ThinkSplitter::default();
            let mut thinking_id: Option<String> = None;
            let mut thinking_buffer = String::new();
            let mut turn_content = String::new();
            let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();

            let mut stream_failed = false;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(ResponseEvent::TextDelta(token)) => {
                        turn_content.push_str(&token);
                        for seg in splitter.push(&token) {
                            self.emit_segment(&tx, seg, &mut thinking_id, &mut thinking_buffer, &mut final_answer)
                                .await;
                        }
                    }
                    Ok(ResponseEvent::ToolCall {
                        index,
                        id,
                        name,
                        arguments,
                    }) => {
                        let slot = pending.entry(index).or_default();
                        if !id.is_empty() {
                            slot.id = id;
                        }
                        if !name.is_empty() {
                            slot.name = name;
                        }
                        slot.arguments.push_str(&arguments);
                    }
                    Ok(ResponseEvent::Done) => break,
                    Ok(ResponseEvent::Error(e)) => warn!(error = %e, "model stream error"),
                    Err(e) => {
                        error!(error = %e, "model stream failed; terminating loop");
                        let _ = tx
                            .send(StreamRecord::final_result(format!(
                                "Error processing your request. ({e})"
                            )))
                            .await;
                        stream_failed = true;
                        break;
                    }
                }
            }
            if stream_failed {
                return;
            }
            if let Some(seg) = splitter.finish() {
                self.emit_segment(&tx, seg, &mut thinking_id, &mut thinking_buffer, &mut final_answer)
                    .await;
            }

            let calls = finalize_pending(pending);
            if !calls.is_empty() {
                for tc in &calls {
                    messages.push(Message::tool_call(&tc.id, &tc.name, &tc.arguments));
                }
                for tc in calls {
                    let tool_step_id = format!("tool-{}", Uuid::new_v4());
                    let (params, parse_error) =
                        match serde_json::from_str::<Value>(&tc.arguments) {
                            Ok(v) => (v, None),
                            Err(e) => {
                                error!(tool = %tc.name, error = %e, "argument parsing failed");
                                (serde_json::json!({}), Some(e.to_string()))
                            }
                        };
                    let _ = tx
                        .send(StreamRecord::step(StepRecord::tool_start(
                            &tool_step_id,
                            &tc.name,
                            params.clone(),
                        )))
                        .await;
                    let result = match parse_error {
                        Some(e) => format!(
                            "Error: Unable to parse parameters for tool '{}': {e}",
                            tc.name
                        ),
                        None => self.invoke(&tc.name, params.clone()).await,
                    };
                    let _ = tx
                        .send(StreamRecord::step(StepRecord::tool_complete(
                            &tool_step_id,
                            &tc.name,
                            params,
                            &result,
                        )))
                        .await;
                    messages.push(Message::tool_result(&tc.id, &result));
                }
                continue;
            }

            messages.push(Message::assistant(&turn_content));
            let _ = tx.send(StreamRecord::final_result(final_answer)).await;
            return;
        }

        warn!(max = self.max_iterations, "maximum ReAct iterations reached");
        let result = if final_answer.is_empty() {
            format!(
                "Processing exceeded maximum iteration limit ({}).",
                self.max_iterations
            )
        } else {
            final_answer
        };
        let _ = tx.send(StreamRecord::final_result(result)).await;
    }

    async fn emit_segment(
        &self,
        tx: &mpsc::Sender<StreamRecord>,
        seg: ThinkSegment,
        thinking_id: &mut Option<String>,
        thinking_buffer: &mut String,
        final_answer: &mut String,
    ) {
        match seg {
            ThinkSegment::Enter => {
                let id = format!("think-{}", Uuid::new_v4());
                let _ = tx
                    .send(StreamRecord::step(StepRecord::thinking(
                        &id,
                        "",
                        StepStatus::Start,
                    )))
                    .await;
                *thinking_id = Some(id);
                thinking_buffer.clear();
            }
            ThinkSegment::Think(text) => {
                thinking_buffer.push_str(&text);
                let _ = tx
                    .send(StreamRecord::token(TokenChunk {
                        kind: TokenKind::Thinking,
                        content: text,
                        thinking_id: thinking_id.clone(),
                    }))
                    .await;
            }
            ThinkSegment::Exit => {
                let id = thinking_id.take().unwrap_or_default();
                let _ = tx
                    .send(StreamRecord::step(StepRecord::thinking(
                        &id,
                        thinking_buffer,
                        StepStatus::Complete,
                    )))
                    .await;
            }
            ThinkSegment::Content(text) => {
                final_answer.push_str(&text);
                let _ = tx
                    .send(StreamRecord::token(TokenChunk {
                        kind: TokenKind::Content,
                        content: text,
                        thinking_id: None,
                    }))
                    .await;
            }
        }
    }

    // ── Model turn collection ─────────────────────────────────────────────────

    /// One model call, consumed to completion: accumulated text plus the
    /// requested tool calls with their argument fragments assembled.
    async fn collect_turn(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
    ) -> anyhow::Result<Turn> {
        let req = CompletionRequest {
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            stream: false,
        };
        let mut stream = self.model.complete(req).await?;

        let mut text = String::new();
        let mut pending: HashMap<u32, PendingToolCall> = HashMap::new();
        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextDelta(t) => text.push_str(&t),
                ResponseEvent::ToolCall {
                    index,
                    id,
                    name,
                    arguments,
                } => {
                    let slot = pending.entry(index).or_default();
                    if !id.is_empty() {
                        slot.id = id;
                    }
                    if !name.is_empty() {
                        slot.name = name;
                    }
                    slot.arguments.push_str(&arguments);
                }
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => warn!(error = %e, "model stream error"),
            }
        }

        Ok(Turn {
            text,
            tool_calls: finalize_pending(pending),
        })
    }

    // ── Tool dispatch ─────────────────────────────────────────────────────────

    /// Parse the argument JSON and invoke the tool.  Every failure mode
    /// returns a result string for the model.
    async fn dispatch(&self, name: &str, raw_arguments: &str) -> String {
        match serde_json::from_str::<Value>(raw_arguments) {
            Ok(args) => self.invoke(name, args).await,
            Err(e) => {
                error!(tool = name, error = %e, "argument parsing failed");
                format!("Error: Unable to parse parameters for tool '{name}': {e}")
            }
        }
    }

    /// Resolve the owning service, check its health, and call the tool.
    async fn invoke(&self, name: &str, args: Value) -> String {
        let Some(entry) = self.registry.session_for_tool(name) else {
            error!(tool = name, "tool service not found");
            return format!("Error: Could not find service to execute tool '{name}'.");
        };
        if !(self.health)(&entry.url) {
            warn!(tool = name, url = %entry.url, "tool service unhealthy");
            return format!(
                "Error: The service required to execute tool '{name}' is currently unavailable."
            );
        }

        info!(tool = name, url = %entry.url, "executing tool");
        match entry.session.call_tool(name, args).await {
            Ok(result) => match result.first_text() {
                Some(text) if !text.is_empty() => text.to_string(),
                Some(_) => "[No result]".to_string(),
                None => {
                    warn!(tool = name, "unexpected tool result format");
                    format!("Info: Tool '{name}' executed, but result format was unexpected.")
                }
            },
            Err(e) => {
                error!(tool = name, error = %e, "tool call failed");
                format!("Error: An internal error occurred while calling tool '{name}': {e}")
            }
        }
    }
}

fn to_schemas(tools: &[ToolDef]) -> Vec<ToolSchema> {
    tools
        .iter()
        .map(|t| ToolSchema {
            name: t.name.clone(),
            description: t.description.clone(),
            parameters: t.parameters.clone(),
        })
        .collect()
}

// ─── Pending tool calls ───────────────────────────────────────────────────────

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Order accumulated tool calls by provider index and drop the undispatchable
/// ones.  A call with no name cannot be routed and is discarded; a call with
/// no id gets a synthetic one so the conversation history stays well-formed.
fn finalize_pending(pending: HashMap<u32, PendingToolCall>) -> Vec<ToolCallRequest> {
    let mut sorted: Vec<(u32, PendingToolCall)> = pending.into_iter().collect();
    sorted.sort_by_key(|(index, _)| *index);

    let mut calls = Vec::new();
    for (i, (_, ptc)) in sorted.into_iter().enumerate() {
        if ptc.name.is_empty() {
            warn!(tool_call_id = %ptc.id, "dropping tool call with empty name");
            continue;
        }
        let id = if ptc.id.is_empty() {
            warn!(tool = %ptc.name, "tool call had empty id; generating synthetic id");
            format!("tc_synthetic_{i}")
        } else {
            ptc.id
        };
        let arguments = if ptc.arguments.is_empty() {
            debug!(tool = %ptc.name, "tool call with empty arguments; substituting {{}}");
            "{}".to_string()
        } else {
            ptc.arguments
        };
        calls.push(ToolCallRequest {
            id,
            name: ptc.name,
            arguments,
        });
    }
    calls
}

// ─── Inline think-tag splitting ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum ThinkSegment {
    Enter,
    Think(String),
    Exit,
    Content(String),
}

/// Splits a token stream around inline `<think>` / `</think>` markers.
///
/// A marker may arrive split across deltas, so any suffix that could be the
/// start of a marker is held back until the next token decides it.
#[derive(Default)]
struct ThinkSplitter {
    in_think: bool,
    carry: String,
}

impl ThinkSplitter {
    fn push(&mut self, token: &str) -> Vec<ThinkSegment> {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(token);

        let mut out = Vec::new();
        loop {
            let marker = if self.in_think { "</think>" } else { "<think>" };
            match text.find(marker) {
                Some(pos) => {
                    if pos > 0 {
                        out.push(self.wrap(text[..pos].to_string()));
                    }
                    text = text[pos + marker.len()..].to_string();
                    out.push(if self.in_think {
                        ThinkSegment::Exit
                    } else {
                        ThinkSegment::Enter
                    });
                    self.in_think = !self.in_think;
                }
                None => {
                    let hold = held_suffix_len(&text);
                    let emit = text.len() - hold;
                    if emit > 0 {
                        out.push(self.wrap(text[..emit].to_string()));
                    }
                    self.carry = text[emit..].to_string();
                    break;
                }
            }
        }
        out
    }

    /// Flush whatever is still held back once the stream ends.
    fn finish(&mut self) -> Option<ThinkSegment> {
        if self.carry.is_empty() {
            return None;
        }
        let text = std::mem::take(&mut self.carry);
        Some(self.wrap(text))
    }

    fn wrap(&self, text: String) -> ThinkSegment {
        if self.in_think {
            ThinkSegment::Think(text)
        } else {
            ThinkSegment::Content(text)
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of a think
/// marker — those bytes must wait for the next delta.
fn held_suffix_len(text: &str) -> usize {
    let mut held = 0;
    for marker in ["<think>", "</think>"] {
        for len in 1..marker.len() {
            if len <= text.len() && text.ends_with(&marker[..len]) {
                held = held.max(len);
            }
        }
    }
    held
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use navet_mcp_client::mock::MockToolSession;
    use navet_mcp_client::CallToolResult;
    use navet_model::mock::{FailingMockProvider, ScriptedMockProvider};
    use navet_model::MessageContent;
    use serde_json::json;

    fn def(name: &str, description: &str) -> ToolDef {
        ToolDef {
            name: name.to_string(),
            description: description.to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    fn registry_with(session: Arc<MockToolSession>, tools: Vec<ToolDef>) -> Arc<ServiceRegistry> {
        let reg = Arc::new(ServiceRegistry::new());
        reg.add("mock://a", session, tools, "mock-a");
        reg
    }

    fn agent_over(
        model: Arc<dyn ModelProvider>,
        registry: Arc<ServiceRegistry>,
        config: AgentConfig,
    ) -> ReactAgent {
        ReactAgent::new(model, registry, Arc::new(|_: &str| true), &config)
    }

    fn tool_call_script(name: &str, args: &str) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "call-1".into(),
                name: name.into(),
                arguments: args.into(),
            },
            ResponseEvent::Done,
        ]
    }

    /// Drain every record the agent sent; the channel must already be closed.
    fn drain(mut rx: mpsc::Receiver<StreamRecord>) -> Vec<StreamRecord> {
        let mut records = Vec::new();
        while let Ok(rec) = rx.try_recv() {
            records.push(rec);
        }
        records
    }

    #[tokio::test]
    async fn answers_directly_without_tools() {
        let model = Arc::new(ScriptedMockProvider::always_text("42"));
        let reg = Arc::new(ServiceRegistry::new());
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        let (result, trace) = agent.process_query("what is 6*7?").await;
        assert_eq!(result, "42");
        assert!(trace.is_none(), "tracing is off by default");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn weather_flow_dispatches_and_traces() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool(
                "get_weather",
                "Weather lookup",
                "city",
            )])
            .with_result("get_weather", "sunny, 25C"),
        );
        let reg = registry_with(
            session.clone(),
            vec![def("get_weather", "Weather lookup.")],
        );
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "get_weather",
            r#"{"city":"beijing"}"#,
            "It is sunny.",
        ));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        let (result, trace) = agent.process_query_with_trace("weather in beijing").await;
        assert_eq!(result, "It is sunny.");
        assert_eq!(trace.len(), 2);
        assert!(matches!(trace[0], TraceStep::Thinking { .. }));
        assert!(
            matches!(&trace[1], TraceStep::ToolCall { tool, result }
                if tool == "get_weather" && result == "sunny, 25C")
        );

        // The session saw the parsed arguments.
        let calls = session.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1["city"], "beijing");
    }

    #[tokio::test]
    async fn system_prompt_lists_registry_tools() {
        let session = Arc::new(MockToolSession::new(vec![]));
        let reg = registry_with(session, vec![def("get_weather", "Weather lookup.")]);
        let model = Arc::new(ScriptedMockProvider::always_text("hi"));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        agent.process_query("q").await;
        let req = model.last_request.lock().unwrap().clone().unwrap();
        let system = req.messages[0].as_text().unwrap().to_string();
        assert!(system.contains("THINKING"));
        assert!(system.contains("- get_weather: Weather lookup."));
        assert_eq!(req.tools.len(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_error_is_fed_back_to_model() {
        let reg = Arc::new(ServiceRegistry::new());
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "nonexistent",
            "{}",
            "ok",
        ));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        let (result, _) = agent.process_query("q").await;
        assert_eq!(result, "ok");

        // The error surfaced as a tool result the model saw, not a failure.
        let req = model.last_request.lock().unwrap().clone().unwrap();
        let tool_result = req
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            tool_result,
            "Error: Could not find service to execute tool 'nonexistent'."
        );
    }

    #[tokio::test]
    async fn unhealthy_service_surfaces_as_tool_result() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool("echo", "Echoes", "msg")])
                .with_result("echo", "never seen"),
        );
        let reg = registry_with(session.clone(), vec![def("echo", "Echoes.")]);
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1", "echo", "{}", "ok",
        ));
        // Health check fails at dispatch time.
        let agent =
            ReactAgent::new(model.clone(), reg, Arc::new(|_: &str| false), &AgentConfig::default());

        let (result, _) = agent.process_query("q").await;
        assert_eq!(result, "ok");
        assert_eq!(session.call_count(), 0, "unhealthy service must not be called");

        let req = model.last_request.lock().unwrap().clone().unwrap();
        let tool_result = req
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            tool_result,
            "Error: The service required to execute tool 'echo' is currently unavailable."
        );
    }

    #[tokio::test]
    async fn tool_exception_surfaces_to_model_not_caller() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool("boom", "Explodes", "x")])
                .with_failing("boom"),
        );
        let reg = registry_with(session, vec![def("boom", "Explodes.")]);
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1", "boom", "{}", "ok",
        ));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        let (result, _) = agent.process_query("q").await;
        assert_eq!(result, "ok");

        let req = model.last_request.lock().unwrap().clone().unwrap();
        let tool_result = req
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert!(
            tool_result.starts_with("Error: An internal error occurred while calling tool 'boom'"),
            "got: {tool_result}"
        );
    }

    #[tokio::test]
    async fn malformed_arguments_become_parse_error_result() {
        let session = Arc::new(MockToolSession::new(vec![MockToolSession::tool(
            "echo", "Echoes", "msg",
        )]));
        let reg = registry_with(session.clone(), vec![def("echo", "Echoes.")]);
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "echo",
            "{not json",
            "ok",
        ));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        let (result, _) = agent.process_query("q").await;
        assert_eq!(result, "ok");
        assert_eq!(session.call_count(), 0, "unparseable arguments never dispatch");

        let req = model.last_request.lock().unwrap().clone().unwrap();
        let tool_result = req
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert!(
            tool_result.starts_with("Error: Unable to parse parameters for tool 'echo'"),
            "got: {tool_result}"
        );
    }

    #[tokio::test]
    async fn unexpected_result_shape_is_reported() {
        let odd = CallToolResult {
            content: vec![json!({ "type": "audio", "data": "…" })],
            is_error: false,
        };
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool("odd", "Odd output", "x")])
                .with_raw_result("odd", odd),
        );
        let reg = registry_with(session, vec![def("odd", "Odd output.")]);
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1", "odd", "{}", "ok",
        ));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        agent.process_query("q").await;
        let req = model.last_request.lock().unwrap().clone().unwrap();
        let tool_result = req
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            tool_result,
            "Info: Tool 'odd' executed, but result format was unexpected."
        );
    }

    #[tokio::test]
    async fn empty_tool_text_becomes_no_result_marker() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool("quiet", "Says nothing", "x")])
                .with_result("quiet", ""),
        );
        let reg = registry_with(session, vec![def("quiet", "Says nothing.")]);
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1", "quiet", "{}", "ok",
        ));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        agent.process_query("q").await;
        let req = model.last_request.lock().unwrap().clone().unwrap();
        let tool_result = req
            .messages
            .iter()
            .find_map(|m| match &m.content {
                MessageContent::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool_result, "[No result]");
    }

    #[tokio::test]
    async fn iteration_cap_terminates_loop() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool("noop", "Does nothing", "x")])
                .with_result("noop", "nothing happened"),
        );
        let reg = registry_with(session, vec![def("noop", "Does nothing.")]);
        // The model asks for the same no-op tool forever.
        let scripts = (0..5).map(|_| tool_call_script("noop", "{}")).collect();
        let model = Arc::new(ScriptedMockProvider::new(scripts));
        let config = AgentConfig {
            react_max_iterations: 3,
            react_enable_trace: false,
        };
        let agent = agent_over(model.clone(), reg, config);

        let (result, _) = agent.process_query("loop forever").await;
        assert!(result.starts_with("Processing "), "got: {result}");
        assert!(
            result.contains("exceeded the maximum iteration limit (3)"),
            "got: {result}"
        );
        // Terminates at exactly max_iterations model calls.
        assert_eq!(model.call_count(), 3);
    }

    #[tokio::test]
    async fn model_error_terminates_with_error_result() {
        let model = Arc::new(FailingMockProvider {
            message: "connection reset".into(),
        });
        let reg = Arc::new(ServiceRegistry::new());
        let agent = agent_over(model, reg, AgentConfig::default());

        let (result, _) = agent.process_query("q").await;
        assert!(
            result.starts_with("Error processing your request. ("),
            "got: {result}"
        );
        assert!(result.contains("connection reset"));
    }

    #[tokio::test]
    async fn standard_mode_returns_tool_text_directly() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool(
                "get_weather",
                "Weather lookup",
                "city",
            )])
            .with_result("get_weather", "sunny, 25C"),
        );
        let reg = registry_with(session, vec![def("get_weather", "Weather lookup.")]);
        let model = Arc::new(ScriptedMockProvider::new(vec![tool_call_script(
            "get_weather",
            r#"{"city":"oslo"}"#,
        )]));
        let agent = agent_over(model.clone(), reg, AgentConfig::default());

        let result = agent.process_query_standard("weather in oslo").await;
        assert_eq!(result, "sunny, 25C");
        assert_eq!(model.call_count(), 1, "standard mode makes one model call");
    }

    #[tokio::test]
    async fn standard_mode_returns_direct_answer() {
        let model = Arc::new(ScriptedMockProvider::always_text("  direct  "));
        let reg = Arc::new(ServiceRegistry::new());
        let agent = agent_over(model, reg, AgentConfig::default());
        assert_eq!(agent.process_query_standard("q").await, "direct");
    }

    // ── Step-streamed mode ────────────────────────────────────────────────────

    #[tokio::test]
    async fn step_stream_emits_transitions_and_terminal_record() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool(
                "get_weather",
                "Weather lookup",
                "city",
            )])
            .with_result("get_weather", "sunny"),
        );
        let reg = registry_with(session, vec![def("get_weather", "Weather lookup.")]);
        let model = Arc::new(ScriptedMockProvider::tool_then_text(
            "call-1",
            "get_weather",
            r#"{"city":"beijing"}"#,
            "It is sunny.",
        ));
        let agent = agent_over(model, reg, AgentConfig::default());

        let (tx, rx) = mpsc::channel(64);
        agent.stream_query("weather in beijing", tx).await;
        let records = drain(rx);

        let final_rec = records.last().unwrap();
        assert!(final_rec.is_final);
        assert_eq!(final_rec.result.as_deref(), Some("It is sunny."));

        let steps: Vec<&StepRecord> = records
            .iter()
            .filter_map(|r| r.thinking_step.as_ref())
            .collect();
        // Round 1: thinking start/complete + tool start/complete.
        // Round 2: thinking start/complete.
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[0].kind, crate::events::StepKind::Thinking);
        assert_eq!(steps[0].status, StepStatus::Start);
        let tool_steps: Vec<&&StepRecord> = steps
            .iter()
            .filter(|s| s.kind == crate::events::StepKind::ToolCall)
            .collect();
        assert_eq!(tool_steps.len(), 2);
        assert_eq!(tool_steps[0].status, StepStatus::Start);
        assert_eq!(tool_steps[0].params.as_ref().unwrap()["city"], "beijing");
        assert_eq!(tool_steps[1].status, StepStatus::Complete);
        assert_eq!(tool_steps[1].result.as_deref(), Some("sunny"));
        // Start and complete share a step id.
        assert_eq!(tool_steps[0].id, tool_steps[1].id);
    }

    #[tokio::test]
    async fn step_stream_iteration_cap_sends_terminal_record() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool("noop", "Does nothing", "x")])
                .with_result("noop", "nothing"),
        );
        let reg = registry_with(session, vec![def("noop", "Does nothing.")]);
        let scripts = (0..4).map(|_| tool_call_script("noop", "{}")).collect();
        let model = Arc::new(ScriptedMockProvider::new(scripts));
        let config = AgentConfig {
            react_max_iterations: 2,
            react_enable_trace: false,
        };
        let agent = agent_over(model, reg, config);

        let (tx, rx) = mpsc::channel(64);
        agent.stream_query("q", tx).await;
        let records = drain(rx);
        let final_rec = records.last().unwrap();
        assert!(final_rec.is_final);
        assert!(final_rec
            .result
            .as_deref()
            .unwrap()
            .contains("exceeded the maximum iteration limit (2)"));
    }

    // ── Token-streamed mode ───────────────────────────────────────────────────

    #[tokio::test]
    async fn token_stream_separates_thinking_from_content() {
        // The <think> marker is split across deltas.
        let script = vec![
            ResponseEvent::TextDelta("<th".into()),
            ResponseEvent::TextDelta("ink>I wonder</think>".into()),
            ResponseEvent::TextDelta("The answer".into()),
            ResponseEvent::TextDelta(" is 42".into()),
            ResponseEvent::Done,
        ];
        let model = Arc::new(ScriptedMockProvider::new(vec![script]));
        let reg = Arc::new(ServiceRegistry::new());
        let agent = agent_over(model, reg, AgentConfig::default());

        let (tx, rx) = mpsc::channel(256);
        agent.stream_query_tokens("q", tx).await;
        let records = drain(rx);

        let thinking: String = records
            .iter()
            .filter_map(|r| r.token_chunk.as_ref())
            .filter(|c| c.kind == TokenKind::Thinking)
            .map(|c| c.content.clone())
            .collect();
        let content: String = records
            .iter()
            .filter_map(|r| r.token_chunk.as_ref())
            .filter(|c| c.kind == TokenKind::Content)
            .map(|c| c.content.clone())
            .collect();
        assert_eq!(thinking, "I wonder");
        assert_eq!(content, "The answer is 42");

        // One thinking step opened and completed with the buffered content.
        let steps: Vec<&StepRecord> = records
            .iter()
            .filter_map(|r| r.thinking_step.as_ref())
            .collect();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Start);
        assert_eq!(steps[1].status, StepStatus::Complete);
        assert_eq!(steps[1].content.as_deref(), Some("I wonder"));
        assert_eq!(steps[0].id, steps[1].id);

        let final_rec = records.last().unwrap();
        assert!(final_rec.is_final);
        assert_eq!(final_rec.result.as_deref(), Some("The answer is 42"));
    }

    #[tokio::test]
    async fn token_stream_runs_tool_subflow() {
        let session = Arc::new(
            MockToolSession::new(vec![MockToolSession::tool(
                "get_weather",
                "Weather lookup",
                "city",
            )])
            .with_result("get_weather", "sunny"),
        );
        let reg = registry_with(session, vec![def("get_weather", "Weather lookup.")]);
        // Arguments arrive split across two deltas sharing index 0.
        let round1 = vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "call-1".into(),
                name: "get_weather".into(),
                arguments: r#"{"city":"#.into(),
            },
            ResponseEvent::ToolCall {
                index: 0,
                id: "".into(),
                name: "".into(),
                arguments: r#""oslo"}"#.into(),
            },
            ResponseEvent::Done,
        ];
        let round2 = vec![
            ResponseEvent::TextDelta("done".into()),
            ResponseEvent::Done,
        ];
        let model = Arc::new(ScriptedMockProvider::new(vec![round1, round2]));
        let agent = agent_over(model, reg, AgentConfig::default());

        let (tx, rx) = mpsc::channel(256);
        agent.stream_query_tokens("q", tx).await;
        let records = drain(rx);

        let tool_steps: Vec<&StepRecord> = records
            .iter()
            .filter_map(|r| r.thinking_step.as_ref())
            .filter(|s| s.kind == crate::events::StepKind::ToolCall)
            .collect();
        assert_eq!(tool_steps.len(), 2);
        assert_eq!(tool_steps[0].params.as_ref().unwrap()["city"], "oslo");
        assert_eq!(tool_steps[1].result.as_deref(), Some("sunny"));

        let final_rec = records.last().unwrap();
        assert_eq!(final_rec.result.as_deref(), Some("done"));
    }

    // ── finalize_pending ──────────────────────────────────────────────────────

    #[test]
    fn finalize_orders_by_index_and_fixes_ids() {
        let mut pending = HashMap::new();
        pending.insert(
            1,
            PendingToolCall {
                id: "".into(),
                name: "second".into(),
                arguments: "{}".into(),
            },
        );
        pending.insert(
            0,
            PendingToolCall {
                id: "c0".into(),
                name: "first".into(),
                arguments: "".into(),
            },
        );
        pending.insert(
            2,
            PendingToolCall {
                id: "c2".into(),
                name: "".into(),
                arguments: "{}".into(),
            },
        );
        let calls = finalize_pending(pending);
        assert_eq!(calls.len(), 2, "nameless call is dropped");
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[0].arguments, "{}", "empty arguments become an object");
        assert_eq!(calls[1].name, "second");
        assert_eq!(calls[1].id, "tc_synthetic_1");
    }

    // ── ThinkSplitter ─────────────────────────────────────────────────────────

    #[test]
    fn splitter_passes_plain_content_through() {
        let mut s = ThinkSplitter::default();
        let segs = s.push("hello world");
        assert_eq!(segs, vec![ThinkSegment::Content("hello world".into())]);
        assert!(s.finish().is_none());
    }

    #[test]
    fn splitter_handles_whole_block_in_one_token() {
        let mut s = ThinkSplitter::default();
        let segs = s.push("<think>hm</think>ok");
        assert_eq!(
            segs,
            vec![
                ThinkSegment::Enter,
                ThinkSegment::Think("hm".into()),
                ThinkSegment::Exit,
                ThinkSegment::Content("ok".into()),
            ]
        );
    }

    #[test]
    fn splitter_holds_back_partial_marker() {
        let mut s = ThinkSplitter::default();
        let segs = s.push("abc<thi");
        assert_eq!(segs, vec![ThinkSegment::Content("abc".into())]);
        let segs = s.push("nk>inner");
        assert_eq!(
            segs,
            vec![ThinkSegment::Enter, ThinkSegment::Think("inner".into())]
        );
    }

    #[test]
    fn splitter_closing_marker_split_across_tokens() {
        let mut s = ThinkSplitter::default();
        s.push("<think>deep");
        let segs = s.push(" thought</th");
        assert_eq!(segs, vec![ThinkSegment::Think(" thought".into())]);
        let segs = s.push("ink>after");
        assert_eq!(
            segs,
            vec![ThinkSegment::Exit, ThinkSegment::Content("after".into())]
        );
    }

    #[test]
    fn splitter_finish_flushes_held_text() {
        let mut s = ThinkSplitter::default();
        s.push("tail<");
        assert_eq!(s.finish(), Some(ThinkSegment::Content("<".into())));
    }

    #[test]
    fn held_suffix_prefers_longest_marker_prefix() {
        assert_eq!(held_suffix_len("abc"), 0);
        assert_eq!(held_suffix_len("abc<"), 1);
        assert_eq!(held_suffix_len("abc</thin"), "</thin".len());
        assert_eq!(held_suffix_len("x<think"), "<think".len());
    }
}
