// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! System prompts for the agent loop.

use crate::ToolDef;

/// Single-shot mode prompt: no explicit reasoning protocol.
pub const STANDARD_SYSTEM_PROMPT: &str =
    "You are an intelligent assistant that can utilize available tools to answer questions.";

const REACT_BASE_PROMPT: &str = "\
You are an intelligent assistant, using available tools to solve problems. Follow these steps:

1. THINKING: Analyze the problem, determine which tools and methods to use
2. ACTION: Choose an appropriate tool and use it
3. OBSERVATION: Analyze the results returned by the tool
4. Repeat steps 1-3 until you can provide a complete answer
5. ANSWER: Synthesize all information to provide the final answer

If the question is simple and doesn't require tools, answer directly. If tools are needed, follow the steps above.";

/// Build the ReAct system prompt, listing each available tool as
/// `- name: description` on its own line.
pub fn react_system_prompt(tools: &[ToolDef]) -> String {
    let mut prompt = REACT_BASE_PROMPT.to_string();
    if !tools.is_empty() {
        let list: Vec<String> = tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect();
        prompt.push_str("\n\nAvailable tools:\n");
        prompt.push_str(&list.join("\n"));
    }
    prompt
}

/// Normalize a tool description for the model: terminate it with a period
/// and, unless it already tells the model when to use the tool, append a
/// usage hint.
pub fn enhance_tool_description(description: &str, tool_name: &str) -> String {
    let mut d = description.to_string();
    if !d.ends_with('.') {
        d.push('.');
    }
    if !d.to_lowercase().contains("use this tool") {
        d.push_str(&format!(
            " Use this tool when you need {tool_name} related functionality."
        ));
    }
    d
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
