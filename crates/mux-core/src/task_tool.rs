// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Subagent dispatch.
//!
//! The `task` tool runs a bounded nested agent turn against the same
//! provider: its own system prompt, a restricted tool set, no persistence.
//! The nested result comes back as the tool output. Living in this crate
//! (not mux-tools) avoids a tools ↔ core dependency cycle.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use mux_model::{
    ChatProvider, ChatRequest, StreamChunk, ToolSchema, WireBlock, WireMessage,
};
use mux_tools::{resolve_tools, ResolveParams, SubagentDef, Tool, ToolCtx, ToolPolicy, ToolResult};

/// Provider turns a nested task may consume.
const MAX_SUBAGENT_ROUNDS: u32 = 8;

pub struct TaskTool {
    provider: Arc<dyn ChatProvider>,
    subagents: Vec<SubagentDef>,
}

impl TaskTool {
    pub fn new(provider: Arc<dyn ChatProvider>, subagents: Vec<SubagentDef>) -> Self {
        Self {
            provider,
            subagents,
        }
    }

    fn runnable(&self) -> impl Iterator<Item = &SubagentDef> {
        self.subagents.iter().filter(|a| a.runnable)
    }

    /// Tools a nested agent may use: read-and-run only, no edits, no
    /// further dispatch.
    fn nested_tools(&self) -> Vec<Arc<dyn Tool>> {
        resolve_tools(ResolveParams {
            policy: ToolPolicy::new(Some(vec!["bash".into(), "file_read".into()]), vec![]),
            ..Default::default()
        })
    }
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> String {
        let mut desc = String::from(
            "Dispatch a focused task to a subagent and return its final report.\n\
             The subagent works in the same workspace with read-and-run tools only.\n\
             Available subagents:\n",
        );
        let mut any = false;
        for agent in self.runnable() {
            any = true;
            desc.push_str(&format!("- {}: {}\n", agent.name, agent.description));
        }
        if !any {
            desc.push_str("- (none configured)\n");
        }
        desc
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "agent": {
                    "type": "string",
                    "description": "Name of the subagent to dispatch"
                },
                "prompt": {
                    "type": "string",
                    "description": "Complete task description for the subagent"
                }
            },
            "required": ["agent", "prompt"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult {
        let (agent_name, prompt) = match (
            input.get("agent").and_then(|v| v.as_str()),
            input.get("prompt").and_then(|v| v.as_str()),
        ) {
            (Some(a), Some(p)) => (a, p),
            _ => return ToolResult::err("missing required 'agent' or 'prompt' parameter"),
        };
        let Some(agent) = self.runnable().find(|a| a.name == agent_name) else {
            let known: Vec<&str> = self.runnable().map(|a| a.name.as_str()).collect();
            return ToolResult::err(format!(
                "unknown or non-runnable subagent {agent_name:?}; available: {}",
                known.join(", ")
            ));
        };

        debug!(agent = %agent.name, "dispatching subagent task");
        let system = agent.system_prompt.clone().unwrap_or_else(|| {
            format!(
                "You are the {} subagent. {}\nComplete the task and reply with a concise \
                 final report; your last message is returned verbatim to the caller.",
                agent.name, agent.description
            )
        });

        let tools = self.nested_tools();
        let schemas: Vec<ToolSchema> = tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
                cache_control: false,
            })
            .collect();

        let mut wire = vec![WireMessage::user_text(prompt)];
        let mut final_text = String::new();

        for _round in 0..MAX_SUBAGENT_ROUNDS {
            let req = ChatRequest {
                system: system.clone(),
                messages: wire.clone(),
                tools: schemas.clone(),
                max_output_tokens: None,
                options: Default::default(),
            };
            let mut stream = match self.provider.stream_chat(req).await {
                Ok(s) => s,
                Err(e) => return ToolResult::err(format!("subagent stream failed: {e}")),
            };

            let mut text = String::new();
            let mut calls: Vec<(String, String, Value)> = Vec::new();
            let mut names: std::collections::HashMap<String, String> = Default::default();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(StreamChunk::TextDelta(t)) => text.push_str(&t),
                    Ok(StreamChunk::ToolCallStart {
                        tool_call_id,
                        tool_name,
                    }) => {
                        names.insert(tool_call_id, tool_name);
                    }
                    Ok(StreamChunk::ToolCallEnd {
                        tool_call_id,
                        input,
                    }) => {
                        let name = names.get(&tool_call_id).cloned().unwrap_or_default();
                        calls.push((tool_call_id, name, input));
                    }
                    Ok(StreamChunk::Done) => break,
                    Ok(_) => {}
                    Err(e) => return ToolResult::err(format!("subagent stream failed: {e}")),
                }
            }

            if calls.is_empty() {
                final_text = text;
                break;
            }

            let mut blocks: Vec<WireBlock> = Vec::new();
            if !text.is_empty() {
                blocks.push(WireBlock::Text {
                    text: text.clone(),
                    cache_control: false,
                });
            }
            let mut results: Vec<WireBlock> = Vec::new();
            for (id, name, call_input) in calls {
                blocks.push(WireBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: call_input.clone(),
                });
                let result = match tools.iter().find(|t| t.name() == name) {
                    Some(tool) => tool.execute(ctx, call_input).await,
                    None => ToolResult::err(format!("unknown tool: {name}")),
                };
                results.push(WireBlock::ToolResult {
                    tool_use_id: id,
                    content: result.output.to_string(),
                    is_error: result.is_error,
                    cache_control: false,
                });
            }
            wire.push(WireMessage::new(mux_model::Role::Assistant, blocks));
            wire.push(WireMessage::new(mux_model::Role::User, results));
            final_text = text;
        }

        ToolResult::ok(json!({
            "agent": agent.name,
            "report": final_text,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
