// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible streaming driver.
//!
//! Most hosted and local endpoints speak the `/chat/completions` SSE wire
//! format; this single driver covers them all, configured with a base URL
//! and key. Provider-specific families that need different wire shapes sit
//! behind the same [`ChatProvider`] trait.

use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use async_trait::async_trait;

use crate::error::{StreamError, StreamErrorKind};
use crate::message::{Role, Usage};
use crate::provider::{ChatProvider, ChatRequest, ChunkStream, StreamChunk};
use crate::wire::{WireBlock, WireMessage};

pub struct OpenAiCompatProvider {
    provider_name: String,
    model: String,
    api_key: Option<String>,
    chat_url: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        provider_name: impl Into<String>,
        model: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            provider_name: provider_name.into(),
            model: model.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            client: reqwest::Client::new(),
        }
    }

    fn build_body(&self, req: &ChatRequest) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(req.messages.len() + 1);
        if !req.system.is_empty() {
            messages.push(json!({ "role": "system", "content": req.system }));
        }
        for m in &req.messages {
            build_openai_messages(m, &mut messages);
        }

        let tools: Vec<Value> = req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if let Some(max) = req.max_output_tokens {
            body["max_completion_tokens"] = json!(max);
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }
        if let Some(prev) = &req.options.previous_response_id {
            body["previous_response_id"] = json!(prev);
        }
        body
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, req: ChatRequest) -> Result<ChunkStream, StreamError> {
        let body = self.build_body(&req);
        debug!(
            provider = %self.provider_name,
            model = %self.model,
            tools = req.tools.len(),
            messages = req.messages.len(),
            "opening completion stream"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req.send().await.map_err(StreamError::from)?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let kind = StreamErrorKind::classify_http(status, &text, &self.provider_name);
            return Err(StreamError::new(
                kind,
                format!("{} error {status}: {text}", self.provider_name),
            ));
        }

        // SSE events can be split across TCP packets; keep a line buffer
        // across chunks and only parse complete lines.
        let byte_stream = resp.bytes_stream();
        let chunk_stream = byte_stream
            .scan(SseState::default(), |state, chunk| {
                let items: Vec<Result<StreamChunk, StreamError>> = match chunk {
                    Ok(bytes) => {
                        state.buf.push_str(&String::from_utf8_lossy(&bytes));
                        state.drain_lines()
                    }
                    Err(e) => vec![Err(StreamError::network(e.to_string()))],
                };
                std::future::ready(Some(items))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(chunk_stream))
    }
}

/// Parser state carried across SSE byte chunks.
#[derive(Default)]
struct SseState {
    buf: String,
    pending: Vec<PendingToolCall>,
    response_id_sent: bool,
}

#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
    started: bool,
}

impl SseState {
    fn drain_lines(&mut self) -> Vec<Result<StreamChunk, StreamError>> {
        let mut out = Vec::new();
        while let Some(nl) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=nl).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            if data == "[DONE]" {
                out.extend(self.flush_tool_calls());
                out.push(Ok(StreamChunk::Done));
                continue;
            }
            match serde_json::from_str::<Value>(data) {
                Ok(v) => self.parse_event(&v, &mut out),
                Err(e) => {
                    // A malformed frame is not fatal; subsequent frames may
                    // still be valid.
                    tracing::warn!(error = %e, "skipping malformed SSE frame");
                }
            }
        }
        out
    }

    fn parse_event(&mut self, v: &Value, out: &mut Vec<Result<StreamChunk, StreamError>>) {
        if !self.response_id_sent {
            if let Some(id) = v["id"].as_str() {
                self.response_id_sent = true;
                out.push(Ok(StreamChunk::ResponseId(id.to_string())));
            }
        }

        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            out.push(Ok(StreamChunk::Usage(Usage {
                input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
                output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
                cache_read_tokens: usage["prompt_tokens_details"]["cached_tokens"]
                    .as_u64()
                    .unwrap_or(0) as u32,
                cache_write_tokens: 0,
            })));
        }

        let Some(choice) = v["choices"].get(0) else {
            return;
        };
        let delta = &choice["delta"];

        if let Some(text) = delta["reasoning_content"].as_str() {
            if !text.is_empty() {
                out.push(Ok(StreamChunk::ReasoningDelta(text.to_string())));
            }
        }
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                out.push(Ok(StreamChunk::TextDelta(text.to_string())));
            }
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;
                while self.pending.len() <= index {
                    self.pending.push(PendingToolCall::default());
                }
                let pending = &mut self.pending[index];
                if let Some(id) = tc["id"].as_str() {
                    pending.id = id.to_string();
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    pending.name = name.to_string();
                }
                if !pending.started && !pending.id.is_empty() && !pending.name.is_empty() {
                    pending.started = true;
                    out.push(Ok(StreamChunk::ToolCallStart {
                        tool_call_id: pending.id.clone(),
                        tool_name: pending.name.clone(),
                    }));
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    if !args.is_empty() {
                        pending.args_buf.push_str(args);
                        out.push(Ok(StreamChunk::ToolCallDelta {
                            tool_call_id: pending.id.clone(),
                            partial_input: args.to_string(),
                        }));
                    }
                }
            }
        }

        if choice["finish_reason"].as_str() == Some("tool_calls") {
            out.extend(self.flush_tool_calls());
        }
    }

    /// Close out accumulated tool calls: parse their input JSON and emit the
    /// `ToolCallEnd` that permits execution. Unparseable input falls back to
    /// `{}` so the turn can complete with an in-band tool error instead of a
    /// wire failure.
    fn flush_tool_calls(&mut self) -> Vec<Result<StreamChunk, StreamError>> {
        let mut out = Vec::new();
        for pending in self.pending.drain(..).filter(|p| p.started) {
            let input = if pending.args_buf.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&pending.args_buf).unwrap_or_else(|e| {
                    tracing::warn!(
                        tool = %pending.name,
                        error = %e,
                        "tool call arguments were not valid JSON; substituting {{}}"
                    );
                    json!({})
                })
            };
            out.push(Ok(StreamChunk::ToolCallEnd {
                tool_call_id: pending.id,
                input,
            }));
        }
        out
    }
}

/// Lower one wire message to OpenAI chat messages (a tool result becomes its
/// own `role: tool` message).
fn build_openai_messages(m: &WireMessage, out: &mut Vec<Value>) {
    let role = match m.role {
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::System => "system",
    };
    let mut text = String::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let mut tool_results: Vec<Value> = Vec::new();
    let mut images: Vec<Value> = Vec::new();

    for b in &m.blocks {
        match b {
            WireBlock::Text { text: t, .. } => text.push_str(t),
            // Reasoning is provider-managed on this wire; never echo it back.
            WireBlock::Reasoning { .. } => {}
            WireBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": { "name": name, "arguments": input.to_string() },
            })),
            WireBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => tool_results.push(json!({
                "role": "tool",
                "tool_call_id": tool_use_id,
                "content": content,
            })),
            WireBlock::Image { url, .. } => images.push(json!({
                "type": "image_url",
                "image_url": { "url": url },
            })),
        }
    }

    if !text.is_empty() || !tool_calls.is_empty() || !images.is_empty() {
        let mut msg = if images.is_empty() {
            json!({ "role": role, "content": text })
        } else {
            let mut parts = vec![json!({ "type": "text", "text": text })];
            parts.extend(images);
            json!({ "role": role, "content": parts })
        };
        if !tool_calls.is_empty() {
            msg["tool_calls"] = json!(tool_calls);
        }
        out.push(msg);
    }
    out.extend(tool_results);
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(state: &mut SseState, input: &str) -> Vec<StreamChunk> {
        state.buf.push_str(input);
        state
            .drain_lines()
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn text_deltas_parse() {
        let mut s = SseState::default();
        let chunks = drain(
            &mut s,
            "data: {\"id\":\"r1\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n",
        );
        assert_eq!(
            chunks,
            vec![
                StreamChunk::ResponseId("r1".into()),
                StreamChunk::TextDelta("hi".into())
            ]
        );
    }

    #[test]
    fn response_id_emitted_once() {
        let mut s = SseState::default();
        drain(
            &mut s,
            "data: {\"id\":\"r1\",\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n",
        );
        let second = drain(
            &mut s,
            "data: {\"id\":\"r1\",\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n",
        );
        assert_eq!(second, vec![StreamChunk::TextDelta("b".into())]);
    }

    #[test]
    fn split_frames_are_buffered() {
        let mut s = SseState::default();
        let first = drain(&mut s, "data: {\"choices\":[{\"delta\":{\"con");
        assert!(first.is_empty());
        let rest = drain(&mut s, "tent\":\"ok\"}}]}\n");
        assert_eq!(rest, vec![StreamChunk::TextDelta("ok".into())]);
    }

    #[test]
    fn tool_call_start_delta_end_sequence() {
        let mut s = SseState::default();
        let mut chunks = drain(
            &mut s,
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t1\",\
             \"function\":{\"name\":\"bash\",\"arguments\":\"{\\\"s\"}}]}}]}\n",
        );
        chunks.extend(drain(
            &mut s,
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\
             \"function\":{\"arguments\":\"cript\\\":\\\"ls\\\"}\"}}]}}]}\n",
        ));
        chunks.extend(drain(
            &mut s,
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n",
        ));

        assert!(matches!(
            &chunks[0],
            StreamChunk::ToolCallStart { tool_call_id, tool_name }
                if tool_call_id == "t1" && tool_name == "bash"
        ));
        let end = chunks
            .iter()
            .find_map(|c| match c {
                StreamChunk::ToolCallEnd { input, .. } => Some(input.clone()),
                _ => None,
            })
            .expect("tool call end");
        assert_eq!(end, json!({"script": "ls"}));
    }

    #[test]
    fn done_flushes_pending_tool_calls() {
        let mut s = SseState::default();
        drain(
            &mut s,
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t1\",\
             \"function\":{\"name\":\"bash\",\"arguments\":\"{}\"}}]}}]}\n",
        );
        let chunks = drain(&mut s, "data: [DONE]\n");
        assert!(matches!(chunks[0], StreamChunk::ToolCallEnd { .. }));
        assert_eq!(chunks[1], StreamChunk::Done);
    }

    #[test]
    fn invalid_tool_arguments_fall_back_to_empty_object() {
        let mut s = SseState::default();
        drain(
            &mut s,
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"t1\",\
             \"function\":{\"name\":\"bash\",\"arguments\":\"{broken\"}}]}}]}\n",
        );
        let chunks = drain(&mut s, "data: [DONE]\n");
        assert!(matches!(
            &chunks[0],
            StreamChunk::ToolCallEnd { input, .. } if *input == json!({})
        ));
    }

    #[test]
    fn usage_frame_parses() {
        let mut s = SseState::default();
        let chunks = drain(
            &mut s,
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":12,\"completion_tokens\":3}}\n",
        );
        assert_eq!(
            chunks,
            vec![StreamChunk::Usage(Usage {
                input_tokens: 12,
                output_tokens: 3,
                cache_read_tokens: 0,
                cache_write_tokens: 0,
            })]
        );
    }

    #[test]
    fn tool_result_becomes_tool_role_message() {
        let wire = WireMessage::new(
            Role::User,
            vec![WireBlock::ToolResult {
                tool_use_id: "t1".into(),
                content: "ok".into(),
                is_error: false,
                cache_control: false,
            }],
        );
        let mut out = Vec::new();
        build_openai_messages(&wire, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["role"], "tool");
        assert_eq!(out[0]["tool_call_id"], "t1");
    }
}
