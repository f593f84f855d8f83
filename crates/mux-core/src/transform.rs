// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pre-provider message transforms.
//!
//! Ordered passes lowering persisted history into the provider view. The
//! persisted history is never mutated — every pass works on the request's
//! private copy. Pass order matters and mirrors the send path: filter,
//! sentinel, context injection, redaction, sanitization, wire conversion,
//! provider shaping.

use std::collections::HashSet;

use mux_model::{
    merge_reasoning_blocks, supports_cache_markers, supports_extended_thinking, Message, ModelRef,
    Part, Role, ToolCallState, WireBlock, WireMessage, CONTINUE_SENTINEL,
};

/// Tool outputs above this serialized size are elided from the provider
/// view; history keeps the full output.
const REDACT_OUTPUT_BYTES: usize = 4_096;
/// Head kept when an output is elided, so the model retains a scent of it.
const REDACT_KEEP_BYTES: usize = 512;

/// Attachments above this size (or not valid UTF-8 upstream) are skipped
/// with a note in their place.
const MAX_ATTACHMENT_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Default)]
pub struct TransformOptions {
    /// Plan content to inject for a plan→exec transition.
    pub mode_transition_plan: Option<String>,
    /// Files edited outside the conversation since the last turn.
    pub file_change_notices: Vec<String>,
    /// `(path, content)` pairs injected after the latest compaction summary.
    pub post_compaction_attachments: Vec<(String, String)>,
    /// Provider-invalidated response ids, filtered before reuse.
    pub lost_response_ids: HashSet<String>,
}

#[derive(Debug)]
pub struct TransformResult {
    pub wire: Vec<WireMessage>,
    /// Most recent still-valid response id, for providers that persist
    /// reasoning state server-side.
    pub previous_response_id: Option<String>,
}

/// Run passes 1–9 of the pipeline. Cache markers (pass 10) and structural
/// validation (pass 11) run at request construction, where the full
/// `ChatRequest` exists.
pub fn transform_history(
    history: &[Message],
    model: &ModelRef,
    opts: &TransformOptions,
) -> TransformResult {
    let mut messages: Vec<Message> = history.to_vec();

    // 1. Drop assistant messages the provider has no use for — unless the
    //    model reuses reasoning across turns.
    if !supports_extended_thinking(model) {
        messages.retain(|m| m.role != Role::Assistant || !m.is_effectively_empty());
    } else {
        messages.retain(|m| m.role != Role::Assistant || !m.parts.is_empty());
    }

    // 2. A trailing partial message gets the continue sentinel so the model
    //    knows the previous response was cut off.
    if let Some(last) = messages.last_mut() {
        if last.metadata.partial {
            last.append_to_last_text(CONTINUE_SENTINEL);
        }
    }

    // 3 + 4. Context injected before the latest user message: the approved
    //    plan on a plan→exec transition, then external file-change notices.
    let mut injected: Vec<Message> = Vec::new();
    if let Some(plan) = &opts.mode_transition_plan {
        injected.push(Message::new(
            Role::User,
            vec![Part::text(format!(
                "Mode changed from plan to exec. The approved plan:\n\n{plan}"
            ))],
        ));
    }
    if !opts.file_change_notices.is_empty() {
        let mut note = String::from("Files changed outside this conversation since the last turn:\n");
        for change in &opts.file_change_notices {
            note.push_str(&format!("- {change}\n"));
        }
        injected.push(Message::new(Role::User, vec![Part::text(note)]));
    }
    if !injected.is_empty() {
        let at = messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .unwrap_or(messages.len());
        messages.splice(at..at, injected);
    }

    // 5. Post-compaction attachments directly after the newest summary.
    if !opts.post_compaction_attachments.is_empty() {
        if let Some(idx) = messages.iter().rposition(|m| m.metadata.compacted) {
            let mut parts: Vec<Part> = Vec::new();
            for (path, content) in &opts.post_compaction_attachments {
                if content.len() > MAX_ATTACHMENT_BYTES {
                    parts.push(Part::text(format!(
                        "[attachment skipped: {path} is {} bytes]",
                        content.len()
                    )));
                } else {
                    parts.push(Part::FileAttachment {
                        path: path.clone(),
                        content: content.clone(),
                        media_type: "text/plain".to_string(),
                    });
                }
            }
            messages.insert(idx + 1, Message::new(Role::User, parts));
        }
    }

    // 6. Elide heavy tool outputs — provider view only.
    for m in &mut messages {
        for p in &mut m.parts {
            if let Part::ToolCall { output: Some(output), .. } = p {
                let serialized = output.to_string();
                if serialized.len() > REDACT_OUTPUT_BYTES {
                    let head: String = serialized.chars().take(REDACT_KEEP_BYTES).collect();
                    *output = serde_json::json!({
                        "elided": true,
                        "original_bytes": serialized.len(),
                        "head": head,
                    });
                }
            }
        }
    }

    // 7. Tool inputs must be objects on every wire.
    for m in &mut messages {
        for p in &mut m.parts {
            if let Part::ToolCall { input, .. } = p {
                if !input.is_object() {
                    *input = match input {
                        serde_json::Value::String(s) => serde_json::json!({ "raw": s }),
                        _ => serde_json::json!({}),
                    };
                }
            }
        }
    }

    // 8. Lower to the wire shape (drops unfinished tool calls).
    let mut wire = to_wire(&messages);

    // 9. Provider-specific shaping.
    if supports_cache_markers(model) {
        merge_reasoning_blocks(&mut wire);
    }

    let previous_response_id = messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .find_map(|m| m.metadata.response_id.clone())
        .filter(|id| !opts.lost_response_ids.contains(id));

    TransformResult {
        wire,
        previous_response_id,
    }
}

/// Pass 8: persisted messages → wire messages.
///
/// A completed tool call becomes an assistant `tool_use` block plus a
/// `tool_result` block in a following user message. Tool calls that never
/// finished (no output) are dropped — providers reject dangling tool_use.
fn to_wire(messages: &[Message]) -> Vec<WireMessage> {
    let mut wire: Vec<WireMessage> = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::User | Role::System => {
                let mut blocks = Vec::new();
                for p in &m.parts {
                    match p {
                        Part::Text { text } if !text.is_empty() => blocks.push(WireBlock::Text {
                            text: text.clone(),
                            cache_control: false,
                        }),
                        Part::FileAttachment {
                            path, content, ..
                        } => blocks.push(WireBlock::Text {
                            text: format!("Attachment {path}:\n{content}"),
                            cache_control: false,
                        }),
                        Part::Image { url, media_type } => blocks.push(WireBlock::Image {
                            url: url.clone(),
                            media_type: media_type.clone(),
                        }),
                        _ => {}
                    }
                }
                if !blocks.is_empty() {
                    // Synthetic system context travels as user content; the
                    // real system prompt is carried on the request itself.
                    wire.push(WireMessage::new(Role::User, blocks));
                }
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                let mut results = Vec::new();
                for p in &m.parts {
                    match p {
                        Part::Text { text } if !text.is_empty() => blocks.push(WireBlock::Text {
                            text: text.clone(),
                            cache_control: false,
                        }),
                        Part::Reasoning { text } if !text.is_empty() => {
                            blocks.push(WireBlock::Reasoning { text: text.clone() })
                        }
                        Part::ToolCall {
                            tool_name,
                            tool_call_id,
                            input,
                            state,
                            output: Some(output),
                        } if matches!(
                            state,
                            ToolCallState::Completed | ToolCallState::Interrupted
                        ) =>
                        {
                            blocks.push(WireBlock::ToolUse {
                                id: tool_call_id.clone(),
                                name: tool_name.clone(),
                                input: input.clone(),
                            });
                            results.push(WireBlock::ToolResult {
                                tool_use_id: tool_call_id.clone(),
                                content: output.to_string(),
                                is_error: output
                                    .get("error")
                                    .or_else(|| output.get("interrupted"))
                                    .is_some(),
                                cache_control: false,
                            });
                        }
                        // Unfinished tool calls never reach the wire.
                        _ => {}
                    }
                }
                if !blocks.is_empty() {
                    wire.push(WireMessage::new(Role::Assistant, blocks));
                }
                if !results.is_empty() {
                    wire.push(WireMessage::new(Role::User, results));
                }
            }
        }
    }
    wire
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
