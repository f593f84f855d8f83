// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider wire view of the conversation.
//!
//! The persisted [`crate::Message`] model is richer than what providers
//! accept; the transform pipeline lowers history into [`WireMessage`]s and
//! then applies the provider-shape passes in this module: reasoning-block
//! merging, cache markers, and structural validation.

use serde::{Deserialize, Serialize};

use crate::message::Role;
use crate::provider::ChatRequest;

/// One message as sent to a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub blocks: Vec<WireBlock>,
}

impl WireMessage {
    pub fn new(role: Role, blocks: Vec<WireBlock>) -> Self {
        Self { role, blocks }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(
            Role::User,
            vec![WireBlock::Text {
                text: text.into(),
                cache_control: false,
            }],
        )
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            || self.blocks.iter().all(|b| match b {
                WireBlock::Text { text, .. } => text.is_empty(),
                _ => false,
            })
    }
}

/// One content block of a wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cache_control: bool,
    },
    Reasoning {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cache_control: bool,
    },
    Image {
        url: String,
        media_type: String,
    },
}

/// Attach cache-control markers for providers that accept caller-driven
/// prompt caching: the last tool definition (caches the whole tool prefix)
/// and the last content block of the last message (caches the conversation
/// up to the current turn).
pub fn apply_cache_markers(req: &mut ChatRequest) {
    if let Some(last_tool) = req.tools.last_mut() {
        last_tool.cache_control = true;
    }
    if let Some(last_msg) = req.messages.last_mut() {
        if let Some(last_block) = last_msg.blocks.last_mut() {
            match last_block {
                WireBlock::Text { cache_control, .. }
                | WireBlock::ToolResult { cache_control, .. } => *cache_control = true,
                _ => {}
            }
        }
    }
}

/// Merge consecutive reasoning blocks inside each message into one.
///
/// Anthropic requires at most one thinking block per assistant turn and it
/// must precede the text content; deltas arriving as multiple parts are
/// collapsed here.
pub fn merge_reasoning_blocks(messages: &mut [WireMessage]) {
    for msg in messages.iter_mut() {
        let mut merged: Vec<WireBlock> = Vec::with_capacity(msg.blocks.len());
        let mut reasoning = String::new();
        for block in msg.blocks.drain(..) {
            match block {
                WireBlock::Reasoning { text } => {
                    reasoning.push_str(&text);
                }
                other => merged.push(other),
            }
        }
        if !reasoning.is_empty() {
            merged.insert(0, WireBlock::Reasoning { text: reasoning });
        }
        msg.blocks = merged;
    }
}

/// Check the strict structural rules some providers enforce.
///
/// Returns human-readable violations; callers log them (`warn!`) and send
/// the request anyway — many endpoints are lenient, and rejecting locally
/// would turn a provider quirk into a hard failure.
pub fn validate_provider_shape(system: &str, messages: &[WireMessage]) -> Vec<String> {
    let mut problems = Vec::new();

    if system.trim().is_empty() {
        problems.push("system message is empty".to_string());
    }
    if messages.is_empty() {
        problems.push("no messages in request".to_string());
        return problems;
    }
    if messages[0].role != Role::User {
        problems.push("first message is not a user message".to_string());
    }
    for (i, m) in messages.iter().enumerate() {
        if m.role == Role::System {
            problems.push(format!("message {i} has system role inside the message list"));
        }
        if m.is_empty() {
            problems.push(format!("message {i} ({:?}) has no content", m.role));
        }
    }
    for pair in messages.windows(2) {
        if pair[0].role == pair[1].role && pair[0].role == Role::Assistant {
            problems.push("consecutive assistant messages".to_string());
            break;
        }
    }
    // Every tool_use must be answered by a tool_result in the next user turn.
    for (i, m) in messages.iter().enumerate() {
        for b in &m.blocks {
            if let WireBlock::ToolUse { id, .. } = b {
                let answered = messages.get(i + 1).is_some_and(|next| {
                    next.blocks.iter().any(|nb| {
                        matches!(nb, WireBlock::ToolResult { tool_use_id, .. } if tool_use_id == id)
                    })
                });
                if !answered {
                    problems.push(format!("tool_use {id} in message {i} has no tool_result"));
                }
            }
        }
    }
    problems
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
