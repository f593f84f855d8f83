// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use mux_config::SessionMode;

/// Appended to the last text part of a partial assistant message when its
/// stream was cut off, so the next turn knows to continue rather than
/// restart. Present exactly when the message is committed with
/// `metadata.partial == true` — user interrupt and abandoning stream errors
/// follow the same rule.
pub const CONTINUE_SENTINEL: &str = "[CONTINUE]";

/// A single message in a workspace's chat history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Ordered content of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_name: String,
        tool_call_id: String,
        input: serde_json::Value,
        state: ToolCallState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
    FileAttachment {
        path: String,
        content: String,
        media_type: String,
    },
    Image {
        /// Data URL (`data:image/png;base64,...`) or HTTPS URL.
        url: String,
        media_type: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Lifecycle of a tool call inside an assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallState {
    /// Input JSON still arriving from the provider.
    Streaming,
    /// Input complete and parseable; execution not yet finished.
    Available,
    Completed,
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Monotonic per-workspace sequence stamped by the history store at
    /// append time; `None` until the message is persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
    /// True when this assistant message was committed before its stream
    /// finished (interrupt or abandoning error).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    /// True when this message is a compaction summary replacing prior turns.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compacted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Provider-issued response id, recorded for providers that persist
    /// reasoning state server-side so later turns can reference it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Token usage reported by the provider for one stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_tokens: u32,
    #[serde(default)]
    pub cache_write_tokens: u32,
}

impl Message {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            metadata: MessageMetadata {
                timestamp: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Part::text(text)])
    }

    /// Empty assistant message reserving a history slot; the stream driver
    /// fills in its parts and finalizes via the history store.
    pub fn assistant_placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            parts: Vec::new(),
            metadata: MessageMetadata {
                timestamp: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// True when the assistant produced nothing the provider needs to see:
    /// no parts at all, or only reasoning parts.
    pub fn is_effectively_empty(&self) -> bool {
        self.parts
            .iter()
            .all(|p| matches!(p, Part::Reasoning { .. }))
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &Part> {
        self.parts
            .iter()
            .filter(|p| matches!(p, Part::ToolCall { .. }))
    }

    /// Append `sentinel` to the final text part, adding one if the message
    /// ends without text.
    pub fn append_to_last_text(&mut self, sentinel: &str) {
        match self.parts.iter_mut().rev().find_map(|p| match p {
            Part::Text { text } => Some(text),
            _ => None,
        }) {
            Some(text) => {
                if !text.ends_with(sentinel) {
                    if !text.is_empty() && !text.ends_with('\n') {
                        text.push('\n');
                    }
                    text.push_str(sentinel);
                }
            }
            None => self.parts.push(Part::text(sentinel)),
        }
    }

    /// Rough 4-chars-per-token estimate used for system-message accounting.
    pub fn approx_tokens(&self) -> usize {
        let chars: usize = self
            .parts
            .iter()
            .map(|p| match p {
                Part::Text { text } | Part::Reasoning { text } => text.len(),
                Part::ToolCall { input, output, .. } => {
                    input.to_string().len()
                        + output.as_ref().map(|o| o.to_string().len()).unwrap_or(0)
                }
                Part::FileAttachment { content, .. } => content.len(),
                Part::Image { .. } => 765 * 4,
            })
            .sum();
        (chars / 4).max(1)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_has_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.text(), "hello");
        assert!(m.metadata.timestamp.is_some());
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(Message::user("a").id, Message::user("a").id);
    }

    #[test]
    fn text_concatenates_only_text_parts() {
        let m = Message::new(
            Role::Assistant,
            vec![
                Part::text("a"),
                Part::Reasoning { text: "thinking".into() },
                Part::text("b"),
            ],
        );
        assert_eq!(m.text(), "ab");
    }

    #[test]
    fn reasoning_only_assistant_is_effectively_empty() {
        let m = Message::new(Role::Assistant, vec![Part::Reasoning { text: "hmm".into() }]);
        assert!(m.is_effectively_empty());
        let m2 = Message::assistant("hi");
        assert!(!m2.is_effectively_empty());
    }

    #[test]
    fn empty_assistant_is_effectively_empty() {
        let m = Message::new(Role::Assistant, vec![]);
        assert!(m.is_effectively_empty());
    }

    #[test]
    fn append_sentinel_to_trailing_text() {
        let mut m = Message::assistant("half a reply");
        m.append_to_last_text(CONTINUE_SENTINEL);
        assert!(m.text().ends_with(CONTINUE_SENTINEL));
    }

    #[test]
    fn append_sentinel_is_idempotent() {
        let mut m = Message::assistant("half");
        m.append_to_last_text(CONTINUE_SENTINEL);
        m.append_to_last_text(CONTINUE_SENTINEL);
        assert_eq!(m.text().matches(CONTINUE_SENTINEL).count(), 1);
    }

    #[test]
    fn append_sentinel_creates_text_part_when_missing() {
        let mut m = Message::new(
            Role::Assistant,
            vec![Part::ToolCall {
                tool_name: "bash".into(),
                tool_call_id: "tc1".into(),
                input: serde_json::json!({}),
                state: ToolCallState::Interrupted,
                output: None,
            }],
        );
        m.append_to_last_text(CONTINUE_SENTINEL);
        assert_eq!(m.text(), CONTINUE_SENTINEL);
    }

    #[test]
    fn metadata_defaults_are_omitted_from_json() {
        let m = Message::user("x");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("partial"));
        assert!(!json.contains("compacted"));
        assert!(!json.contains("history_sequence"));
    }

    #[test]
    fn part_serializes_tagged() {
        let p = Part::ToolCall {
            tool_name: "bash".into(),
            tool_call_id: "t1".into(),
            input: serde_json::json!({"script": "ls"}),
            state: ToolCallState::Completed,
            output: Some(serde_json::json!({"exit_code": 0})),
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"type\":\"tool_call\""), "{json}");
        assert!(json.contains("\"state\":\"completed\""), "{json}");
        let back: Part = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn message_round_trips_with_sequence() {
        let mut m = Message::user("seq");
        m.metadata.history_sequence = Some(7);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.metadata.history_sequence, Some(7));
    }
}
