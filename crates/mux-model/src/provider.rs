// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamErrorKind};
use crate::message::Usage;
use crate::wire::WireMessage;

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, StreamError>> + Send>>;

/// The single abstract streaming-chat interface the engine speaks.
///
/// Per-provider wire quirks stay behind this trait; the core only sees
/// ordered [`StreamChunk`]s.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider id, e.g. `"openai"`.
    fn name(&self) -> &str;

    /// Model identifier forwarded to the API.
    fn model_name(&self) -> &str;

    /// Open one streaming completion. The returned stream yields chunks in
    /// provider order and ends with [`StreamChunk::Done`] unless an error
    /// item terminates it first.
    async fn stream_chat(&self, req: ChatRequest) -> Result<ChunkStream, StreamError>;
}

/// One provider streaming request, already transformed to the wire view.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<WireMessage>,
    pub tools: Vec<ToolSchema>,
    pub max_output_tokens: Option<u32>,
    pub options: ProviderOptions,
}

/// Provider knobs resolved at send time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<mux_config::ThinkingLevel>,
    /// For providers that persist reasoning state server-side: the response
    /// id of the previous assistant turn to continue from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_response_id: Option<String>,
    /// Attach caller-driven prompt-cache markers (Anthropic family).
    #[serde(default)]
    pub cache_markers: bool,
}

/// A tool definition advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub input_schema: serde_json::Value,
    /// Cache marker applied by [`crate::wire::apply_cache_markers`].
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cache_control: bool,
}

/// One streamed event from the provider.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ReasoningEnd,
    /// A tool call opened; its input follows as deltas.
    ToolCallStart {
        tool_call_id: String,
        tool_name: String,
    },
    /// A fragment of the tool call's input JSON.
    ToolCallDelta {
        tool_call_id: String,
        partial_input: String,
    },
    /// Input complete and parsed; the tool may now be invoked.
    ToolCallEnd {
        tool_call_id: String,
        input: serde_json::Value,
    },
    Usage(Usage),
    /// Server-side response id (providers that persist reasoning state).
    ResponseId(String),
    Done,
}

/// A parsed `provider:model` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider: String,
    pub model: String,
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, self.model)
    }
}

/// Parse `provider:model` (e.g. `openai:gpt-4.1`). Both halves must be
/// non-empty; anything else is `invalid_model_string`.
pub fn parse_model_string(s: &str) -> Result<ModelRef, StreamError> {
    match s.split_once(':') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(ModelRef {
            provider: provider.to_string(),
            model: model.to_string(),
        }),
        _ => Err(StreamError::new(
            StreamErrorKind::InvalidModelString,
            format!("invalid model string: {s:?} (expected provider:model)"),
        )),
    }
}

/// Whether this model family accepts caller-driven prompt-cache markers.
pub fn supports_cache_markers(model: &ModelRef) -> bool {
    model.provider == "anthropic" || model.model.starts_with("claude")
}

/// Whether reasoning-only assistant messages should be preserved in the
/// provider view (extended-thinking models reuse them across turns).
pub fn supports_extended_thinking(model: &ModelRef) -> bool {
    model.model.starts_with("claude") || model.model.starts_with("o")
}

/// Whether the provider persists reasoning state server-side and returns a
/// response id to reference on the next turn.
pub fn persists_response_ids(model: &ModelRef) -> bool {
    model.provider == "openai"
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_model_string() {
        let m = parse_model_string("openai:gpt-4.1").unwrap();
        assert_eq!(m.provider, "openai");
        assert_eq!(m.model, "gpt-4.1");
        assert_eq!(m.to_string(), "openai:gpt-4.1");
    }

    #[test]
    fn model_with_colons_keeps_remainder() {
        let m = parse_model_string("custom:org/model:beta").unwrap();
        assert_eq!(m.provider, "custom");
        assert_eq!(m.model, "org/model:beta");
    }

    #[test]
    fn missing_separator_is_invalid() {
        let e = parse_model_string("gpt-4.1").unwrap_err();
        assert_eq!(e.kind, StreamErrorKind::InvalidModelString);
    }

    #[test]
    fn empty_halves_are_invalid() {
        assert!(parse_model_string(":gpt").is_err());
        assert!(parse_model_string("openai:").is_err());
        assert!(parse_model_string("").is_err());
    }

    #[test]
    fn anthropic_supports_cache_markers() {
        let m = parse_model_string("anthropic:claude-sonnet-4").unwrap();
        assert!(supports_cache_markers(&m));
        let o = parse_model_string("openai:gpt-4.1").unwrap();
        assert!(!supports_cache_markers(&o));
    }

    #[test]
    fn openai_persists_response_ids() {
        let o = parse_model_string("openai:gpt-4.1").unwrap();
        assert!(persists_response_ids(&o));
        let a = parse_model_string("anthropic:claude-sonnet-4").unwrap();
        assert!(!persists_response_ids(&a));
    }
}
