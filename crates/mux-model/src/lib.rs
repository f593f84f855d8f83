// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod error;
pub mod message;
pub mod mock;
pub mod openai_compat;
pub mod provider;
pub mod wire;

pub use error::{AuthErrorKind, StreamError, StreamErrorKind};
pub use message::{
    Message, MessageMetadata, Part, Role, ToolCallState, Usage, CONTINUE_SENTINEL,
};
pub use mock::ScriptedProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use provider::{
    parse_model_string, persists_response_ids, supports_cache_markers, supports_extended_thinking,
    ChatProvider, ChatRequest, ChunkStream, ModelRef, ProviderOptions, StreamChunk, ToolSchema,
};
pub use wire::{
    apply_cache_markers, merge_reasoning_blocks, validate_provider_shape, WireBlock, WireMessage,
};
