// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mux_config::{RuntimeConfig, SessionMode};
use mux_model::{Message, Usage};

/// Events published on a workspace's chat channel.
///
/// Subscribers observe them in emission order; for one stream the sequence
/// is always `StreamStart < {delta | tool | reasoning | usage}* <
/// StreamEnd | StreamAbort | Error`, and nothing follows an `Error` for
/// that stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    StreamStart {
        workspace_id: String,
        message_id: String,
        model: String,
        history_sequence: u64,
        start_time: DateTime<Utc>,
        mode: Option<SessionMode>,
    },
    StreamDelta {
        message_id: String,
        delta: String,
    },
    ReasoningDelta {
        message_id: String,
        delta: String,
    },
    ReasoningEnd {
        message_id: String,
    },
    ToolCallStart {
        message_id: String,
        tool_call_id: String,
        tool_name: String,
    },
    ToolCallDelta {
        message_id: String,
        tool_call_id: String,
        partial_input: String,
    },
    ToolCallEnd {
        message_id: String,
        tool_call_id: String,
        result: serde_json::Value,
        is_error: bool,
    },
    UsageDelta {
        message_id: String,
        usage: Usage,
    },
    /// The stream finished; the final assistant message (parts + metadata)
    /// has been persisted.
    StreamEnd {
        message_id: String,
        message: Message,
    },
    StreamAbort {
        message_id: String,
        abandon_partial: bool,
    },
    Error {
        error_type: String,
        message: String,
    },
    AutoRetryScheduled {
        attempt: u32,
        delay_ms: u64,
        scheduled_at: DateTime<Utc>,
    },
    AutoRetryStarting {
        attempt: u32,
    },
    AutoRetryAbandoned {
        reason: String,
    },
    /// History entries were removed (truncate/clear/replace/edit).
    Delete {
        history_sequences: Vec<u64>,
    },
}

/// Per-workspace stream state, derived from chat events and explicit
/// queue/retry actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming,
    Interrupted,
    Failed,
    Retrying,
}

/// Snapshot published on the process-wide metadata channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceMetadata {
    pub workspace_id: String,
    pub name: String,
    pub title: String,
    pub project_path: String,
    pub project_name: String,
    pub workspace_path: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incompatible_runtime: bool,
    #[serde(default)]
    pub streaming: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assistant_completed_at: Option<DateTime<Utc>>,
}

/// `metadata == None` announces deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceMetadataEvent {
    pub workspace_id: String,
    pub metadata: Option<WorkspaceMetadata>,
}
