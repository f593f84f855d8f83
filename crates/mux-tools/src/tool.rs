// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use mux_config::SessionMode;
use mux_runtime::Runtime;

/// Everything a tool invocation may touch. Built per stream turn; the cancel
/// signal is per tool call.
#[derive(Clone)]
pub struct ToolCtx {
    pub runtime: Arc<dyn Runtime>,
    pub workspace_path: PathBuf,
    pub mode: SessionMode,
    pub secrets: HashMap<String, String>,
    /// Flips to `true` when this call is interrupted.
    pub cancel: watch::Receiver<bool>,
}

impl ToolCtx {
    /// The plan file: the only writable path in plan mode, always readable.
    pub fn plan_path(&self) -> PathBuf {
        self.workspace_path.join(".mux").join("plan.md")
    }

    /// Resolve a tool-supplied path against the workspace root.
    pub fn resolve_in_workspace(&self, path: &str) -> PathBuf {
        let p = PathBuf::from(path);
        if p.is_absolute() {
            p
        } else {
            self.workspace_path.join(p)
        }
    }
}

/// The result of one tool execution. Errors are carried in-band — the model
/// reacts to them; they never abort the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub output: Value,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self {
            output,
            is_error: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            output: json!({ "error": message.into() }),
            is_error: true,
        }
    }

    /// Marker result for a call whose execution was cancelled.
    pub fn interrupted() -> Self {
        Self {
            output: json!({ "interrupted": true }),
            is_error: true,
        }
    }
}

/// Trait every built-in, MCP-sourced, and dynamic tool implements.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    /// Description shown to the model. Owned so tools can build it
    /// dynamically (the subagent-dispatch tool lists discovered agents).
    fn description(&self) -> String;
    /// JSON Schema of the input object.
    fn input_schema(&self) -> Value;
    /// Modes this tool is offered in.
    fn modes(&self) -> &[SessionMode] {
        &[SessionMode::Plan, SessionMode::Exec]
    }
    /// Bridgeable tools are replaced when the code-execution experiment runs
    /// in exclusive mode; non-bridgeable tools survive it.
    fn bridgeable(&self) -> bool {
        false
    }
    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_result_wraps_message() {
        let r = ToolResult::err("boom");
        assert!(r.is_error);
        assert_eq!(r.output["error"], "boom");
    }

    #[test]
    fn interrupted_result_is_marked() {
        let r = ToolResult::interrupted();
        assert!(r.is_error);
        assert_eq!(r.output["interrupted"], true);
    }
}
