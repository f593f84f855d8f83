// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use mux_config::SessionMode;
use mux_runtime::{ExecOptions, OverflowPolicy};

use crate::tool::{Tool, ToolCtx, ToolResult};

/// Runs a bash script inside the workspace runtime.
#[derive(Default)]
pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> String {
        "Execute a bash script in the workspace and return exit code, stdout, and stderr.\n\
         The script runs non-interactively: editors and credential prompts are disabled,\n\
         and the whole process tree is killed on timeout. Output above ~24 KB is cut to\n\
         head + tail with an omission marker (set overflow to \"tempfile\" to keep the\n\
         full output in a file). Prefer file_read / file_edit_* for file operations."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "script": {
                    "type": "string",
                    "description": "Bash script to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory relative to the workspace root (optional)"
                },
                "timeout_secs": {
                    "type": "integer",
                    "description": "Execution timeout in seconds (optional)"
                },
                "overflow": {
                    "type": "string",
                    "enum": ["truncate", "tempfile"],
                    "description": "What to do with oversized output (default truncate)"
                }
            },
            "required": ["script"],
            "additionalProperties": false
        })
    }

    fn modes(&self) -> &[SessionMode] {
        &[SessionMode::Plan, SessionMode::Exec]
    }

    fn bridgeable(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult {
        let Some(script) = input.get("script").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing required 'script' parameter");
        };
        let cwd = match input.get("cwd").and_then(|v| v.as_str()) {
            Some(rel) => ctx.resolve_in_workspace(rel),
            None => ctx.workspace_path.clone(),
        };
        let timeout = input
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);
        let overflow = match input.get("overflow").and_then(|v| v.as_str()) {
            Some("tempfile") => OverflowPolicy::Tempfile,
            _ => OverflowPolicy::Truncate,
        };

        debug!(script = %script.chars().take(120).collect::<String>(), "bash tool");
        let result = ctx
            .runtime
            .execute_bash(
                script,
                ExecOptions {
                    cwd: Some(cwd),
                    secrets: ctx.secrets.clone(),
                    timeout,
                    overflow,
                    cancel: Some(ctx.cancel.clone()),
                    niceness: None,
                },
            )
            .await;

        match result {
            Ok(r) => {
                let mut output = json!({
                    "exit_code": r.exit_code,
                    "stdout": r.stdout,
                    "stderr": r.stderr,
                });
                if let Some(marker) = r.truncated_marker {
                    output["truncated"] = json!(marker);
                }
                if r.timed_out {
                    output["timed_out"] = json!(true);
                }
                if r.interrupted {
                    output["interrupted"] = json!(true);
                    return ToolResult {
                        output,
                        is_error: true,
                    };
                }
                ToolResult {
                    output,
                    is_error: r.exit_code != 0,
                }
            }
            Err(e) => ToolResult::err(format!("bash execution failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn ctx(dir: &std::path::Path) -> ToolCtx {
        let (_tx, cancel) = watch::channel(false);
        // The sender is dropped; the cancel signal simply never fires.
        ToolCtx {
            runtime: mux_runtime::runtime_for(None).unwrap(),
            workspace_path: dir.to_path_buf(),
            mode: SessionMode::Exec,
            secrets: HashMap::new(),
            cancel,
        }
    }

    #[tokio::test]
    async fn runs_script_in_workspace_dir() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        let out = BashTool
            .execute(&c, json!({"script": "pwd"}))
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        let pwd = out.output["stdout"].as_str().unwrap().trim();
        assert_eq!(
            std::fs::canonicalize(pwd).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let out = BashTool
            .execute(&ctx(dir.path()), json!({"script": "exit 2"}))
            .await;
        assert!(out.is_error);
        assert_eq!(out.output["exit_code"], 2);
    }

    #[tokio::test]
    async fn missing_script_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = BashTool.execute(&ctx(dir.path()), json!({})).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn timeout_is_marked() {
        let dir = tempfile::tempdir().unwrap();
        let out = BashTool
            .execute(
                &ctx(dir.path()),
                json!({"script": "sleep 30", "timeout_secs": 1}),
            )
            .await;
        assert!(out.is_error);
        assert_eq!(out.output["timed_out"], true);
    }

    #[test]
    fn tool_is_bridgeable() {
        assert!(BashTool.bridgeable());
    }
}
