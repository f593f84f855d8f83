// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mux_runtime::ExecOptions;

use crate::builtin::fs_ops;
use crate::tool::{Tool, ToolCtx, ToolResult};

const EXEC_TIMEOUT: Duration = Duration::from_secs(60);

/// Experiment-gated sandboxed script execution.
///
/// In *supplement* mode this runs alongside the normal tool set; in
/// *exclusive* mode it replaces the bridgeable tools (bash, file ops) and
/// the model drives everything through scripts.
#[derive(Default)]
pub struct CodeExecutionTool;

#[async_trait]
impl Tool for CodeExecutionTool {
    fn name(&self) -> &str {
        "code_execution"
    }

    fn description(&self) -> String {
        "Execute a short python3 script in the workspace and return its output.\n\
         The script runs with the workspace as working directory, a 60s timeout,\n\
         and no interactive input. Print anything you need back."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "code": { "type": "string", "description": "python3 source to execute" }
            },
            "required": ["code"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult {
        let Some(code) = input.get("code").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing required 'code' parameter");
        };
        // Hand the source over via stdin-safe quoting, not argv.
        let script = format!("python3 -c {}", fs_ops::shell_quote(code));
        let result = ctx
            .runtime
            .execute_bash(
                &script,
                ExecOptions {
                    cwd: Some(ctx.workspace_path.clone()),
                    secrets: ctx.secrets.clone(),
                    timeout: Some(EXEC_TIMEOUT),
                    cancel: Some(ctx.cancel.clone()),
                    ..Default::default()
                },
            )
            .await;
        match result {
            Ok(r) => {
                let output = json!({
                    "exit_code": r.exit_code,
                    "stdout": r.stdout,
                    "stderr": r.stderr,
                });
                ToolResult {
                    output,
                    is_error: r.exit_code != 0,
                }
            }
            Err(e) => ToolResult::err(format!("code execution failed: {e}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mux_config::SessionMode;
    use std::collections::HashMap;
    use tokio::sync::watch;

    fn ctx(dir: &std::path::Path) -> ToolCtx {
        let (_tx, cancel) = watch::channel(false);
        ToolCtx {
            runtime: mux_runtime::runtime_for(None).unwrap(),
            workspace_path: dir.to_path_buf(),
            mode: SessionMode::Exec,
            secrets: HashMap::new(),
            cancel,
        }
    }

    #[tokio::test]
    async fn executes_python_and_captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = CodeExecutionTool
            .execute(&ctx(dir.path()), json!({"code": "print(2 + 2)"}))
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        assert_eq!(out.output["stdout"].as_str().unwrap().trim(), "4");
    }

    #[tokio::test]
    async fn missing_code_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = CodeExecutionTool.execute(&ctx(dir.path()), json!({})).await;
        assert!(out.is_error);
    }
}
