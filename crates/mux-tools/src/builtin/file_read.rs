// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::builtin::fs_ops;
use crate::tool::{Tool, ToolCtx, ToolResult};

/// Read a file (or a line window of it) through the workspace runtime.
#[derive(Default)]
pub struct FileReadTool;

#[async_trait]
impl Tool for FileReadTool {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> String {
        "Read a file from the workspace. Returns numbered lines.\n\
         Use offset/limit for large files; the plan file (.mux/plan.md) is always readable."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path relative to the workspace root (or absolute)"
                },
                "offset": {
                    "type": "integer",
                    "description": "1-based first line to return (optional)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to return (optional)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        })
    }

    fn bridgeable(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult {
        let Some(path) = input.get("path").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing required 'path' parameter");
        };
        let offset = input.get("offset").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
        let limit = input.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize);

        let content = match fs_ops::read_file(ctx, path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(e),
        };

        let all: Vec<&str> = content.lines().collect();
        let start = offset.saturating_sub(1).min(all.len());
        let end = limit
            .map(|l| (start + l).min(all.len()))
            .unwrap_or(all.len());
        let numbered: String = all[start..end]
            .iter()
            .enumerate()
            .map(|(i, line)| format!("{:>6}\t{line}\n", start + i + 1))
            .collect();

        ToolResult::ok(json!({
            "path": path,
            "total_lines": all.len(),
            "content": numbered,
        }))
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
    async fn reads_whole_file_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let out = FileReadTool
            .execute(&ctx(dir.path()), json!({"path": "a.txt"}))
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        assert_eq!(out.output["total_lines"], 3);
        let content = out.output["content"].as_str().unwrap();
        assert!(content.contains("1\tone"));
        assert!(content.contains("3\tthree"));
    }

    #[tokio::test]
    async fn offset_and_limit_window_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let out = FileReadTool
            .execute(
                &ctx(dir.path()),
                json!({"path": "a.txt", "offset": 2, "limit": 2}),
            )
            .await;
        let content = out.output["content"].as_str().unwrap();
        assert!(content.contains("2\ttwo"));
        assert!(content.contains("3\tthree"));
        assert!(!content.contains("one"));
        assert!(!content.contains("four"));
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileReadTool
            .execute(&ctx(dir.path()), json!({"path": "nope.txt"}))
            .await;
        assert!(out.is_error);
    }
}
