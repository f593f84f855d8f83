// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Line-oriented file edits: insert after a line, replace a line range.
//!
//! Both tools read-modify-write through the runtime and answer with a
//! unified diff of what changed. In plan mode writes outside the plan file
//! are rejected.

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::TextDiff;

use crate::builtin::fs_ops;
use crate::tool::{Tool, ToolCtx, ToolResult};

/// Insert text after a given line (0 inserts at the top).
#[derive(Default)]
pub struct FileEditInsertTool;

#[async_trait]
impl Tool for FileEditInsertTool {
    fn name(&self) -> &str {
        "file_edit_insert"
    }

    fn description(&self) -> String {
        "Insert text into a file after the given 1-based line number (0 inserts at the top).\n\
         The file must exist unless inserting at line 0 of a new file.\n\
         Returns a unified diff of the change."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace root" },
                "after_line": {
                    "type": "integer",
                    "description": "1-based line to insert after; 0 inserts before the first line"
                },
                "text": { "type": "string", "description": "Text to insert (may be multiple lines)" }
            },
            "required": ["path", "after_line", "text"],
            "additionalProperties": false
        })
    }

    fn bridgeable(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult {
        let (path, text) = match (
            input.get("path").and_then(|v| v.as_str()),
            input.get("text").and_then(|v| v.as_str()),
        ) {
            (Some(p), Some(t)) => (p, t),
            _ => return ToolResult::err("missing required 'path' or 'text' parameter"),
        };
        let Some(after_line) = input.get("after_line").and_then(|v| v.as_u64()) else {
            return ToolResult::err("missing required 'after_line' parameter");
        };
        if !fs_ops::plan_mode_write_allowed(ctx, path) {
            return ToolResult::err(plan_mode_denial(path));
        }

        let old = match fs_ops::read_file(ctx, path).await {
            Ok(c) => c,
            // A new file may be created by inserting at the top.
            Err(_) if after_line == 0 => String::new(),
            Err(e) => return ToolResult::err(e),
        };

        let mut lines: Vec<&str> = old.lines().collect();
        let at = after_line as usize;
        if at > lines.len() {
            return ToolResult::err(format!(
                "after_line {at} is beyond the end of {path} ({} lines)",
                lines.len()
            ));
        }
        let insert: Vec<&str> = text.lines().collect();
        lines.splice(at..at, insert);
        let new = rejoin(&lines, &old);

        finish_write(ctx, path, &old, &new).await
    }
}

/// Replace an inclusive 1-based line range with new text.
#[derive(Default)]
pub struct FileEditReplaceLinesTool;

#[async_trait]
impl Tool for FileEditReplaceLinesTool {
    fn name(&self) -> &str {
        "file_edit_replace_lines"
    }

    fn description(&self) -> String {
        "Replace an inclusive 1-based line range of a file with new text.\n\
         Use file_read first to find the exact line numbers.\n\
         Returns a unified diff of the change."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "File path relative to the workspace root" },
                "start_line": { "type": "integer", "description": "First line to replace (1-based)" },
                "end_line": { "type": "integer", "description": "Last line to replace (inclusive)" },
                "text": { "type": "string", "description": "Replacement text (may be empty to delete lines)" }
            },
            "required": ["path", "start_line", "end_line", "text"],
            "additionalProperties": false
        })
    }

    fn bridgeable(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult {
        let (path, text) = match (
            input.get("path").and_then(|v| v.as_str()),
            input.get("text").and_then(|v| v.as_str()),
        ) {
            (Some(p), Some(t)) => (p, t),
            _ => return ToolResult::err("missing required 'path' or 'text' parameter"),
        };
        let (start, end) = match (
            input.get("start_line").and_then(|v| v.as_u64()),
            input.get("end_line").and_then(|v| v.as_u64()),
        ) {
            (Some(s), Some(e)) if s >= 1 && e >= s => (s as usize, e as usize),
            _ => return ToolResult::err("start_line/end_line must satisfy 1 <= start <= end"),
        };
        if !fs_ops::plan_mode_write_allowed(ctx, path) {
            return ToolResult::err(plan_mode_denial(path));
        }

        let old = match fs_ops::read_file(ctx, path).await {
            Ok(c) => c,
            Err(e) => return ToolResult::err(e),
        };
        let mut lines: Vec<&str> = old.lines().collect();
        if end > lines.len() {
            return ToolResult::err(format!(
                "end_line {end} is beyond the end of {path} ({} lines)",
                lines.len()
            ));
        }
        let replacement: Vec<&str> = if text.is_empty() {
            Vec::new()
        } else {
            text.lines().collect()
        };
        lines.splice(start - 1..end, replacement);
        let new = rejoin(&lines, &old);

        finish_write(ctx, path, &old, &new).await
    }
}

fn plan_mode_denial(path: &str) -> String {
    format!(
        "plan mode only allows edits to the plan file (.mux/plan.md); refusing to write {path}"
    )
}

/// Reassemble lines, preserving the original trailing-newline state.
fn rejoin(lines: &[&str], original: &str) -> String {
    let mut s = lines.join("\n");
    if original.is_empty() || original.ends_with('\n') {
        if !s.is_empty() {
            s.push('\n');
        }
    }
    s
}

async fn finish_write(ctx: &ToolCtx, path: &str, old: &str, new: &str) -> ToolResult {
    if let Err(e) = fs_ops::write_file(ctx, path, new).await {
        return ToolResult::err(e);
    }
    let diff = TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(2)
        .header(path, path)
        .to_string();
    ToolResult::ok(json!({ "path": path, "diff": diff }))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mux_config::SessionMode;
    use std::collections::HashMap;
    use tokio::sync::watch;

    fn ctx_mode(dir: &std::path::Path, mode: SessionMode) -> ToolCtx {
        let (_tx, cancel) = watch::channel(false);
        ToolCtx {
            runtime: mux_runtime::runtime_for(None).unwrap(),
            workspace_path: dir.to_path_buf(),
            mode,
            secrets: HashMap::new(),
            cancel,
        }
    }

    fn ctx(dir: &std::path::Path) -> ToolCtx {
        ctx_mode(dir, SessionMode::Exec)
    }

    #[tokio::test]
    async fn insert_after_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\nthree\n").unwrap();
        let out = FileEditInsertTool
            .execute(
                &ctx(dir.path()),
                json!({"path": "a.txt", "after_line": 1, "text": "two"}),
            )
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        let content = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "one\ntwo\nthree\n");
        assert!(out.output["diff"].as_str().unwrap().contains("+two"));
    }

    #[tokio::test]
    async fn insert_at_zero_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileEditInsertTool
            .execute(
                &ctx(dir.path()),
                json!({"path": "new.txt", "after_line": 0, "text": "hello"}),
            )
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        let content = std::fs::read_to_string(dir.path().join("new.txt")).unwrap();
        assert_eq!(content, "hello\n");
    }

    #[tokio::test]
    async fn insert_beyond_end_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let out = FileEditInsertTool
            .execute(
                &ctx(dir.path()),
                json!({"path": "a.txt", "after_line": 9, "text": "x"}),
            )
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn replace_lines_range() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\nfour\n").unwrap();
        let out = FileEditReplaceLinesTool
            .execute(
                &ctx(dir.path()),
                json!({"path": "a.txt", "start_line": 2, "end_line": 3, "text": "TWO\nTHREE"}),
            )
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        let content = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "one\nTWO\nTHREE\nfour\n");
    }

    #[tokio::test]
    async fn replace_with_empty_deletes_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let out = FileEditReplaceLinesTool
            .execute(
                &ctx(dir.path()),
                json!({"path": "a.txt", "start_line": 2, "end_line": 2, "text": ""}),
            )
            .await;
        assert!(!out.is_error);
        let content = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert_eq!(content, "one\nthree\n");
    }

    #[tokio::test]
    async fn invalid_range_errors() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let out = FileEditReplaceLinesTool
            .execute(
                &ctx(dir.path()),
                json!({"path": "a.txt", "start_line": 3, "end_line": 2, "text": "x"}),
            )
            .await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn plan_mode_rejects_writes_outside_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let out = FileEditInsertTool
            .execute(
                &ctx_mode(dir.path(), SessionMode::Plan),
                json!({"path": "a.txt", "after_line": 0, "text": "x"}),
            )
            .await;
        assert!(out.is_error);
        assert!(out.output["error"]
            .as_str()
            .unwrap()
            .contains("plan mode"));
    }

    #[tokio::test]
    async fn plan_mode_allows_plan_file_writes() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileEditInsertTool
            .execute(
                &ctx_mode(dir.path(), SessionMode::Plan),
                json!({"path": ".mux/plan.md", "after_line": 0, "text": "# Plan"}),
            )
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        let content = std::fs::read_to_string(dir.path().join(".mux/plan.md")).unwrap();
        assert_eq!(content, "# Plan\n");
    }
}
