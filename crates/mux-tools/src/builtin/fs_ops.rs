// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! File access routed through the runtime.
//!
//! The file tools never touch the local filesystem directly: reads and
//! writes run as bash on whatever runtime the workspace uses, so the same
//! tools work against local worktrees and SSH hosts. Writes travel base64-
//! encoded to survive shell quoting.

use base64::Engine;
use mux_runtime::ExecOptions;

use crate::tool::ToolCtx;

pub async fn read_file(ctx: &ToolCtx, path: &str) -> Result<String, String> {
    let script = format!("cat -- {}", shell_quote(path));
    let result = ctx
        .runtime
        .execute_bash(
            &script,
            ExecOptions {
                cwd: Some(ctx.workspace_path.clone()),
                cancel: Some(ctx.cancel.clone()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    if result.exit_code != 0 {
        return Err(format!("cannot read {path}: {}", result.stderr.trim()));
    }
    Ok(result.stdout)
}

pub async fn write_file(ctx: &ToolCtx, path: &str, content: &str) -> Result<(), String> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    let script = format!(
        "mkdir -p \"$(dirname -- {q})\" && printf %s {b64} | base64 -d > {q}",
        q = shell_quote(path),
        b64 = shell_quote(&encoded),
    );
    let result = ctx
        .runtime
        .execute_bash(
            &script,
            ExecOptions {
                cwd: Some(ctx.workspace_path.clone()),
                cancel: Some(ctx.cancel.clone()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    if result.exit_code != 0 {
        return Err(format!("cannot write {path}: {}", result.stderr.trim()));
    }
    Ok(())
}

pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Plan mode may only write inside the plan file.
pub fn plan_mode_write_allowed(ctx: &ToolCtx, path: &str) -> bool {
    if ctx.mode != mux_config::SessionMode::Plan {
        return true;
    }
    ctx.resolve_in_workspace(path) == ctx.plan_path()
}
