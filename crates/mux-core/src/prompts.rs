// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! System-prompt assembly.
//!
//! The system message is rebuilt for every stream from stable workspace
//! facts, the project's AGENTS.md (when present), mode-specific tool
//! instructions, MCP advertisements, and caller-supplied additions.

use std::path::Path;

use mux_config::SessionMode;

/// Stable facts about the workspace the prompt describes.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub workspace_name: String,
    pub workspace_path: String,
    pub project_name: String,
    /// Contents of the project's AGENTS.md, when present.
    pub agents_md: Option<String>,
    /// Names of MCP-sourced tools advertised this turn.
    pub mcp_tool_names: Vec<String>,
    /// Caller-supplied extra instructions appended verbatim.
    pub additional_instructions: Option<String>,
}

impl PromptContext {
    /// Load AGENTS.md from the workspace root if it exists and is UTF-8.
    pub fn load_agents_md(&mut self, workspace_path: &Path) {
        self.agents_md = std::fs::read_to_string(workspace_path.join("AGENTS.md")).ok();
    }
}

/// Build the complete system message for one stream.
pub fn system_prompt(mode: SessionMode, ctx: &PromptContext) -> String {
    let mut out = String::new();
    out.push_str(
        "You are an AI coding agent working inside an isolated git workspace. \
         Make changes with the provided tools; never ask the user to run commands for you.\n\n",
    );

    out.push_str(&format!(
        "Workspace: {} (project {})\nWorking directory: {}\n\n",
        ctx.workspace_name, ctx.project_name, ctx.workspace_path
    ));

    match mode {
        SessionMode::Plan => out.push_str(
            "Mode: plan. Investigate the task and produce an implementation plan. \
             File edits are limited to the plan file (.mux/plan.md). Use propose_plan \
             to present the finished plan and ask_user_question when a decision needs \
             user input. Do not start implementing.\n\n",
        ),
        SessionMode::Exec => out.push_str(
            "Mode: exec. Implement the task. Keep edits minimal and verify your work \
             with the bash tool where practical.\n\n",
        ),
    }

    if let Some(agents) = &ctx.agents_md {
        out.push_str("Project instructions (AGENTS.md):\n");
        out.push_str(agents.trim_end());
        out.push_str("\n\n");
    }

    if !ctx.mcp_tool_names.is_empty() {
        out.push_str("External (MCP) tools available this turn: ");
        out.push_str(&ctx.mcp_tool_names.join(", "));
        out.push_str("\n\n");
    }

    if let Some(extra) = &ctx.additional_instructions {
        out.push_str(extra.trim_end());
        out.push('\n');
    }

    out.trim_end().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PromptContext {
        PromptContext {
            workspace_name: "auth-k3m9".into(),
            workspace_path: "/work/auth-k3m9".into(),
            project_name: "app".into(),
            ..Default::default()
        }
    }

    #[test]
    fn prompt_names_workspace_and_project() {
        let p = system_prompt(SessionMode::Exec, &ctx());
        assert!(p.contains("auth-k3m9"));
        assert!(p.contains("project app"));
        assert!(p.contains("/work/auth-k3m9"));
    }

    #[test]
    fn plan_mode_describes_plan_restrictions() {
        let p = system_prompt(SessionMode::Plan, &ctx());
        assert!(p.contains("Mode: plan"));
        assert!(p.contains(".mux/plan.md"));
        assert!(p.contains("propose_plan"));
    }

    #[test]
    fn exec_mode_has_no_plan_tools_mentioned() {
        let p = system_prompt(SessionMode::Exec, &ctx());
        assert!(p.contains("Mode: exec"));
        assert!(!p.contains("propose_plan"));
    }

    #[test]
    fn agents_md_is_embedded() {
        let mut c = ctx();
        c.agents_md = Some("Always run the linter.".into());
        let p = system_prompt(SessionMode::Exec, &c);
        assert!(p.contains("Always run the linter."));
    }

    #[test]
    fn mcp_tools_are_advertised() {
        let mut c = ctx();
        c.mcp_tool_names = vec!["jira__search".into(), "jira__create".into()];
        let p = system_prompt(SessionMode::Exec, &c);
        assert!(p.contains("jira__search, jira__create"));
    }

    #[test]
    fn additional_instructions_come_last() {
        let mut c = ctx();
        c.additional_instructions = Some("Prefer small commits.".into());
        let p = system_prompt(SessionMode::Exec, &c);
        assert!(p.trim_end().ends_with("Prefer small commits."));
    }

    #[test]
    fn load_agents_md_reads_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "house rules").unwrap();
        let mut c = ctx();
        c.load_agents_md(dir.path());
        assert_eq!(c.agents_md.as_deref(), Some("house rules"));
    }
}
