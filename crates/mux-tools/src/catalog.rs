// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Effective tool-set resolution.
//!
//! Given the (model, mode, workspace, runtime) tuple the session is about to
//! stream with, produce the ordered tool list: built-ins, optional
//! web-search, the experiment-gated code-execution tool, caller-supplied
//! extras (the `task` dispatch tool), and MCP-sourced tools — then apply the
//! mode filter and the allow/deny policy.

use std::sync::Arc;

use mux_config::{Experiments, SessionMode};

use crate::builtin::bash::BashTool;
use crate::builtin::code_execution::CodeExecutionTool;
use crate::builtin::file_edit::{FileEditInsertTool, FileEditReplaceLinesTool};
use crate::builtin::file_read::FileReadTool;
use crate::builtin::plan::{AskUserQuestionTool, ProposePlanTool};
use crate::builtin::web_search::WebSearchTool;
use crate::policy::ToolPolicy;
use crate::tool::Tool;

pub struct ResolveParams {
    pub mode: SessionMode,
    pub experiments: Experiments,
    /// Key for the web-search tool; the tool is omitted when `None`.
    pub web_search_api_key: Option<String>,
    /// Already-materialized MCP tools supplied by the host.
    pub mcp_tools: Vec<Arc<dyn Tool>>,
    /// Host-provided additions (e.g. the subagent-dispatch tool).
    pub extra_tools: Vec<Arc<dyn Tool>>,
    pub policy: ToolPolicy,
}

impl Default for ResolveParams {
    fn default() -> Self {
        Self {
            mode: SessionMode::Exec,
            experiments: Experiments::default(),
            web_search_api_key: None,
            mcp_tools: Vec::new(),
            extra_tools: Vec::new(),
            policy: ToolPolicy::default(),
        }
    }
}

/// Resolve the ordered effective tool set.
pub fn resolve_tools(params: ResolveParams) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(BashTool),
        Arc::new(FileReadTool),
        Arc::new(FileEditInsertTool),
        Arc::new(FileEditReplaceLinesTool),
        Arc::new(ProposePlanTool),
        Arc::new(AskUserQuestionTool),
    ];
    if let Some(key) = params.web_search_api_key {
        tools.push(Arc::new(WebSearchTool::new(key)));
    }
    if params.experiments.code_execution {
        if params.experiments.code_execution_exclusive {
            // Exclusive mode: the code-execution tool replaces every
            // bridgeable tool; non-bridgeable tools are kept.
            tools.retain(|t| !t.bridgeable());
        }
        tools.push(Arc::new(CodeExecutionTool));
    }
    tools.extend(params.extra_tools);
    tools.extend(params.mcp_tools);

    tools
        .into_iter()
        .filter(|t| t.modes().contains(&params.mode))
        .filter(|t| params.policy.allows(t.name()))
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
