// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Adapter for already-materialized MCP tools.
//!
//! The engine never speaks the MCP protocol itself — the host hands it tool
//! definitions plus an execution callback, and this adapter makes them look
//! like any other [`Tool`] in the catalog.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;

use crate::tool::{Tool, ToolCtx, ToolResult};

pub type McpHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, ToolResult> + Send + Sync>;

pub struct McpTool {
    name: String,
    description: String,
    input_schema: Value,
    handler: McpHandler,
}

impl McpTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: McpHandler,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler,
        }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn input_schema(&self) -> Value {
        self.input_schema.clone()
    }

    async fn execute(&self, _ctx: &ToolCtx, input: Value) -> ToolResult {
        (self.handler)(input).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mux_config::SessionMode;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::watch;

    #[tokio::test]
    async fn mcp_tool_delegates_to_handler() {
        let handler: McpHandler = Arc::new(|input| {
            Box::pin(async move {
                ToolResult::ok(json!({ "echo": input }))
            })
        });
        let tool = McpTool::new(
            "server__echo",
            "echoes",
            json!({"type": "object"}),
            handler,
        );

        let (_tx, cancel) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolCtx {
            runtime: mux_runtime::runtime_for(None).unwrap(),
            workspace_path: dir.path().to_path_buf(),
            mode: SessionMode::Exec,
            secrets: HashMap::new(),
            cancel,
        };
        let out = tool.execute(&ctx, json!({"x": 1})).await;
        assert!(!out.is_error);
        assert_eq!(out.output["echo"]["x"], 1);
        assert_eq!(tool.name(), "server__echo");
        assert!(!tool.bridgeable());
    }
}
