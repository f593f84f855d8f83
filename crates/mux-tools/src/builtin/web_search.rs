// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::tool::{Tool, ToolCtx, ToolResult};

const SEARCH_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// Real-time web search. Only registered when an API key is configured.
pub struct WebSearchTool {
    api_key: String,
}

impl WebSearchTool {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> String {
        "Real-time web search. count: 1-10 (default 5).\n\
         Include the current year in queries for recent info.\n\
         ALWAYS cite sources after answering:\n\
         Sources:\n\
         - [Title](URL)"
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "count": {
                    "type": "integer",
                    "description": "Number of results to return (default 5, max 10)"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, _ctx: &ToolCtx, input: Value) -> ToolResult {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing required 'query' parameter");
        };
        let count = input
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(5)
            .clamp(1, 10);

        debug!(query = %query, count, "web_search tool");
        match search(&self.api_key, query, count).await {
            Ok(results) => ToolResult::ok(json!({ "results": results })),
            Err(e) => ToolResult::err(format!("search failed: {e}")),
        }
    }
}

async fn search(api_key: &str, query: &str, count: u64) -> anyhow::Result<Vec<Value>> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(15))
        .build()?;
    let resp = client
        .get(SEARCH_ENDPOINT)
        .query(&[("q", query), ("count", &count.to_string())])
        .header("X-Subscription-Token", api_key)
        .header("Accept", "application/json")
        .send()
        .await?;
    if !resp.status().is_success() {
        anyhow::bail!("search API returned {}", resp.status());
    }
    let body: Value = resp.json().await?;
    let results = body["web"]["results"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .take(count as usize)
                .map(|item| {
                    json!({
                        "title": item["title"],
                        "url": item["url"],
                        "description": item["description"],
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(results)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mux_config::SessionMode;
    use std::collections::HashMap;
    use tokio::sync::watch;

    #[tokio::test]
    async fn missing_query_is_an_error() {
        let (_tx, cancel) = watch::channel(false);
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolCtx {
            runtime: mux_runtime::runtime_for(None).unwrap(),
            workspace_path: dir.path().to_path_buf(),
            mode: SessionMode::Exec,
            secrets: HashMap::new(),
            cancel,
        };
        let out = WebSearchTool::new("key".into())
            .execute(&ctx, json!({}))
            .await;
        assert!(out.is_error);
    }

    #[test]
    fn schema_requires_query() {
        let schema = WebSearchTool::new("key".into()).input_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|v| v.as_str() == Some("query")));
    }
}
