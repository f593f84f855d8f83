// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Plan-mode tools: propose a plan, ask the user structured questions.
//!
//! Both are offered only in plan mode. Question answers arrive on a later
//! user turn — the engine has no interactive stdin, so the tool records the
//! question set as its output for the host UI to render.

use async_trait::async_trait;
use serde_json::{json, Value};

use mux_config::SessionMode;

use crate::builtin::fs_ops;
use crate::tool::{Tool, ToolCtx, ToolResult};

/// Write the proposed plan into the plan file for user review.
#[derive(Default)]
pub struct ProposePlanTool;

#[async_trait]
impl Tool for ProposePlanTool {
    fn name(&self) -> &str {
        "propose_plan"
    }

    fn description(&self) -> String {
        "Present the implementation plan for user approval. Writes the plan to the plan\n\
         file (.mux/plan.md), replacing any previous proposal. Call this once the plan\n\
         is complete; the user reviews it before execution starts."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "plan": {
                    "type": "string",
                    "description": "The full plan in markdown"
                }
            },
            "required": ["plan"],
            "additionalProperties": false
        })
    }

    fn modes(&self) -> &[SessionMode] {
        &[SessionMode::Plan]
    }

    async fn execute(&self, ctx: &ToolCtx, input: Value) -> ToolResult {
        let Some(plan) = input.get("plan").and_then(|v| v.as_str()) else {
            return ToolResult::err("missing required 'plan' parameter");
        };
        let plan_path = ctx.plan_path();
        let rel = plan_path.to_string_lossy().into_owned();
        match fs_ops::write_file(ctx, &rel, plan).await {
            Ok(()) => ToolResult::ok(json!({
                "status": "proposed",
                "plan_path": rel,
            })),
            Err(e) => ToolResult::err(e),
        }
    }
}

/// Ask the user one or more structured multiple-choice questions.
#[derive(Default)]
pub struct AskUserQuestionTool;

#[async_trait]
impl Tool for AskUserQuestionTool {
    fn name(&self) -> &str {
        "ask_user_question"
    }

    fn description(&self) -> String {
        "Ask the user structured questions before committing to a plan.\n\
         Each question needs a prompt and at least two options. The answers arrive\n\
         in the user's next message; do not repeat a question that was answered."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "prompt": { "type": "string" },
                            "options": {
                                "type": "array",
                                "items": { "type": "string" },
                                "minItems": 2
                            },
                            "allow_multiple": { "type": "boolean" }
                        },
                        "required": ["prompt", "options"]
                    },
                    "minItems": 1
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        })
    }

    fn modes(&self) -> &[SessionMode] {
        &[SessionMode::Plan]
    }

    async fn execute(&self, _ctx: &ToolCtx, input: Value) -> ToolResult {
        let Some(questions) = input.get("questions").and_then(|v| v.as_array()) else {
            return ToolResult::err("missing required 'questions' parameter");
        };
        if questions.is_empty() {
            return ToolResult::err("'questions' must contain at least one question");
        }
        for (i, q) in questions.iter().enumerate() {
            if q.get("prompt").and_then(|v| v.as_str()).is_none() {
                return ToolResult::err(format!("question {i} is missing 'prompt'"));
            }
            let options = q.get("options").and_then(|v| v.as_array());
            if options.map(|o| o.len()).unwrap_or(0) < 2 {
                return ToolResult::err(format!("question {i} needs at least two options"));
            }
        }
        ToolResult::ok(json!({
            "status": "asked",
            "questions": questions,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::watch;

    fn plan_ctx(dir: &std::path::Path) -> ToolCtx {
        let (_tx, cancel) = watch::channel(false);
        ToolCtx {
            runtime: mux_runtime::runtime_for(None).unwrap(),
            workspace_path: dir.to_path_buf(),
            mode: SessionMode::Plan,
            secrets: HashMap::new(),
            cancel,
        }
    }

    #[tokio::test]
    async fn propose_plan_writes_plan_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProposePlanTool
            .execute(&plan_ctx(dir.path()), json!({"plan": "# Step 1\ndo things"}))
            .await;
        assert!(!out.is_error, "{:?}", out.output);
        let content = std::fs::read_to_string(dir.path().join(".mux/plan.md")).unwrap();
        assert!(content.contains("# Step 1"));
    }

    #[tokio::test]
    async fn propose_plan_replaces_previous_plan() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = plan_ctx(dir.path());
        ProposePlanTool
            .execute(&ctx, json!({"plan": "old"}))
            .await;
        ProposePlanTool
            .execute(&ctx, json!({"plan": "new"}))
            .await;
        let content = std::fs::read_to_string(dir.path().join(".mux/plan.md")).unwrap();
        assert_eq!(content, "new");
    }

    #[test]
    fn plan_tools_are_plan_mode_only() {
        assert_eq!(ProposePlanTool.modes(), &[SessionMode::Plan]);
        assert_eq!(AskUserQuestionTool.modes(), &[SessionMode::Plan]);
    }

    #[tokio::test]
    async fn ask_question_echoes_valid_questions() {
        let dir = tempfile::tempdir().unwrap();
        let out = AskUserQuestionTool
            .execute(
                &plan_ctx(dir.path()),
                json!({"questions": [{"prompt": "Which db?", "options": ["sqlite", "postgres"]}]}),
            )
            .await;
        assert!(!out.is_error);
        assert_eq!(out.output["status"], "asked");
    }

    #[tokio::test]
    async fn ask_question_rejects_single_option() {
        let dir = tempfile::tempdir().unwrap();
        let out = AskUserQuestionTool
            .execute(
                &plan_ctx(dir.path()),
                json!({"questions": [{"prompt": "?", "options": ["only"]}]}),
            )
            .await;
        assert!(out.is_error);
    }
}
