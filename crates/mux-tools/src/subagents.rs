// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Subagent discovery from filesystem configuration.
//!
//! Definitions are JSON files under `.mux/agents/` in the workspace and
//! under the mux home. A definition may name a `base` agent; its `runnable`
//! flag is inherited from the base when not set explicitly. Workspace
//! definitions shadow home definitions of the same name.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::warn;
use walkdir::WalkDir;

/// A resolved subagent available to the `task` dispatch tool.
#[derive(Debug, Clone, PartialEq)]
pub struct SubagentDef {
    pub name: String,
    pub description: String,
    pub runnable: bool,
    /// Optional system-prompt override for the nested session.
    pub system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSubagent {
    name: String,
    #[serde(default)]
    description: String,
    /// Absent → inherited from `base`, defaulting to `true`.
    #[serde(default)]
    runnable: Option<bool>,
    #[serde(default)]
    base: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
}

/// Scan the workspace and home agent directories and resolve inheritance.
pub fn discover_subagents(workspace_path: &Path) -> Vec<SubagentDef> {
    let mut raw: HashMap<String, RawSubagent> = HashMap::new();
    // Home first so workspace definitions shadow them.
    for dir in [
        mux_config::mux_home().join("agents"),
        workspace_path.join(".mux").join("agents"),
    ] {
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir)
            .max_depth(1)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|s| serde_json::from_str::<RawSubagent>(&s).map_err(|e| e.to_string()))
            {
                Ok(agent) => {
                    raw.insert(agent.name.clone(), agent);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed subagent definition");
                }
            }
        }
    }

    let mut resolved: Vec<SubagentDef> = raw
        .values()
        .map(|agent| SubagentDef {
            name: agent.name.clone(),
            description: agent.description.clone(),
            runnable: resolve_runnable(agent, &raw, 0),
            system_prompt: agent.system_prompt.clone(),
        })
        .collect();
    resolved.sort_by(|a, b| a.name.cmp(&b.name));
    resolved
}

/// Follow the `base` chain for an unset `runnable` flag. Depth-capped so a
/// definition cycle cannot loop forever.
fn resolve_runnable(agent: &RawSubagent, all: &HashMap<String, RawSubagent>, depth: u8) -> bool {
    if let Some(runnable) = agent.runnable {
        return runnable;
    }
    if depth >= 8 {
        return true;
    }
    match agent.base.as_ref().and_then(|b| all.get(b)) {
        Some(base) => resolve_runnable(base, all, depth + 1),
        None => true,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn write_agent(dir: &Path, name: &str, body: serde_json::Value) {
        let agents = dir.join(".mux").join("agents");
        std::fs::create_dir_all(&agents).unwrap();
        std::fs::write(
            agents.join(format!("{name}.json")),
            serde_json::to_string_pretty(&body).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn discovers_workspace_agents_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "reviewer",
            serde_json::json!({"name": "reviewer", "description": "reviews diffs"}),
        );
        write_agent(
            dir.path(),
            "explorer",
            serde_json::json!({"name": "explorer", "description": "maps the repo"}),
        );
        let agents = discover_subagents(dir.path());
        let names: Vec<&str> = agents.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["explorer", "reviewer"]);
        assert!(agents.iter().all(|a| a.runnable));
    }

    #[test]
    fn runnable_flag_inherits_from_base() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "abstract-base",
            serde_json::json!({"name": "abstract-base", "runnable": false}),
        );
        write_agent(
            dir.path(),
            "child",
            serde_json::json!({"name": "child", "base": "abstract-base"}),
        );
        write_agent(
            dir.path(),
            "override",
            serde_json::json!({"name": "override", "base": "abstract-base", "runnable": true}),
        );
        let agents = discover_subagents(dir.path());
        let get = |n: &str| agents.iter().find(|a| a.name == n).unwrap();
        assert!(!get("abstract-base").runnable);
        assert!(!get("child").runnable, "inherited from base");
        assert!(get("override").runnable, "explicit flag wins");
    }

    #[test]
    fn malformed_definition_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let agents_dir = dir.path().join(".mux").join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();
        std::fs::write(agents_dir.join("broken.json"), "{not json").unwrap();
        write_agent(
            dir.path(),
            "good",
            serde_json::json!({"name": "good"}),
        );
        let agents = discover_subagents(dir.path());
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "good");
    }

    #[test]
    fn missing_directory_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_subagents(dir.path()).is_empty());
    }

    #[test]
    fn base_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        write_agent(
            dir.path(),
            "a",
            serde_json::json!({"name": "a", "base": "b"}),
        );
        write_agent(
            dir.path(),
            "b",
            serde_json::json!({"name": "b", "base": "a"}),
        );
        let agents = discover_subagents(dir.path());
        assert_eq!(agents.len(), 2);
    }
}
