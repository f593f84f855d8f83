// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so fields that should be enabled unless explicitly
/// disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_cap_ms() -> u64 {
    60_000
}

/// The mode a single assistant response runs in.
///
/// Mode is a property of the *next* response, selected at send time: `plan`
/// enables the planning tools and restricts file edits to the plan file,
/// `exec` is the normal tool-using mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Plan,
    #[default]
    Exec,
}

/// Requested reasoning effort forwarded to providers that support it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
}

/// Top-level configuration persisted as JSONC under the mux home.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Projects known to this host, each carrying its workspaces.
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
    /// Named AI provider endpoints, keyed by provider id ("openai",
    /// "anthropic", or any custom name referenced in model strings).
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub defaults: AiDefaults,
    #[serde(default)]
    pub experiments: Experiments,
}

impl Config {
    pub fn project(&self, path: &str) -> Option<&ProjectConfig> {
        self.projects.iter().find(|p| p.path == path)
    }

    pub fn project_mut(&mut self, path: &str) -> Option<&mut ProjectConfig> {
        self.projects.iter_mut().find(|p| p.path == path)
    }
}

/// One project (a git repository) and the workspaces forked off it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Absolute path to the project root (the repo worktrees fork from).
    pub path: String,
    /// Display name; defaults to the last path component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Base branch for new worktrees. Defaults to "main".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunk_branch: Option<String>,
    #[serde(default)]
    pub workspaces: Vec<WorkspaceEntry>,
}

impl ProjectConfig {
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            std::path::Path::new(&self.path)
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| self.path.clone())
        })
    }

    pub fn trunk(&self) -> &str {
        self.trunk_branch.as_deref().unwrap_or("main")
    }
}

/// Persisted identity of one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    /// Stable opaque id (uuid).
    pub id: String,
    /// Git-branch-safe human name: `[a-z0-9-]+`, 2–20 chars, ending in a
    /// 4-char Crockford-base32 suffix assigned at create time.
    pub name: String,
    /// Absolute workspace path in the runtime's namespace.
    pub path: String,
    pub created_at: DateTime<Utc>,
    /// Display title; defaults to the name without its suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeConfig>,
    /// Set when the configured runtime cannot be constructed on this host
    /// (e.g. a docker workspace opened where only local/ssh are available).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incompatible_runtime: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai: Option<AiSettings>,
}

/// Where a workspace's filesystem and processes live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuntimeConfig {
    Local {
        /// Base directory under which workspace worktrees are created.
        /// Defaults to `<mux home>/worktrees`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src_base_dir: Option<String>,
    },
    Ssh {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity_file: Option<String>,
    },
    Docker {
        image: String,
    },
    Devcontainer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        config_path: Option<String>,
    },
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::Local { src_base_dir: None }
    }
}

/// Per-workspace AI settings, overriding [`AiDefaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiSettings {
    /// Model string in `provider:model` form, e.g. `openai:gpt-4.1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<SessionMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_policy: Option<ToolPolicyConfig>,
}

/// Allow/deny tool filter. `deny` always wins over `allow`; an absent
/// `allow` admits every resolved tool not denied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPolicyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow: Option<Vec<String>>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Process-wide AI defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDefaults {
    #[serde(default = "AiDefaults::default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Automatically retry transient stream failures.
    #[serde(default = "default_true")]
    pub auto_retry: bool,
    /// First retry delay; doubles per attempt.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// Ceiling for the exponential backoff.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// Endpoint for the `web_search` tool; the tool is omitted when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_api_key_env: Option<String>,
}

impl Default for AiDefaults {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            max_output_tokens: None,
            auto_retry: true,
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            web_search_api_key_env: None,
        }
    }
}

impl AiDefaults {
    fn default_model() -> String {
        "openai:gpt-4.1".to_string()
    }
}

/// One AI provider endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL override; hosted providers get a sensible default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Explicit API key; prefer `api_key_env` in version-controlled files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the API key (read at request time).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    /// Disable this provider without removing its configuration.
    #[serde(default)]
    pub disabled: bool,
}

impl ProviderConfig {
    /// Resolve the API key: explicit value first, then the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            self.api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok())
        })
    }
}

/// Feature gates for not-yet-default behavior.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Experiments {
    /// Enable the sandboxed `code_execution` tool.
    #[serde(default)]
    pub code_execution: bool,
    /// Run code execution *exclusively*: bridgeable tools (bash, file ops)
    /// are replaced by the code-execution tool; non-bridgeable tools stay.
    #[serde(default)]
    pub code_execution_exclusive: bool,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_default_config() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert!(c.projects.is_empty());
        assert!(c.defaults.auto_retry);
        assert_eq!(c.defaults.retry_base_ms, 1_000);
        assert_eq!(c.defaults.retry_cap_ms, 60_000);
    }

    #[test]
    fn runtime_config_round_trips_tagged() {
        let rc = RuntimeConfig::Ssh {
            host: "build-host".into(),
            port: Some(2222),
            user: None,
            identity_file: None,
        };
        let json = serde_json::to_string(&rc).unwrap();
        assert!(json.contains("\"type\":\"ssh\""), "{json}");
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rc);
    }

    #[test]
    fn local_runtime_omits_absent_base_dir() {
        let rc = RuntimeConfig::default();
        let json = serde_json::to_string(&rc).unwrap();
        assert!(!json.contains("src_base_dir"), "{json}");
    }

    #[test]
    fn docker_config_parses_but_is_distinct() {
        let rc: RuntimeConfig =
            serde_json::from_str(r#"{"type":"docker","image":"ubuntu:24.04"}"#).unwrap();
        assert!(matches!(rc, RuntimeConfig::Docker { .. }));
    }

    #[test]
    fn workspace_entry_round_trips() {
        let ws = WorkspaceEntry {
            id: "w1".into(),
            name: "auth-k3m9".into(),
            path: "/work/auth-k3m9".into(),
            created_at: Utc::now(),
            title: None,
            runtime: None,
            incompatible_runtime: false,
            ai: None,
        };
        let json = serde_json::to_string(&ws).unwrap();
        // false marker must not be serialized
        assert!(!json.contains("incompatible_runtime"), "{json}");
        let back: WorkspaceEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "auth-k3m9");
    }

    #[test]
    fn project_trunk_defaults_to_main() {
        let p = ProjectConfig {
            path: "/src/app".into(),
            name: None,
            trunk_branch: None,
            workspaces: vec![],
        };
        assert_eq!(p.trunk(), "main");
        assert_eq!(p.display_name(), "app");
    }

    #[test]
    fn session_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SessionMode::Plan).unwrap(), "\"plan\"");
        assert_eq!(serde_json::to_string(&SessionMode::Exec).unwrap(), "\"exec\"");
    }

    #[test]
    fn provider_key_prefers_explicit_value() {
        let p = ProviderConfig {
            api_key: Some("sk-explicit".into()),
            api_key_env: Some("PATH".into()), // set in any environment
            ..Default::default()
        };
        assert_eq!(p.resolve_api_key().as_deref(), Some("sk-explicit"));
    }
}
