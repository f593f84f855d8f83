// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Config file loading and the mux home directory layout.
//!
//! ```text
//! ~/.mux/                      (override with MUX_HOME)
//!   config.json                JSONC: projects, providers, defaults
//!   secrets/<project>.json     per-project secret env vars
//!   sessions/<workspace-id>/   chat.jsonl, partial.json (owned by mux-store)
//!   worktrees/                 default base dir for local workspaces
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::schema::Config;

/// Root directory for all persistent mux state.
pub fn mux_home() -> PathBuf {
    if let Ok(home) = std::env::var("MUX_HOME") {
        return PathBuf::from(shellexpand::tilde(&home).into_owned());
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mux")
}

pub fn config_path() -> PathBuf {
    mux_home().join("config.json")
}

/// Per-workspace session files (history, partial) live under here.
pub fn sessions_dir() -> PathBuf {
    mux_home().join("sessions")
}

pub fn secrets_path(project_name: &str) -> PathBuf {
    mux_home().join("secrets").join(format!("{project_name}.json"))
}

/// Load the configuration from `path` (or the default location).
///
/// A missing file yields `Config::default()` — first run needs no setup.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    let raw = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => {
            return Err(e).with_context(|| format!("reading config {}", path.display()));
        }
    };
    let json = strip_jsonc(&raw);
    serde_json::from_str(&json).with_context(|| format!("parsing config {}", path.display()))
}

/// Atomically persist the configuration (write temp, rename over).
pub fn save(config: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(config_path);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let body = serde_json::to_string_pretty(config)?;
    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

/// Load a project's secret environment variables. Missing file → empty map.
pub fn load_secrets(project_name: &str) -> Result<HashMap<String, String>> {
    let path = secrets_path(project_name);
    match fs::read_to_string(&path) {
        Ok(s) => serde_json::from_str(&s)
            .with_context(|| format!("parsing secrets {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(e).with_context(|| format!("reading secrets {}", path.display())),
    }
}

pub fn save_secrets(project_name: &str, secrets: &HashMap<String, String>) -> Result<()> {
    let path = secrets_path(project_name);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(secrets)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Strip JSONC extras so `serde_json` can parse the result: `//` line
/// comments, `/* */` block comments, and trailing commas before a closing
/// bracket. String literals (including escapes) pass through untouched.
pub fn strip_jsonc(input: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        InString,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(input.len());
    let mut state = State::Normal;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '"' => {
                    state = State::InString;
                    out.push(c);
                }
                '/' => match chars.peek() {
                    Some('/') => {
                        chars.next();
                        state = State::LineComment;
                    }
                    Some('*') => {
                        chars.next();
                        state = State::BlockComment;
                    }
                    _ => out.push(c),
                },
                ',' => {
                    // Trailing comma: drop when the next non-whitespace
                    // (ignoring comments would require lookahead; JSONC files
                    // rarely comment between a comma and the bracket) is a
                    // closing bracket.
                    let mut ahead = chars.clone();
                    let mut next_significant = None;
                    for a in ahead.by_ref() {
                        if !a.is_whitespace() {
                            next_significant = Some(a);
                            break;
                        }
                    }
                    match next_significant {
                        Some('}') | Some(']') => {} // swallow the comma
                        _ => out.push(c),
                    }
                }
                _ => out.push(c),
            },
            State::InString => {
                out.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    out.push(c);
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Normal;
                }
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_line_comments() {
        let s = "{\n  // a comment\n  \"a\": 1\n}";
        let v: serde_json::Value = serde_json::from_str(&strip_jsonc(s)).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn strip_block_comments() {
        let s = "{ /* block */ \"a\": 1 }";
        let v: serde_json::Value = serde_json::from_str(&strip_jsonc(s)).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn strip_trailing_commas() {
        let s = "{ \"a\": [1, 2, 3,], }";
        let v: serde_json::Value = serde_json::from_str(&strip_jsonc(s)).unwrap();
        assert_eq!(v["a"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn slashes_inside_strings_survive() {
        let s = r#"{ "url": "https://example.com//x", "p": "a/*b*/c" }"#;
        let v: serde_json::Value = serde_json::from_str(&strip_jsonc(s)).unwrap();
        assert_eq!(v["url"], "https://example.com//x");
        assert_eq!(v["p"], "a/*b*/c");
    }

    #[test]
    fn escaped_quote_does_not_end_string() {
        let s = r#"{ "a": "quote \" // not a comment" }"#;
        let v: serde_json::Value = serde_json::from_str(&strip_jsonc(s)).unwrap();
        assert_eq!(v["a"], "quote \" // not a comment");
    }

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load(Some(&dir.path().join("nope.json"))).unwrap();
        assert!(cfg.projects.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut cfg = Config::default();
        cfg.defaults.model = "anthropic:claude-sonnet-4".into();
        save(&cfg, Some(&path)).unwrap();
        let back = load(Some(&path)).unwrap();
        assert_eq!(back.defaults.model, "anthropic:claude-sonnet-4");
    }

    #[test]
    fn jsonc_config_with_comments_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            "{\n  // default model\n  \"defaults\": { \"model\": \"openai:gpt-4.1\", },\n}",
        )
        .unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.defaults.model, "openai:gpt-4.1");
    }
}
