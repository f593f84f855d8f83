// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::{
    config_path, load, load_secrets, mux_home, save, save_secrets, secrets_path, sessions_dir,
    strip_jsonc,
};
pub use schema::{
    AiDefaults, AiSettings, Config, Experiments, ProjectConfig, ProviderConfig, RuntimeConfig,
    SessionMode, ThinkingLevel, ToolPolicyConfig, WorkspaceEntry,
};
