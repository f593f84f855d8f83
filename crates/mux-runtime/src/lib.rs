// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Filesystem + process execution abstraction for workspaces.
//!
//! A [`Runtime`] owns the namespace a workspace lives in: it creates, forks,
//! renames, and deletes worktree directories, resolves paths, runs bash, and
//! streams init-hook output. Instances are cheap and created per operation
//! from the workspace's runtime config; they hold no cross-session state.

pub mod bash;
mod local;
mod ssh;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use mux_config::RuntimeConfig;

pub use bash::{ExecOptions, ExecResult, OverflowPolicy};
pub use local::LocalRuntime;
pub use ssh::SshRuntime;

/// Callback receiving init-hook output line by line.
pub type InitSink = Arc<dyn Fn(&str, bool) + Send + Sync>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Directory or branch collision on create/fork; the engine retries with
    /// a fresh name suffix.
    #[error("Workspace already exists")]
    WorkspaceExists,
    #[error("workspace has uncommitted changes; pass force to delete anyway")]
    DirtyWorkspace,
    #[error("path not found: {0}")]
    PathNotFound(String),
    #[error("git failed: {0}")]
    Git(String),
    #[error("runtime not supported on this host: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct CreateWorkspaceRequest {
    pub project_path: PathBuf,
    pub branch_name: String,
    pub directory_name: String,
    pub trunk_branch: String,
}

#[derive(Debug, Clone)]
pub struct ForkWorkspaceRequest {
    pub project_path: PathBuf,
    pub source_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone)]
pub struct RenamedPaths {
    pub old_path: PathBuf,
    pub new_path: PathBuf,
}

/// The capability set every runtime variant implements.
#[async_trait]
pub trait Runtime: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Expand `~` and return an absolute path in the runtime's namespace.
    async fn resolve_path(&self, path: &str) -> Result<PathBuf, RuntimeError>;

    /// Where a workspace with this name would live.
    fn workspace_path(&self, project_path: &Path, name: &str) -> PathBuf;

    /// Create a new worktree off the trunk branch.
    async fn create_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<PathBuf, RuntimeError>;

    /// Create a new worktree at the source workspace's HEAD. Chat history is
    /// NOT copied here — session files are a core-layer concern.
    async fn fork_workspace(&self, req: &ForkWorkspaceRequest) -> Result<PathBuf, RuntimeError>;

    /// Rename directory + branch. A same-name rename is a successful no-op.
    async fn rename_workspace(
        &self,
        project_path: &Path,
        old_name: &str,
        new_name: &str,
    ) -> Result<RenamedPaths, RuntimeError>;

    /// Remove the worktree. Refuses when dirty unless `force`; deleting an
    /// already-deleted workspace succeeds.
    async fn delete_workspace(
        &self,
        project_path: &Path,
        name: &str,
        force: bool,
    ) -> Result<(), RuntimeError>;

    /// Run the project's post-create hook, streaming output into `sink`.
    /// Returns the hook's exit code (0 when no hook is configured).
    async fn init_workspace(
        &self,
        project_path: &Path,
        workspace_path: &Path,
        sink: InitSink,
    ) -> Result<i32, RuntimeError>;

    /// Execute a bash script with the runtime's env hygiene applied.
    async fn execute_bash(
        &self,
        script: &str,
        opts: ExecOptions,
    ) -> Result<ExecResult, RuntimeError>;

    /// Local branches of the project repository.
    async fn list_branches(&self, project_path: &Path) -> Result<Vec<String>, RuntimeError>;
}

/// Construct the runtime for a workspace's config.
///
/// Docker/devcontainer configs parse and persist, but cannot be driven on
/// this host — the engine surfaces that as the `incompatible_runtime`
/// marker on the workspace identity.
pub fn runtime_for(config: Option<&RuntimeConfig>) -> Result<Arc<dyn Runtime>, RuntimeError> {
    match config.cloned().unwrap_or_default() {
        RuntimeConfig::Local { src_base_dir } => Ok(Arc::new(LocalRuntime::new(src_base_dir))),
        RuntimeConfig::Ssh {
            host,
            port,
            user,
            identity_file,
        } => Ok(Arc::new(SshRuntime::new(host, port, user, identity_file))),
        RuntimeConfig::Docker { .. } => Err(RuntimeError::Unsupported("docker")),
        RuntimeConfig::Devcontainer { .. } => Err(RuntimeError::Unsupported("devcontainer")),
    }
}

/// Environment forced into every bash invocation so child processes never
/// block on an editor or credential prompt.
pub(crate) fn hygiene_env(secrets: &HashMap<String, String>) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = vec![
        ("EDITOR".into(), "true".into()),
        ("GIT_EDITOR".into(), "true".into()),
        ("GIT_SEQUENCE_EDITOR".into(), "true".into()),
        ("VISUAL".into(), "true".into()),
        ("GIT_TERMINAL_PROMPT".into(), "0".into()),
    ];
    for (k, v) in secrets {
        env.push((k.clone(), v.clone()));
    }
    env
}

pub(crate) const DEFAULT_BASH_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Unit tests ──────────────────────────────────────────────────────────────
