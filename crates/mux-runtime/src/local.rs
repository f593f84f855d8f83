// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local runtime: workspaces are git worktrees under a base directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::bash::{run_bash, ExecOptions, ExecResult};
use crate::{
    CreateWorkspaceRequest, ForkWorkspaceRequest, InitSink, RenamedPaths, Runtime, RuntimeError,
};

/// Relative path of the optional post-create hook inside a project.
const INIT_HOOK: &str = ".mux/init";

pub struct LocalRuntime {
    src_base_dir: PathBuf,
}

impl LocalRuntime {
    pub fn new(src_base_dir: Option<String>) -> Self {
        let base = src_base_dir
            .map(|s| PathBuf::from(shellexpand::tilde(&s).into_owned()))
            .unwrap_or_else(|| mux_config::mux_home().join("worktrees"));
        Self { src_base_dir: base }
    }

    async fn git(&self, cwd: &Path, args: &[&str]) -> Result<String, RuntimeError> {
        debug!(?args, cwd = %cwd.display(), "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_EDITOR", "true")
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            if stderr.contains("already exists") {
                Err(RuntimeError::WorkspaceExists)
            } else {
                Err(RuntimeError::Git(stderr.trim().to_string()))
            }
        }
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn resolve_path(&self, path: &str) -> Result<PathBuf, RuntimeError> {
        let expanded = shellexpand::tilde(path).into_owned();
        let p = PathBuf::from(&expanded);
        let absolute = if p.is_absolute() {
            p
        } else {
            std::env::current_dir()?.join(p)
        };
        std::fs::canonicalize(&absolute)
            .map_err(|_| RuntimeError::PathNotFound(path.to_string()))
    }

    fn workspace_path(&self, project_path: &Path, name: &str) -> PathBuf {
        let project = project_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        self.src_base_dir.join(project).join(name)
    }

    async fn create_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<PathBuf, RuntimeError> {
        let path = self.workspace_path(&req.project_path, &req.directory_name);
        if path.exists() {
            return Err(RuntimeError::WorkspaceExists);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().to_string();
        self.git(
            &req.project_path,
            &[
                "worktree",
                "add",
                "-b",
                &req.branch_name,
                &path_str,
                &req.trunk_branch,
            ],
        )
        .await?;
        Ok(path)
    }

    async fn fork_workspace(&self, req: &ForkWorkspaceRequest) -> Result<PathBuf, RuntimeError> {
        let source = self.workspace_path(&req.project_path, &req.source_name);
        if !source.exists() {
            return Err(RuntimeError::PathNotFound(
                source.to_string_lossy().into_owned(),
            ));
        }
        let new_path = self.workspace_path(&req.project_path, &req.new_name);
        if new_path.exists() {
            return Err(RuntimeError::WorkspaceExists);
        }
        let head = self.git(&source, &["rev-parse", "HEAD"]).await?;
        let head = head.trim().to_string();
        let new_path_str = new_path.to_string_lossy().to_string();
        self.git(
            &req.project_path,
            &["worktree", "add", "-b", &req.new_name, &new_path_str, &head],
        )
        .await?;
        Ok(new_path)
    }

    async fn rename_workspace(
        &self,
        project_path: &Path,
        old_name: &str,
        new_name: &str,
    ) -> Result<RenamedPaths, RuntimeError> {
        let old_path = self.workspace_path(project_path, old_name);
        if old_name == new_name {
            return Ok(RenamedPaths {
                new_path: old_path.clone(),
                old_path,
            });
        }
        let new_path = self.workspace_path(project_path, new_name);
        if new_path.exists() {
            return Err(RuntimeError::WorkspaceExists);
        }
        let old_str = old_path.to_string_lossy().to_string();
        let new_str = new_path.to_string_lossy().to_string();
        self.git(project_path, &["worktree", "move", &old_str, &new_str])
            .await?;
        self.git(project_path, &["branch", "-m", old_name, new_name])
            .await?;
        Ok(RenamedPaths { old_path, new_path })
    }

    async fn delete_workspace(
        &self,
        project_path: &Path,
        name: &str,
        force: bool,
    ) -> Result<(), RuntimeError> {
        let path = self.workspace_path(project_path, name);
        if !path.exists() {
            // Deleting an already-deleted workspace succeeds.
            return Ok(());
        }
        if !force {
            let status = self.git(&path, &["status", "--porcelain"]).await?;
            if !status.trim().is_empty() {
                return Err(RuntimeError::DirtyWorkspace);
            }
        }
        let path_str = path.to_string_lossy().to_string();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);
        self.git(project_path, &args).await?;
        // The branch stays behind by design; delete only the working tree.
        Ok(())
    }

    async fn init_workspace(
        &self,
        project_path: &Path,
        workspace_path: &Path,
        sink: InitSink,
    ) -> Result<i32, RuntimeError> {
        let hook = project_path.join(INIT_HOOK);
        if !hook.exists() {
            return Ok(0);
        }

        let mut cmd = Command::new("bash");
        cmd.arg(&hook)
            .current_dir(workspace_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in crate::hygiene_env(&Default::default()) {
            cmd.env(k, v);
        }
        let mut child = cmd.spawn()?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let out_sink = sink.clone();
        let out_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out_sink(&line, false);
            }
        });
        let err_sink = sink.clone();
        let err_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                err_sink(&line, true);
            }
        });

        let status = child.wait().await?;
        let _ = out_task.await;
        let _ = err_task.await;
        Ok(status.code().unwrap_or(-1))
    }

    async fn execute_bash(
        &self,
        script: &str,
        opts: ExecOptions,
    ) -> Result<ExecResult, RuntimeError> {
        run_bash(script, opts).await
    }

    async fn list_branches(&self, project_path: &Path) -> Result<Vec<String>, RuntimeError> {
        let out = self
            .git(
                project_path,
                &["for-each-ref", "--format=%(refname:short)", "refs/heads"],
            )
            .await?;
        Ok(out.lines().map(str::to_string).collect())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
