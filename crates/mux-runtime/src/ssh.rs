// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! SSH runtime: the workspace lives on a remote host; every operation is an
//! `ssh` invocation built from the workspace's runtime config.
//!
//! The local side reuses [`run_bash`] for timeout/cancel/overflow handling —
//! killing the local `ssh` process group tears down the remote session.
//! Secrets and the hygiene env are exported on the *remote* side, inside the
//! command string, never in the local environment.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::bash::{run_bash, ExecOptions, ExecResult};
use crate::{
    hygiene_env, CreateWorkspaceRequest, ForkWorkspaceRequest, InitSink, RenamedPaths, Runtime,
    RuntimeError,
};

const REMOTE_BASE_DIR: &str = "$HOME/.mux/worktrees";
const INIT_HOOK: &str = ".mux/init";

pub struct SshRuntime {
    host: String,
    port: Option<u16>,
    user: Option<String>,
    identity_file: Option<String>,
}

impl SshRuntime {
    pub fn new(
        host: String,
        port: Option<u16>,
        user: Option<String>,
        identity_file: Option<String>,
    ) -> Self {
        Self {
            host,
            port,
            user,
            identity_file,
        }
    }

    fn target(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
        }
        args.push(self.target());
        args
    }

    /// Local `ssh …` command line that runs `remote_command` on the host.
    fn ssh_command_line(&self, remote_command: &str) -> String {
        let mut line = String::from("exec ssh");
        for arg in self.ssh_args() {
            line.push(' ');
            line.push_str(&shell_quote(&arg));
        }
        line.push(' ');
        line.push_str(&shell_quote(remote_command));
        line
    }

    /// Run a command remotely, capturing output through the local bash
    /// machinery (timeout, cancel, overflow).
    async fn remote(
        &self,
        remote_command: &str,
        opts: ExecOptions,
    ) -> Result<ExecResult, RuntimeError> {
        debug!(host = %self.host, cmd = %remote_command.chars().take(120).collect::<String>(), "ssh exec");
        // Secrets travel inside the remote command; scrub the local options.
        let local_opts = ExecOptions {
            secrets: HashMap::new(),
            cwd: None,
            ..opts
        };
        run_bash(&self.ssh_command_line(remote_command), local_opts).await
    }

    /// `cd <dir> && <command>` with error mapping for missing paths.
    async fn remote_in(
        &self,
        dir: &str,
        command: &str,
        opts: ExecOptions,
    ) -> Result<ExecResult, RuntimeError> {
        let full = format!("cd {} && {command}", quote_remote_path(dir));
        self.remote(&full, opts).await
    }

    async fn remote_git(&self, dir: &str, args: &str) -> Result<String, RuntimeError> {
        let r = self
            .remote_in(dir, &format!("git {args}"), ExecOptions::default())
            .await?;
        if r.success() {
            Ok(r.stdout)
        } else if r.stderr.contains("already exists") {
            Err(RuntimeError::WorkspaceExists)
        } else {
            Err(RuntimeError::Git(r.stderr.trim().to_string()))
        }
    }
}

#[async_trait]
impl Runtime for SshRuntime {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn resolve_path(&self, path: &str) -> Result<PathBuf, RuntimeError> {
        // ~-expansion happens in the remote shell; readlink canonicalizes.
        let r = self
            .remote(
                &format!("readlink -f {}", quote_remote_path(path)),
                ExecOptions::default(),
            )
            .await?;
        let resolved = r.stdout.trim();
        if !r.success() || resolved.is_empty() {
            return Err(RuntimeError::PathNotFound(path.to_string()));
        }
        Ok(PathBuf::from(resolved))
    }

    fn workspace_path(&self, project_path: &Path, name: &str) -> PathBuf {
        let project = project_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        PathBuf::from(format!("{REMOTE_BASE_DIR}/{project}/{name}"))
    }

    async fn create_workspace(
        &self,
        req: &CreateWorkspaceRequest,
    ) -> Result<PathBuf, RuntimeError> {
        let project = req.project_path.to_string_lossy();
        let path = self.workspace_path(&req.project_path, &req.directory_name);
        let path_str = path.to_string_lossy();
        let check = self
            .remote(
                &format!("test -e {}", quote_remote_path(&path_str)),
                ExecOptions::default(),
            )
            .await?;
        if check.exit_code == 0 {
            return Err(RuntimeError::WorkspaceExists);
        }
        let project_stem = req
            .project_path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        self.remote(
            &format!(
                "mkdir -p {}",
                quote_remote_path(&format!("{REMOTE_BASE_DIR}/{project_stem}"))
            ),
            ExecOptions::default(),
        )
        .await?;
        self.remote_git(
            &project,
            &format!(
                "worktree add -b {} {} {}",
                shell_quote(&req.branch_name),
                quote_remote_path(&path_str),
                shell_quote(&req.trunk_branch)
            ),
        )
        .await?;
        // Record the canonical absolute path, not the $HOME-relative form.
        let pwd = self
            .remote_in(&path_str, "pwd", ExecOptions::default())
            .await?;
        Ok(PathBuf::from(pwd.stdout.trim()))
    }

    async fn fork_workspace(&self, req: &ForkWorkspaceRequest) -> Result<PathBuf, RuntimeError> {
        let project = req.project_path.to_string_lossy();
        let source = self.workspace_path(&req.project_path, &req.source_name);
        let head = self
            .remote_git(&source.to_string_lossy(), "rev-parse HEAD")
            .await?;
        let new_path = self.workspace_path(&req.project_path, &req.new_name);
        let new_str = new_path.to_string_lossy();
        self.remote_git(
            &project,
            &format!(
                "worktree add -b {} {} {}",
                shell_quote(&req.new_name),
                quote_remote_path(&new_str),
                shell_quote(head.trim())
            ),
        )
        .await?;
        let pwd = self
            .remote_in(&new_str, "pwd", ExecOptions::default())
            .await?;
        Ok(PathBuf::from(pwd.stdout.trim()))
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
        let project = project_path.to_string_lossy();
        self.remote_git(
            &project,
            &format!(
                "worktree move {} {}",
                quote_remote_path(&old_path.to_string_lossy()),
                quote_remote_path(&new_path.to_string_lossy())
            ),
        )
        .await?;
        self.remote_git(
            &project,
            &format!(
                "branch -m {} {}",
                shell_quote(old_name),
                shell_quote(new_name)
            ),
        )
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
        let path_str = path.to_string_lossy();
        let exists = self
            .remote(
                &format!("test -e {}", quote_remote_path(&path_str)),
                ExecOptions::default(),
            )
            .await?;
        if exists.exit_code != 0 {
            return Ok(());
        }
        if !force {
            let status = self.remote_git(&path_str, "status --porcelain").await?;
            if !status.trim().is_empty() {
                return Err(RuntimeError::DirtyWorkspace);
            }
        }
        let flag = if force { "--force " } else { "" };
        self.remote_git(
            &project_path.to_string_lossy(),
            &format!("worktree remove {flag}{}", quote_remote_path(&path_str)),
        )
        .await?;
        Ok(())
    }

    async fn init_workspace(
        &self,
        project_path: &Path,
        workspace_path: &Path,
        sink: InitSink,
    ) -> Result<i32, RuntimeError> {
        let hook = format!("{}/{INIT_HOOK}", project_path.to_string_lossy());
        let remote_command = format!(
            "test -x {hook_q} || exit 0; cd {ws_q} && bash {hook_q}",
            hook_q = quote_remote_path(&hook),
            ws_q = quote_remote_path(&workspace_path.to_string_lossy()),
        );

        let mut cmd = Command::new("ssh");
        for arg in self.ssh_args() {
            cmd.arg(arg);
        }
        cmd.arg(remote_command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
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
        let err_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                sink(&line, true);
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
        // Hygiene env + secrets are exported remotely, around the script.
        let mut exports = String::new();
        for (k, v) in hygiene_env(&opts.secrets) {
            exports.push_str(&format!("export {k}={}; ", shell_quote(&v)));
        }
        let cd = opts
            .cwd
            .as_ref()
            .map(|c| format!("cd {} && ", quote_remote_path(&c.to_string_lossy())))
            .unwrap_or_default();
        let remote_command = format!("{exports}{cd}bash -c {}", shell_quote(script));
        self.remote(&remote_command, opts).await
    }

    async fn list_branches(&self, project_path: &Path) -> Result<Vec<String>, RuntimeError> {
        let out = self
            .remote_git(
                &project_path.to_string_lossy(),
                "for-each-ref --format='%(refname:short)' refs/heads",
            )
            .await?;
        Ok(out
            .lines()
            .map(|l| l.trim_matches('\'').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// Single-quote `s` for the POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote a remote path while keeping a leading `~/` or `$HOME/` expandable.
fn quote_remote_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("$HOME/") {
        format!("\"$HOME\"/{}", shell_quote(rest))
    } else if let Some(rest) = path.strip_prefix("~/") {
        format!("\"$HOME\"/{}", shell_quote(rest))
    } else {
        shell_quote(path)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("don't"), r"'don'\''t'");
    }

    #[test]
    fn quote_remote_path_keeps_home_expandable() {
        assert_eq!(
            quote_remote_path("$HOME/.mux/worktrees/p/w"),
            "\"$HOME\"/'.mux/worktrees/p/w'"
        );
        assert_eq!(quote_remote_path("/abs/path"), "'/abs/path'");
    }

    #[test]
    fn target_includes_user_when_set() {
        let rt = SshRuntime::new("host".into(), None, Some("dev".into()), None);
        assert_eq!(rt.target(), "dev@host");
        let rt2 = SshRuntime::new("host".into(), None, None, None);
        assert_eq!(rt2.target(), "host");
    }

    #[test]
    fn ssh_args_carry_port_and_identity() {
        let rt = SshRuntime::new(
            "host".into(),
            Some(2222),
            None,
            Some("/key/id_ed25519".into()),
        );
        let args = rt.ssh_args();
        let joined = args.join(" ");
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-i /key/id_ed25519"));
        assert!(joined.contains("BatchMode=yes"));
        assert_eq!(args.last().unwrap(), "host");
    }

    #[test]
    fn workspace_path_is_under_remote_base() {
        let rt = SshRuntime::new("host".into(), None, None, None);
        let p = rt.workspace_path(Path::new("/src/app"), "feat-ab12");
        assert_eq!(
            p.to_string_lossy(),
            "$HOME/.mux/worktrees/app/feat-ab12"
        );
    }

    #[test]
    fn execute_command_line_embeds_quoted_remote_command() {
        let rt = SshRuntime::new("host".into(), None, None, None);
        let line = rt.ssh_command_line("echo 'hi'");
        assert!(line.starts_with("exec ssh"));
        assert!(line.ends_with(shell_quote("echo 'hi'").as_str()));
    }
}
