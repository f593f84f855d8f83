// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Local bash execution.
//!
//! Every script runs in its own session (process group) so cancellation and
//! timeout kill the entire process tree with one group SIGKILL — a child
//! that spawned background jobs cannot outlive its tool call. stdin is
//! `/dev/null` so nothing in the tree can reach for a terminal.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

use crate::{hygiene_env, RuntimeError, DEFAULT_BASH_TIMEOUT};

/// Hard byte ceiling for captured stdout/stderr handed back to callers.
const OUTPUT_LIMIT_BYTES: usize = 24_000;

/// Lines preserved from the head / tail of oversized output. Errors and
/// summaries cluster at the end of build output, so the tail matters as much
/// as the head.
const HEAD_LINES: usize = 100;
const TAIL_LINES: usize = 100;

/// What to do when captured output exceeds the limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Keep head + tail with an omission marker.
    #[default]
    Truncate,
    /// Spill the full output to a temp file and reference it in the marker.
    Tempfile,
}

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<PathBuf>,
    /// Extra env (project secrets) merged over the hygiene set.
    pub secrets: HashMap<String, String>,
    pub timeout: Option<Duration>,
    /// Unix niceness applied to the process group.
    pub niceness: Option<i32>,
    pub overflow: OverflowPolicy,
    /// Flips to `true` to cancel; the process group is SIGKILLed.
    pub cancel: Option<watch::Receiver<bool>>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Process exit code; -1 when killed by signal, timeout, or cancel.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Present when output was cut down; describes what was dropped (and
    /// where the full output went under the tempfile policy).
    pub truncated_marker: Option<String>,
    pub timed_out: bool,
    pub interrupted: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.interrupted
    }
}

/// Run `script` under `bash -c` with hygiene env, group kill, and output
/// capping.
pub async fn run_bash(script: &str, opts: ExecOptions) -> Result<ExecResult, RuntimeError> {
    debug!(script = %script.chars().take(120).collect::<String>(), "executing bash");

    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(script);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    if let Some(cwd) = &opts.cwd {
        cmd.current_dir(cwd);
    }
    for (k, v) in hygiene_env(&opts.secrets) {
        cmd.env(k, v);
    }

    // New session: the child becomes its own process-group leader, so
    // `kill(-pid)` reaches every descendant. Also detaches the controlling
    // terminal — open("/dev/tty") fails with ENXIO in the subtree.
    #[cfg(unix)]
    {
        let niceness = opts.niceness;
        unsafe {
            cmd.pre_exec(move || {
                libc::setsid();
                if let Some(nice) = niceness {
                    libc::nice(nice);
                }
                Ok(())
            });
        }
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout_pipe.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr_pipe.read_to_end(&mut buf).await;
        buf
    });

    let timeout = opts.timeout.unwrap_or(DEFAULT_BASH_TIMEOUT);
    let mut cancel = opts.cancel;
    let mut timed_out = false;
    let mut interrupted = false;

    let status = tokio::select! {
        status = child.wait() => Some(status?),
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            None
        }
        _ = wait_cancelled(&mut cancel) => {
            interrupted = true;
            None
        }
    };

    let status = match status {
        Some(s) => Some(s),
        None => {
            kill_process_group(pid);
            // Reap so the pipes close and the read tasks finish.
            child.wait().await.ok()
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();
    let exit_code = if timed_out || interrupted {
        -1
    } else {
        status.and_then(|s| s.code()).unwrap_or(-1)
    };

    let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();
    let (stdout, stderr, truncated_marker) = apply_overflow(stdout, stderr, opts.overflow)?;

    Ok(ExecResult {
        exit_code,
        stdout,
        stderr,
        truncated_marker,
        timed_out,
        interrupted,
    })
}

async fn wait_cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            if *rx.borrow() {
                return;
            }
            loop {
                if rx.changed().await.is_err() {
                    // Sender dropped without cancelling: never fires.
                    std::future::pending::<()>().await;
                }
                if *rx.borrow() {
                    return;
                }
            }
        }
        None => std::future::pending().await,
    }
}

fn kill_process_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Negative pid → the whole process group created by setsid().
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

fn apply_overflow(
    stdout: String,
    stderr: String,
    policy: OverflowPolicy,
) -> Result<(String, String, Option<String>), RuntimeError> {
    let total = stdout.len() + stderr.len();
    if total <= OUTPUT_LIMIT_BYTES {
        return Ok((stdout, stderr, None));
    }
    match policy {
        OverflowPolicy::Truncate => {
            let marker = format!(
                "output truncated: {} of {} bytes kept (first {HEAD_LINES} + last {TAIL_LINES} lines per stream)",
                OUTPUT_LIMIT_BYTES.min(total),
                total
            );
            Ok((
                head_tail_truncate(&stdout),
                head_tail_truncate(&stderr),
                Some(marker),
            ))
        }
        OverflowPolicy::Tempfile => {
            let mut file = tempfile::Builder::new()
                .prefix("mux-bash-output-")
                .suffix(".log")
                .tempfile()?;
            file.write_all(b"[stdout]\n")?;
            file.write_all(stdout.as_bytes())?;
            file.write_all(b"\n[stderr]\n")?;
            file.write_all(stderr.as_bytes())?;
            let (_, path) = file.keep().map_err(|e| RuntimeError::Io(e.error))?;
            let marker = format!(
                "output truncated: full {} bytes written to {}",
                total,
                path.display()
            );
            Ok((
                head_tail_truncate(&stdout),
                head_tail_truncate(&stderr),
                Some(marker),
            ))
        }
    }
}

/// Keep the first and last lines of oversized output with an omission
/// marker in between, falling back to byte windows for extremely long lines.
pub fn head_tail_truncate(s: &str) -> String {
    if s.len() <= OUTPUT_LIMIT_BYTES / 2 {
        return s.to_string();
    }

    let lines: Vec<&str> = s.lines().collect();
    let total = lines.len();

    if total <= HEAD_LINES + TAIL_LINES {
        // Byte budget exceeded with few (very long) lines: byte windows.
        let window = OUTPUT_LIMIT_BYTES / 4;
        let mut head_end = window.min(s.len());
        while !s.is_char_boundary(head_end) {
            head_end -= 1;
        }
        let mut tail_start = s.len().saturating_sub(window);
        while !s.is_char_boundary(tail_start) {
            tail_start += 1;
        }
        let omitted = s.len() - head_end - (s.len() - tail_start);
        return format!(
            "{}\n...[{} bytes omitted]...\n{}",
            &s[..head_end],
            omitted,
            &s[tail_start..]
        );
    }

    let head = lines[..HEAD_LINES].join("\n");
    let tail = lines[total - TAIL_LINES..].join("\n");
    let omitted_lines = total - HEAD_LINES - TAIL_LINES;
    format!("{head}\n...[{omitted_lines} lines omitted]...\n{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
