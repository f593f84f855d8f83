// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-workspace init lifecycle with lossless replay.
//!
//! Workspace creation runs a post-create hook whose output streams in
//! line-by-line; subscribers can attach at any time and receive the full
//! buffered prefix followed by live events with no gap — the buffer
//! snapshot and the live subscription happen under one lock.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitEvent {
    Started { project_path: String },
    Output { line: String, is_stderr: bool },
    Completed { exit_code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Running,
    Complete { exit_code: i32 },
}

struct InitEntry {
    status: InitStatus,
    buffer: Vec<InitEvent>,
    tx: broadcast::Sender<InitEvent>,
}

/// Process-wide store of init states, safe for concurrent use.
#[derive(Default)]
pub struct InitStateManager {
    inner: Mutex<HashMap<String, InitEntry>>,
}

impl InitStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a new init run, replacing any prior state for the workspace.
    pub fn start_init(&self, workspace_id: &str, project_path: &str) {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let event = InitEvent::Started {
            project_path: project_path.to_string(),
        };
        let entry = InitEntry {
            status: InitStatus::Running,
            buffer: vec![event.clone()],
            tx,
        };
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entry(workspace_id.to_string())
            .and_modify(|e| {
                *e = InitEntry {
                    status: InitStatus::Running,
                    buffer: vec![event.clone()],
                    tx: broadcast::channel(CHANNEL_CAPACITY).0,
                }
            })
            .or_insert(entry);
        let _ = entry.tx.send(event);
    }

    /// Buffer and publish one output line.
    pub fn append_output(&self, workspace_id: &str, line: &str, is_stderr: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(workspace_id) {
            let event = InitEvent::Output {
                line: line.to_string(),
                is_stderr,
            };
            entry.buffer.push(event.clone());
            let _ = entry.tx.send(event);
        }
    }

    /// Close the init run. The buffer is retained for replay.
    pub fn end_init(&self, workspace_id: &str, exit_code: i32) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.get_mut(workspace_id) {
            entry.status = InitStatus::Complete { exit_code };
            let event = InitEvent::Completed { exit_code };
            entry.buffer.push(event.clone());
            let _ = entry.tx.send(event);
        }
    }

    pub fn status(&self, workspace_id: &str) -> Option<InitStatus> {
        self.inner
            .lock()
            .unwrap()
            .get(workspace_id)
            .map(|e| e.status)
    }

    /// Snapshot the buffered events and subscribe to live ones atomically.
    ///
    /// Everything in the returned `Vec` happened before anything the
    /// receiver will yield; together they form the complete ordered event
    /// sequence.
    pub fn replay(
        &self,
        workspace_id: &str,
    ) -> Option<(Vec<InitEvent>, broadcast::Receiver<InitEvent>)> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(workspace_id)
            .map(|e| (e.buffer.clone(), e.tx.subscribe()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_records_started_event() {
        let m = InitStateManager::new();
        m.start_init("w", "/proj");
        let (buf, _rx) = m.replay("w").unwrap();
        assert_eq!(
            buf,
            vec![InitEvent::Started {
                project_path: "/proj".into()
            }]
        );
        assert_eq!(m.status("w"), Some(InitStatus::Running));
    }

    #[test]
    fn output_lines_buffer_in_order() {
        let m = InitStateManager::new();
        m.start_init("w", "/proj");
        m.append_output("w", "installing deps", false);
        m.append_output("w", "warning: slow", true);
        m.end_init("w", 0);
        let (buf, _rx) = m.replay("w").unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(
            buf[1],
            InitEvent::Output {
                line: "installing deps".into(),
                is_stderr: false
            }
        );
        assert_eq!(
            buf[2],
            InitEvent::Output {
                line: "warning: slow".into(),
                is_stderr: true
            }
        );
        assert_eq!(buf[3], InitEvent::Completed { exit_code: 0 });
        assert_eq!(m.status("w"), Some(InitStatus::Complete { exit_code: 0 }));
    }

    #[tokio::test]
    async fn live_events_follow_snapshot_without_loss() {
        let m = InitStateManager::new();
        m.start_init("w", "/proj");
        m.append_output("w", "before", false);
        let (buf, mut rx) = m.replay("w").unwrap();
        assert_eq!(buf.len(), 2);
        m.append_output("w", "after", false);
        let live = rx.recv().await.unwrap();
        assert_eq!(
            live,
            InitEvent::Output {
                line: "after".into(),
                is_stderr: false
            }
        );
    }

    #[test]
    fn restart_replaces_previous_state() {
        let m = InitStateManager::new();
        m.start_init("w", "/proj");
        m.append_output("w", "old", false);
        m.end_init("w", 1);
        m.start_init("w", "/proj");
        let (buf, _rx) = m.replay("w").unwrap();
        assert_eq!(buf.len(), 1, "fresh buffer after restart");
        assert_eq!(m.status("w"), Some(InitStatus::Running));
    }

    #[test]
    fn output_for_unknown_workspace_is_ignored() {
        let m = InitStateManager::new();
        m.append_output("nope", "line", false);
        assert!(m.replay("nope").is_none());
        assert!(m.status("nope").is_none());
    }
}
