// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Append-only, sequence-numbered chat log.
//!
//! One `chat.jsonl` per workspace; every line is one serialized
//! [`Message`]. The store stamps `metadata.history_sequence` at append time
//! and serializes all writes per workspace; readers take whole-file
//! snapshots and tolerate a torn trailing line.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::warn;

use mux_model::Message;

pub struct HistoryStore {
    root: PathBuf,
    /// Per-workspace write lock + cached next sequence.
    state: std::sync::Mutex<HashMap<String, Arc<Mutex<LogState>>>>,
}

#[derive(Default)]
struct LogState {
    /// `None` until the log has been scanned once.
    next_seq: Option<u64>,
}

impl HistoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            state: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn chat_path(&self, workspace_id: &str) -> PathBuf {
        self.root.join(workspace_id).join("chat.jsonl")
    }

    fn workspace_lock(&self, workspace_id: &str) -> Arc<Mutex<LogState>> {
        self.state
            .lock()
            .unwrap()
            .entry(workspace_id.to_string())
            .or_default()
            .clone()
    }

    /// Append a message, stamping the next monotonic `history_sequence`.
    pub async fn append(&self, workspace_id: &str, mut message: Message) -> Result<Message> {
        let lock = self.workspace_lock(workspace_id);
        let mut state = lock.lock().await;

        let next = match state.next_seq {
            Some(n) => n,
            None => self.scan_next_seq(workspace_id)?,
        };
        message.metadata.history_sequence = Some(next);
        state.next_seq = Some(next + 1);

        let path = self.chat_path(workspace_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("appending to {}", path.display()))?;
        Ok(message)
    }

    /// Full ordered history. Malformed lines are skipped with a warning —
    /// a torn trailing line (crash mid-append) must not poison the log.
    pub async fn get_history(&self, workspace_id: &str) -> Result<Vec<Message>> {
        let path = self.chat_path(workspace_id);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Ok(parse_lines(workspace_id, &raw))
    }

    /// Tail of the history; used for state seeding (usage, model).
    pub async fn get_last_messages(&self, workspace_id: &str, n: usize) -> Result<Vec<Message>> {
        let mut all = self.get_history(workspace_id).await?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }

    /// Delete the trailing `ceil(N · fraction)` messages. Returns the
    /// removed sequence numbers so subscribers can invalidate.
    pub async fn truncate(&self, workspace_id: &str, fraction: f64) -> Result<Vec<u64>> {
        anyhow::ensure!(
            fraction > 0.0 && fraction <= 1.0,
            "truncate fraction must be in (0, 1], got {fraction}"
        );
        let lock = self.workspace_lock(workspace_id);
        let _state = lock.lock().await;

        let messages = self.read_unlocked(workspace_id)?;
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let remove = ((messages.len() as f64) * fraction).ceil() as usize;
        let keep = messages.len() - remove.min(messages.len());
        let removed: Vec<u64> = messages[keep..]
            .iter()
            .filter_map(|m| m.metadata.history_sequence)
            .collect();
        self.rewrite_unlocked(workspace_id, &messages[..keep])?;
        Ok(removed)
    }

    /// Empty the history, returning every removed sequence.
    pub async fn clear(&self, workspace_id: &str) -> Result<Vec<u64>> {
        let lock = self.workspace_lock(workspace_id);
        let _state = lock.lock().await;

        let messages = self.read_unlocked(workspace_id)?;
        let removed: Vec<u64> = messages
            .iter()
            .filter_map(|m| m.metadata.history_sequence)
            .collect();
        self.rewrite_unlocked(workspace_id, &[])?;
        Ok(removed)
    }

    /// Remove the message with `message_id` and everything after it.
    /// Returns the removed sequences; unknown ids remove nothing.
    pub async fn truncate_from(
        &self,
        workspace_id: &str,
        message_id: &str,
    ) -> Result<Vec<u64>> {
        let lock = self.workspace_lock(workspace_id);
        let _state = lock.lock().await;

        let messages = self.read_unlocked(workspace_id)?;
        let Some(idx) = messages.iter().position(|m| m.id == message_id) else {
            return Ok(Vec::new());
        };
        let removed: Vec<u64> = messages[idx..]
            .iter()
            .filter_map(|m| m.metadata.history_sequence)
            .collect();
        self.rewrite_unlocked(workspace_id, &messages[..idx])?;
        Ok(removed)
    }

    /// Replace the message with the same id in place, preserving its
    /// original sequence. Errors if no such message exists.
    pub async fn update_message(&self, workspace_id: &str, message: Message) -> Result<Message> {
        let lock = self.workspace_lock(workspace_id);
        let _state = lock.lock().await;

        let mut messages = self.read_unlocked(workspace_id)?;
        let slot = messages
            .iter_mut()
            .find(|m| m.id == message.id)
            .with_context(|| format!("message {} not found in history", message.id))?;
        let mut updated = message;
        updated.metadata.history_sequence = slot.metadata.history_sequence;
        *slot = updated.clone();
        self.rewrite_unlocked(workspace_id, &messages)?;
        Ok(updated)
    }

    /// True when a message with this id is already in the log.
    pub async fn contains(&self, workspace_id: &str, message_id: &str) -> Result<bool> {
        Ok(self
            .get_history(workspace_id)
            .await?
            .iter()
            .any(|m| m.id == message_id))
    }

    fn read_unlocked(&self, workspace_id: &str) -> Result<Vec<Message>> {
        let path = self.chat_path(workspace_id);
        let raw = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        Ok(parse_lines(workspace_id, &raw))
    }

    /// Rewrite the whole log atomically (temp file + rename).
    fn rewrite_unlocked(&self, workspace_id: &str, messages: &[Message]) -> Result<()> {
        let path = self.chat_path(workspace_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("jsonl.tmp");
        let mut body = String::new();
        for m in messages {
            body.push_str(&serde_json::to_string(m)?);
            body.push('\n');
        }
        fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn scan_next_seq(&self, workspace_id: &str) -> Result<u64> {
        let max = self
            .read_unlocked(workspace_id)?
            .iter()
            .filter_map(|m| m.metadata.history_sequence)
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }
}

fn parse_lines(workspace_id: &str, raw: &str) -> Vec<Message> {
    let mut out = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Message>(line) {
            Ok(m) => out.push(m),
            Err(e) => {
                warn!(
                    workspace = workspace_id,
                    line = i + 1,
                    error = %e,
                    "skipping malformed history line"
                );
            }
        }
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn append_assigns_sequences_from_one() {
        let (_d, s) = store();
        let a = s.append("w", Message::user("one")).await.unwrap();
        let b = s.append("w", Message::user("two")).await.unwrap();
        assert_eq!(a.metadata.history_sequence, Some(1));
        assert_eq!(b.metadata.history_sequence, Some(2));
    }

    #[tokio::test]
    async fn sequences_are_per_workspace() {
        let (_d, s) = store();
        let a = s.append("w1", Message::user("x")).await.unwrap();
        let b = s.append("w2", Message::user("y")).await.unwrap();
        assert_eq!(a.metadata.history_sequence, Some(1));
        assert_eq!(b.metadata.history_sequence, Some(1));
    }

    #[tokio::test]
    async fn sequences_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = HistoryStore::new(dir.path());
            s.append("w", Message::user("one")).await.unwrap();
        }
        // Fresh store instance re-scans the log.
        let s = HistoryStore::new(dir.path());
        let m = s.append("w", Message::user("two")).await.unwrap();
        assert_eq!(m.metadata.history_sequence, Some(2));
    }

    #[tokio::test]
    async fn get_history_returns_in_order() {
        let (_d, s) = store();
        for i in 0..5 {
            s.append("w", Message::user(format!("m{i}"))).await.unwrap();
        }
        let h = s.get_history("w").await.unwrap();
        assert_eq!(h.len(), 5);
        let seqs: Vec<u64> = h.iter().map(|m| m.metadata.history_sequence.unwrap()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn empty_history_for_unknown_workspace() {
        let (_d, s) = store();
        assert!(s.get_history("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_line_is_skipped() {
        let (_d, s) = store();
        s.append("w", Message::user("good")).await.unwrap();
        // Simulate a torn write.
        let path = s.chat_path("w");
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("{\"id\":\"torn");
        fs::write(&path, raw).unwrap();
        let h = s.get_history("w").await.unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].text(), "good");
    }

    #[tokio::test]
    async fn get_last_messages_returns_tail() {
        let (_d, s) = store();
        for i in 0..5 {
            s.append("w", Message::user(format!("m{i}"))).await.unwrap();
        }
        let tail = s.get_last_messages("w", 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].text(), "m3");
        assert_eq!(tail[1].text(), "m4");
    }

    #[tokio::test]
    async fn truncate_removes_ceil_fraction_of_tail() {
        let (_d, s) = store();
        for i in 0..5 {
            s.append("w", Message::user(format!("m{i}"))).await.unwrap();
        }
        // ceil(5 * 0.5) = 3 messages removed: seqs 3, 4, 5
        let removed = s.truncate("w", 0.5).await.unwrap();
        assert_eq!(removed, vec![3, 4, 5]);
        let h = s.get_history("w").await.unwrap();
        assert_eq!(h.len(), 2);
    }

    #[tokio::test]
    async fn truncate_full_fraction_removes_everything() {
        let (_d, s) = store();
        for _ in 0..3 {
            s.append("w", Message::user("m")).await.unwrap();
        }
        let removed = s.truncate("w", 1.0).await.unwrap();
        assert_eq!(removed.len(), 3);
        assert!(s.get_history("w").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn truncate_rejects_out_of_range_fraction() {
        let (_d, s) = store();
        assert!(s.truncate("w", 0.0).await.is_err());
        assert!(s.truncate("w", 1.5).await.is_err());
    }

    #[tokio::test]
    async fn sequences_stay_monotonic_after_truncate() {
        let (_d, s) = store();
        for _ in 0..4 {
            s.append("w", Message::user("m")).await.unwrap();
        }
        s.truncate("w", 0.5).await.unwrap();
        let m = s.append("w", Message::user("after")).await.unwrap();
        assert_eq!(m.metadata.history_sequence, Some(5));
    }

    #[tokio::test]
    async fn truncate_from_removes_message_and_tail() {
        let (_d, s) = store();
        s.append("w", Message::user("keep")).await.unwrap();
        let target = s.append("w", Message::user("edit me")).await.unwrap();
        s.append("w", Message::assistant("reply")).await.unwrap();
        let removed = s.truncate_from("w", &target.id).await.unwrap();
        assert_eq!(removed, vec![2, 3]);
        let h = s.get_history("w").await.unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h[0].text(), "keep");
    }

    #[tokio::test]
    async fn truncate_from_unknown_id_removes_nothing() {
        let (_d, s) = store();
        s.append("w", Message::user("a")).await.unwrap();
        let removed = s.truncate_from("w", "missing").await.unwrap();
        assert!(removed.is_empty());
        assert_eq!(s.get_history("w").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn clear_returns_all_sequences() {
        let (_d, s) = store();
        for _ in 0..3 {
            s.append("w", Message::user("m")).await.unwrap();
        }
        let removed = s.clear("w").await.unwrap();
        assert_eq!(removed, vec![1, 2, 3]);
        assert!(s.get_history("w").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_message_replaces_in_place() {
        let (_d, s) = store();
        s.append("w", Message::user("q")).await.unwrap();
        let placeholder = s
            .append("w", Message::assistant_placeholder("a1"))
            .await
            .unwrap();
        let mut full = Message::assistant("the reply");
        full.id = "a1".into();
        let updated = s.update_message("w", full).await.unwrap();
        // Sequence of the placeholder is preserved.
        assert_eq!(
            updated.metadata.history_sequence,
            placeholder.metadata.history_sequence
        );
        let h = s.get_history("w").await.unwrap();
        assert_eq!(h.len(), 2);
        assert_eq!(h[1].text(), "the reply");
    }

    #[tokio::test]
    async fn update_unknown_message_errors() {
        let (_d, s) = store();
        let r = s.update_message("w", Message::assistant("x")).await;
        assert!(r.is_err());
    }

    #[tokio::test]
    async fn concurrent_appends_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let s = Arc::new(HistoryStore::new(dir.path()));
        let mut handles = Vec::new();
        for i in 0..20 {
            let s = Arc::clone(&s);
            handles.push(tokio::spawn(async move {
                s.append("w", Message::user(format!("m{i}"))).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let history = s.get_history("w").await.unwrap();
        assert_eq!(history.len(), 20);
        let mut seqs: Vec<u64> = history
            .iter()
            .map(|m| m.metadata.history_sequence.unwrap())
            .collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=20).collect::<Vec<u64>>());
    }
}
