// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! At-most-one in-flight assistant message per workspace.
//!
//! The partial file exists iff a stream is in progress or ended abnormally
//! without commit. Writes are atomic (temp + rename) so a reader never sees
//! half a message.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use mux_model::Message;

use crate::HistoryStore;

pub struct PartialStore {
    root: PathBuf,
}

impl PartialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn partial_path(&self, workspace_id: &str) -> PathBuf {
        self.root.join(workspace_id).join("partial.json")
    }

    /// Atomically replace the partial.
    pub fn write(&self, workspace_id: &str, message: &Message) -> Result<()> {
        let path = self.partial_path(workspace_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string(message)?)
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    pub fn read(&self, workspace_id: &str) -> Result<Option<Message>> {
        let path = self.partial_path(workspace_id);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(
                serde_json::from_str(&s)
                    .with_context(|| format!("parsing {}", path.display()))?,
            )),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Idempotent delete.
    pub fn delete(&self, workspace_id: &str) -> Result<()> {
        match fs::remove_file(self.partial_path(workspace_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Commit the partial into history, then delete the file.
    ///
    /// Idempotent: no partial → no-op. When history already holds a message
    /// with the same id (the stream driver's placeholder, or a previous
    /// commit), the message is updated in place rather than appended — the
    /// partial must never double-append.
    pub async fn commit_to_history(
        &self,
        workspace_id: &str,
        history: &HistoryStore,
    ) -> Result<()> {
        let Some(partial) = self.read(workspace_id)? else {
            return Ok(());
        };
        if history.contains(workspace_id, &partial.id).await? {
            history.update_message(workspace_id, partial).await?;
        } else {
            history.append(workspace_id, partial).await?;
        }
        self.delete(workspace_id)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mux_model::CONTINUE_SENTINEL;

    fn stores() -> (tempfile::TempDir, PartialStore, HistoryStore) {
        let dir = tempfile::tempdir().unwrap();
        let p = PartialStore::new(dir.path());
        let h = HistoryStore::new(dir.path());
        (dir, p, h)
    }

    #[test]
    fn read_missing_returns_none() {
        let (_d, p, _h) = stores();
        assert!(p.read("w").unwrap().is_none());
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_d, p, _h) = stores();
        let mut m = Message::assistant("in flight");
        m.metadata.partial = true;
        p.write("w", &m).unwrap();
        let back = p.read("w").unwrap().unwrap();
        assert_eq!(back.id, m.id);
        assert!(back.metadata.partial);
    }

    #[test]
    fn write_replaces_previous_partial() {
        let (_d, p, _h) = stores();
        p.write("w", &Message::assistant("first")).unwrap();
        p.write("w", &Message::assistant("second")).unwrap();
        assert_eq!(p.read("w").unwrap().unwrap().text(), "second");
    }

    #[test]
    fn delete_is_idempotent() {
        let (_d, p, _h) = stores();
        p.delete("w").unwrap();
        p.write("w", &Message::assistant("x")).unwrap();
        p.delete("w").unwrap();
        p.delete("w").unwrap();
        assert!(p.read("w").unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_appends_when_id_not_in_history() {
        let (_d, p, h) = stores();
        let mut m = Message::assistant("partial text");
        m.metadata.partial = true;
        m.append_to_last_text(CONTINUE_SENTINEL);
        p.write("w", &m).unwrap();

        p.commit_to_history("w", &h).await.unwrap();
        let hist = h.get_history("w").await.unwrap();
        assert_eq!(hist.len(), 1);
        assert!(hist[0].metadata.partial);
        assert!(hist[0].text().ends_with(CONTINUE_SENTINEL));
        assert!(p.read("w").unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_updates_existing_placeholder() {
        let (_d, p, h) = stores();
        h.append("w", Message::user("q")).await.unwrap();
        let placeholder = h
            .append("w", Message::assistant_placeholder("a1"))
            .await
            .unwrap();

        let mut m = Message::assistant("streamed so far");
        m.id = "a1".into();
        m.metadata.partial = true;
        p.write("w", &m).unwrap();

        p.commit_to_history("w", &h).await.unwrap();
        let hist = h.get_history("w").await.unwrap();
        assert_eq!(hist.len(), 2, "no double append");
        assert_eq!(hist[1].text(), "streamed so far");
        assert_eq!(
            hist[1].metadata.history_sequence,
            placeholder.metadata.history_sequence
        );
    }

    #[tokio::test]
    async fn commit_twice_is_idempotent() {
        let (_d, p, h) = stores();
        let mut m = Message::assistant("once");
        m.metadata.partial = true;
        p.write("w", &m).unwrap();
        p.commit_to_history("w", &h).await.unwrap();
        // Second commit: no partial file → no-op.
        p.commit_to_history("w", &h).await.unwrap();
        assert_eq!(h.get_history("w").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn commit_without_partial_is_noop() {
        let (_d, p, h) = stores();
        p.commit_to_history("w", &h).await.unwrap();
        assert!(h.get_history("w").await.unwrap().is_empty());
    }
}
