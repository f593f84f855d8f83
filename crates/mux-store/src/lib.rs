// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-workspace session persistence.
//!
//! Layout under the sessions root (normally `<mux home>/sessions`):
//!
//! ```text
//! <workspace-id>/
//!   chat.jsonl     append-only history, one Message per line
//!   partial.json   at most one in-flight assistant message
//! ```

mod history;
mod init_state;
mod partial;

pub use history::HistoryStore;
pub use init_state::{InitEvent, InitStateManager, InitStatus};
pub use partial::PartialStore;
