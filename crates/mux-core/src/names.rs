// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Workspace name generation.
//!
//! Names must be git-branch-safe (`[a-z0-9-]+`, 2–20 chars) and carry a
//! 4-char Crockford-base32 suffix for uniqueness. Collisions on create are
//! retried with fresh suffixes up to [`MAX_NAME_RETRIES`] times.

use regex::Regex;

/// Retries with fresh suffixes before a create collision is surfaced.
pub const MAX_NAME_RETRIES: u32 = 3;

/// Crockford base32 without the ambiguous i/l/o/u, lowercased to stay
/// branch-safe.
const CROCKFORD: &[u8] = b"0123456789abcdefghjkmnpqrstvwxyz";

const SUFFIX_LEN: usize = 4;
/// Base stem budget: 20 chars total minus `-` and the 4-char suffix.
const MAX_STEM_LEN: usize = 15;

/// Sanitize free-form text into a branch-safe name stem.
pub fn sanitize_stem(text: &str) -> String {
    let lowered = text.to_lowercase();
    let re = Regex::new(r"[^a-z0-9]+").unwrap();
    let mut stem = re
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string();
    if stem.len() > MAX_STEM_LEN {
        stem.truncate(MAX_STEM_LEN);
        stem = stem.trim_end_matches('-').to_string();
    }
    if stem.len() < 2 {
        stem = format!("ws{stem}");
    }
    stem
}

/// `stem` + fresh 4-char suffix, e.g. `auth-k3m9`.
pub fn generate_workspace_name(stem: &str) -> String {
    format!("{stem}-{}", random_suffix())
}

fn random_suffix() -> String {
    let uuid = uuid::Uuid::new_v4();
    uuid.as_bytes()
        .iter()
        .take(SUFFIX_LEN)
        .map(|b| CROCKFORD[(*b as usize) % CROCKFORD.len()] as char)
        .collect()
}

/// Validate a final workspace name against the persisted-name rules.
pub fn is_valid_name(name: &str) -> bool {
    let re = Regex::new(r"^[a-z0-9-]+$").unwrap();
    re.is_match(name) && (2..=20).contains(&name.len())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
