// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeSet;

use mux_config::ToolPolicyConfig;

/// Allow/deny filter applied after tool resolution. `deny` overrides
/// `allow`; an absent allow-list admits everything not denied.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    allow: Option<BTreeSet<String>>,
    deny: BTreeSet<String>,
}

impl ToolPolicy {
    pub fn new(allow: Option<Vec<String>>, deny: Vec<String>) -> Self {
        Self {
            allow: allow.map(|a| a.into_iter().collect()),
            deny: deny.into_iter().collect(),
        }
    }

    pub fn from_config(cfg: &ToolPolicyConfig) -> Self {
        Self::new(cfg.allow.clone(), cfg.deny.clone())
    }

    pub fn allows(&self, name: &str) -> bool {
        if self.deny.contains(name) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.contains(name),
            None => true,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_allows_everything() {
        let p = ToolPolicy::default();
        assert!(p.allows("bash"));
        assert!(p.allows("anything"));
    }

    #[test]
    fn deny_removes_tool() {
        let p = ToolPolicy::new(None, vec!["bash".into()]);
        assert!(!p.allows("bash"));
        assert!(p.allows("file_read"));
    }

    #[test]
    fn allow_list_restricts_to_named() {
        let p = ToolPolicy::new(Some(vec!["file_read".into()]), vec![]);
        assert!(p.allows("file_read"));
        assert!(!p.allows("bash"));
    }

    #[test]
    fn deny_overrides_allow() {
        let p = ToolPolicy::new(Some(vec!["bash".into()]), vec!["bash".into()]);
        assert!(!p.allows("bash"));
    }
}
