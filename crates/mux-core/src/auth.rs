// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Bearer token guarding the engine's command surface.
//!
//! Raw tokens are never persisted: they are shown once at generation time
//! and only the SHA-256 digest is stored. Verification is constant-time.

use std::path::Path;

use anyhow::Context;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A raw bearer token — display once, then hash.
#[derive(Debug)]
#[must_use = "display this token to the operator, then call into_stored()"]
pub struct RawToken(String);

impl RawToken {
    /// 256 bits from the OS CSPRNG, hex-encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        RawToken(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_stored(self) -> StoredToken {
        StoredToken(sha256(self.0.as_bytes()))
    }
}

/// SHA-256 digest of a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken(#[serde(with = "hex_bytes")] [u8; 32]);

impl StoredToken {
    /// Constant-time comparison against a presented token.
    pub fn verify(&self, presented: &str) -> bool {
        sha256(presented.as_bytes()).ct_eq(&self.0).into()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading token file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Generate a new token, persist only its digest (mode 0o600), and
    /// return the raw value for one-time display.
    pub fn generate_and_save(path: &Path) -> anyhow::Result<RawToken> {
        let raw = RawToken::generate();
        let stored = StoredToken(sha256(raw.0.as_bytes()));
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string(&stored)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(raw)
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(d)?;
        let v = hex::decode(&s).map_err(serde::de::Error::custom)?;
        v.try_into()
            .map_err(|_| serde::de::Error::custom("token hash must be 32 bytes"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_the_original_token() {
        let raw = RawToken::generate();
        let token = raw.as_str().to_string();
        let stored = raw.into_stored();
        assert!(stored.verify(&token));
    }

    #[test]
    fn verify_rejects_other_tokens() {
        let stored = RawToken::generate().into_stored();
        assert!(!stored.verify("wrong-token"));
        assert!(!stored.verify(""));
    }

    #[test]
    fn generate_and_save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let raw = StoredToken::generate_and_save(&path).unwrap();
        let loaded = StoredToken::load(&path).unwrap();
        assert!(loaded.verify(raw.as_str()));
        // The raw token itself is not on disk.
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert!(!on_disk.contains(raw.as_str()));
    }
}
