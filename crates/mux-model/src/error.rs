// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stream error taxonomy.
//!
//! Every provider failure is classified into a [`StreamErrorKind`] before it
//! reaches the session layer. Retryable kinds route through the retry
//! scheduler; fatal kinds abandon auto-retry and surface as an `error` chat
//! event. Classification is deliberately coarse — kinds, not concrete
//! provider types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    ApiKeyMissing,
    InvalidCredentials,
    OauthNotConnected,
}

/// Coarse classification of a failed provider stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamErrorKind {
    Authentication {
        auth_kind: AuthErrorKind,
        provider: String,
    },
    PermissionDenied {
        provider: String,
    },
    Quota {
        raw: String,
    },
    Policy {
        provider: String,
        raw: String,
    },
    Configuration {
        raw: String,
    },
    InvalidModelString,
    ProviderNotSupported,
    ProviderDisabled,
    ContextExceeded,
    RateLimit {
        raw: String,
    },
    ServiceUnavailable {
        raw: String,
    },
    Network {
        raw: String,
    },
    Unknown {
        raw: String,
    },
}

impl StreamErrorKind {
    /// Whether the retry scheduler may attempt this failure again.
    ///
    /// `Unknown` is retryable — the scheduler's enabled/disabled state is the
    /// second gate, applied by the session layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network { .. }
                | Self::ServiceUnavailable { .. }
                | Self::RateLimit { .. }
                | Self::Unknown { .. }
        )
    }

    /// Stable string used in `error{errorType}` events and message metadata.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Authentication { .. } => "authentication",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Quota { .. } => "quota",
            Self::Policy { .. } => "policy",
            Self::Configuration { .. } => "configuration",
            Self::InvalidModelString => "invalid_model_string",
            Self::ProviderNotSupported => "provider_not_supported",
            Self::ProviderDisabled => "provider_disabled",
            Self::ContextExceeded => "context_exceeded",
            Self::RateLimit { .. } => "rate_limit",
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Network { .. } => "network",
            Self::Unknown { .. } => "unknown",
        }
    }

    /// Map an HTTP status + response body to an error kind.
    ///
    /// Follows the common provider conventions: 401 credentials, 402 quota,
    /// 403 permissions or policy, 413/400-with-context-marker context window,
    /// 429 rate limit, 5xx/529 service unavailability.
    pub fn classify_http(status: u16, body: &str, provider: &str) -> Self {
        let raw = || truncate_raw(body);
        match status {
            401 => Self::Authentication {
                auth_kind: AuthErrorKind::InvalidCredentials,
                provider: provider.to_string(),
            },
            402 => Self::Quota { raw: raw() },
            403 => {
                if body.contains("policy") || body.contains("content_filter") {
                    Self::Policy {
                        provider: provider.to_string(),
                        raw: raw(),
                    }
                } else {
                    Self::PermissionDenied {
                        provider: provider.to_string(),
                    }
                }
            }
            400 | 413 if is_context_overflow(body) => Self::ContextExceeded,
            400 | 404 | 422 => Self::Configuration { raw: raw() },
            429 => {
                // Some providers report exhausted prepaid quota as a 429.
                if body.contains("quota") || body.contains("billing") {
                    Self::Quota { raw: raw() }
                } else {
                    Self::RateLimit { raw: raw() }
                }
            }
            500..=599 => Self::ServiceUnavailable { raw: raw() },
            _ => Self::Unknown { raw: raw() },
        }
    }
}

fn is_context_overflow(body: &str) -> bool {
    body.contains("context_length")
        || body.contains("context window")
        || body.contains("maximum context")
        || body.contains("prompt is too long")
        || body.contains("exceed_context_size")
}

/// Bound the raw body carried around in error values; provider error pages
/// can be arbitrarily large HTML.
fn truncate_raw(body: &str) -> String {
    const MAX: usize = 2_000;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

/// A classified provider stream failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StreamError {
    pub kind: StreamErrorKind,
    pub message: String,
}

impl StreamError {
    pub fn new(kind: StreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: StreamErrorKind::Network {
                raw: message.clone(),
            },
            message,
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: StreamErrorKind::Configuration {
                raw: message.clone(),
            },
            message,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            StreamError::network(e.to_string())
        } else {
            StreamError::new(
                StreamErrorKind::Unknown { raw: e.to_string() },
                e.to_string(),
            )
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(StreamErrorKind::Network { raw: "".into() }.is_retryable());
        assert!(StreamErrorKind::ServiceUnavailable { raw: "".into() }.is_retryable());
        assert!(StreamErrorKind::RateLimit { raw: "".into() }.is_retryable());
        assert!(StreamErrorKind::Unknown { raw: "".into() }.is_retryable());
    }

    #[test]
    fn fatal_kinds_are_not_retryable() {
        assert!(!StreamErrorKind::Quota { raw: "".into() }.is_retryable());
        assert!(!StreamErrorKind::ContextExceeded.is_retryable());
        assert!(!StreamErrorKind::InvalidModelString.is_retryable());
        assert!(!StreamErrorKind::ProviderDisabled.is_retryable());
        assert!(!StreamErrorKind::Authentication {
            auth_kind: AuthErrorKind::ApiKeyMissing,
            provider: "openai".into()
        }
        .is_retryable());
    }

    #[test]
    fn http_401_is_authentication() {
        let k = StreamErrorKind::classify_http(401, "unauthorized", "openai");
        assert_eq!(k.event_type(), "authentication");
    }

    #[test]
    fn http_402_is_quota() {
        let k = StreamErrorKind::classify_http(402, "payment required", "openai");
        assert_eq!(k.event_type(), "quota");
    }

    #[test]
    fn http_403_policy_body_is_policy() {
        let k = StreamErrorKind::classify_http(403, r#"{"error":"content_filter"}"#, "openai");
        assert_eq!(k.event_type(), "policy");
    }

    #[test]
    fn http_403_plain_is_permission_denied() {
        let k = StreamErrorKind::classify_http(403, "forbidden", "openai");
        assert_eq!(k.event_type(), "permission_denied");
    }

    #[test]
    fn http_429_is_rate_limit() {
        let k = StreamErrorKind::classify_http(429, "slow down", "openai");
        assert_eq!(k.event_type(), "rate_limit");
        assert!(k.is_retryable());
    }

    #[test]
    fn http_429_quota_body_is_quota() {
        let k = StreamErrorKind::classify_http(429, "monthly quota exceeded", "openai");
        assert_eq!(k.event_type(), "quota");
    }

    #[test]
    fn http_500_is_service_unavailable() {
        let k = StreamErrorKind::classify_http(500, "boom", "openai");
        assert_eq!(k.event_type(), "service_unavailable");
        assert!(k.is_retryable());
    }

    #[test]
    fn context_overflow_body_classifies_as_context_exceeded() {
        let k = StreamErrorKind::classify_http(
            400,
            r#"{"error":{"message":"This model's maximum context length is 128000 tokens"}}"#,
            "openai",
        );
        assert_eq!(k, StreamErrorKind::ContextExceeded);
    }

    #[test]
    fn plain_400_is_configuration() {
        let k = StreamErrorKind::classify_http(400, "bad field", "openai");
        assert_eq!(k.event_type(), "configuration");
    }

    #[test]
    fn raw_body_is_bounded() {
        let body = "x".repeat(10_000);
        if let StreamErrorKind::ServiceUnavailable { raw } =
            StreamErrorKind::classify_http(503, &body, "p")
        {
            assert!(raw.len() < 2_100);
        } else {
            panic!("wrong kind");
        }
    }
}
