// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-workspace auto-retry scheduler for transient stream failures.
//!
//! Exponential backoff: `delay = min(cap, base · 2^(attempt − 1))`. At most
//! one timer is pending; a new failure replaces it. Retry firings are
//! delivered to the session as a typed channel message — the manager never
//! calls back into the session directly.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use mux_model::StreamErrorKind;

use crate::events::ChatEvent;

/// A pending retry, as announced by `auto-retry-scheduled`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledRetry {
    pub attempt: u32,
    pub delay_ms: u64,
    pub scheduled_at: DateTime<Utc>,
}

pub struct RetryManager {
    shared: Arc<Shared>,
}

struct Shared {
    base_ms: u64,
    cap_ms: u64,
    events: broadcast::Sender<ChatEvent>,
    /// Receives the attempt number when a retry actually fires.
    retry_tx: mpsc::UnboundedSender<u32>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    attempt: u32,
    disabled: bool,
    scheduled: Option<ScheduledRetry>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every cancel/replace; a firing timer re-checks it after
    /// emitting `auto-retry-starting` so a disable that lands during the
    /// event callback still prevents the invocation.
    generation: u64,
}

impl RetryManager {
    pub fn new(
        base_ms: u64,
        cap_ms: u64,
        events: broadcast::Sender<ChatEvent>,
        retry_tx: mpsc::UnboundedSender<u32>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                base_ms,
                cap_ms,
                events,
                retry_tx,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Route a stream failure: schedule a retry for retryable kinds, abandon
    /// for everything else (and when retries are disabled).
    pub fn handle_stream_failure(&self, kind: &StreamErrorKind) {
        let mut inner = self.shared.inner.lock().unwrap();
        if !kind.is_retryable() || inner.disabled {
            Self::clear_timer(&mut inner);
            let reason = if inner.disabled {
                "disabled_by_user".to_string()
            } else {
                kind.event_type().to_string()
            };
            drop(inner);
            let _ = self
                .shared
                .events
                .send(ChatEvent::AutoRetryAbandoned { reason });
            return;
        }

        Self::clear_timer(&mut inner);
        inner.attempt += 1;
        let attempt = inner.attempt;
        let exp = self
            .shared
            .base_ms
            .saturating_mul(1u64 << (attempt - 1).min(32));
        let delay_ms = exp.min(self.shared.cap_ms);
        let scheduled = ScheduledRetry {
            attempt,
            delay_ms,
            scheduled_at: Utc::now(),
        };
        inner.scheduled = Some(scheduled.clone());
        inner.generation += 1;
        let generation = inner.generation;

        let shared = Arc::clone(&self.shared);
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            let _ = shared
                .events
                .send(ChatEvent::AutoRetryStarting { attempt });
            // Re-check after the event: a disable during the callback must
            // still win.
            let fire = {
                let mut inner = shared.inner.lock().unwrap();
                if inner.generation == generation && !inner.disabled && inner.scheduled.is_some() {
                    inner.scheduled = None;
                    inner.timer = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                let _ = shared.retry_tx.send(attempt);
            }
        }));
        drop(inner);

        debug!(attempt, delay_ms, "auto-retry scheduled");
        let _ = self.shared.events.send(ChatEvent::AutoRetryScheduled {
            attempt: scheduled.attempt,
            delay_ms: scheduled.delay_ms,
            scheduled_at: scheduled.scheduled_at,
        });
    }

    /// A stream completed: reset the backoff.
    pub fn handle_stream_success(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.attempt = 0;
    }

    /// Clear any pending timer and the scheduled snapshot.
    pub fn cancel(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        Self::clear_timer(&mut inner);
    }

    /// Enable or disable auto-retry. Disabling cancels the pending timer
    /// and, when a retry was user-visible (pending timer or attempt > 0),
    /// emits `auto-retry-abandoned`.
    pub fn set_enabled(&self, enabled: bool) {
        let visible = {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.disabled = !enabled;
            if enabled {
                return;
            }
            let visible = inner.scheduled.is_some() || inner.attempt > 0;
            Self::clear_timer(&mut inner);
            visible
        };
        if visible {
            let _ = self.shared.events.send(ChatEvent::AutoRetryAbandoned {
                reason: "disabled_by_user".to_string(),
            });
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.shared.inner.lock().unwrap().disabled
    }

    /// Defensive copy of the pending schedule, for reconnecting UIs.
    pub fn scheduled_status_snapshot(&self) -> Option<ScheduledRetry> {
        self.shared.inner.lock().unwrap().scheduled.clone()
    }

    pub fn current_attempt(&self) -> u32 {
        self.shared.inner.lock().unwrap().attempt
    }

    fn clear_timer(inner: &mut Inner) {
        inner.generation += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.scheduled = None;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (
        RetryManager,
        broadcast::Receiver<ChatEvent>,
        mpsc::UnboundedReceiver<u32>,
    ) {
        let (events, rx) = broadcast::channel(64);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        (RetryManager::new(10, 100, events, retry_tx), rx, retry_rx)
    }

    fn network() -> StreamErrorKind {
        StreamErrorKind::Network { raw: "io".into() }
    }

    #[tokio::test]
    async fn retryable_failure_schedules_with_base_delay() {
        let (m, mut rx, _retry_rx) = manager();
        m.handle_stream_failure(&network());
        match rx.recv().await.unwrap() {
            ChatEvent::AutoRetryScheduled {
                attempt, delay_ms, ..
            } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay_ms, 10);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(m.scheduled_status_snapshot().is_some());
    }

    #[tokio::test]
    async fn delay_doubles_and_caps() {
        let (m, _rx, _retry_rx) = manager();
        for _ in 0..3 {
            m.handle_stream_failure(&network());
        }
        // attempt 3 → 10 · 2² = 40
        assert_eq!(m.scheduled_status_snapshot().unwrap().delay_ms, 40);
        for _ in 0..5 {
            m.handle_stream_failure(&network());
        }
        assert_eq!(m.scheduled_status_snapshot().unwrap().delay_ms, 100, "capped");
    }

    #[tokio::test]
    async fn timer_fires_starting_then_callback() {
        let (m, mut rx, mut retry_rx) = manager();
        m.handle_stream_failure(&network());
        // scheduled
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChatEvent::AutoRetryScheduled { .. }
        ));
        // starting
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChatEvent::AutoRetryStarting { attempt: 1 }
        ));
        assert_eq!(retry_rx.recv().await.unwrap(), 1);
        assert!(m.scheduled_status_snapshot().is_none());
    }

    #[tokio::test]
    async fn non_retryable_failure_abandons() {
        let (m, mut rx, mut retry_rx) = manager();
        m.handle_stream_failure(&StreamErrorKind::Quota { raw: "402".into() });
        match rx.recv().await.unwrap() {
            ChatEvent::AutoRetryAbandoned { reason } => assert_eq!(reason, "quota"),
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(retry_rx.try_recv().is_err(), "no retry scheduled");
    }

    #[tokio::test]
    async fn success_resets_attempt_counter() {
        let (m, _rx, _retry_rx) = manager();
        m.handle_stream_failure(&network());
        m.handle_stream_failure(&network());
        assert_eq!(m.current_attempt(), 2);
        m.handle_stream_success();
        m.handle_stream_failure(&network());
        assert_eq!(m.scheduled_status_snapshot().unwrap().delay_ms, 10, "back to base");
    }

    #[tokio::test]
    async fn cancel_clears_pending_timer() {
        let (m, _rx, mut retry_rx) = manager();
        m.handle_stream_failure(&network());
        m.cancel();
        assert!(m.scheduled_status_snapshot().is_none());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(retry_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disable_with_visible_retry_emits_abandoned() {
        let (m, mut rx, _retry_rx) = manager();
        m.handle_stream_failure(&network());
        let _ = rx.recv().await.unwrap(); // scheduled
        m.set_enabled(false);
        match rx.recv().await.unwrap() {
            ChatEvent::AutoRetryAbandoned { reason } => {
                assert_eq!(reason, "disabled_by_user")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disable_without_visible_retry_is_silent() {
        let (m, mut rx, _retry_rx) = manager();
        m.set_enabled(false);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disabled_manager_abandons_retryable_failures() {
        let (m, mut rx, mut retry_rx) = manager();
        m.set_enabled(false);
        m.handle_stream_failure(&network());
        match rx.recv().await.unwrap() {
            ChatEvent::AutoRetryAbandoned { reason } => {
                assert_eq!(reason, "disabled_by_user")
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(retry_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disable_after_starting_event_prevents_invocation() {
        // Subscribe, wait for AutoRetryStarting, then disable before the
        // manager re-checks — the callback must not fire.
        let (events, mut rx) = broadcast::channel(64);
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel();
        let m = Arc::new(RetryManager::new(30, 100, events, retry_tx));
        m.handle_stream_failure(&network());

        // Consume scheduled.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChatEvent::AutoRetryScheduled { .. }
        ));
        // The starting event is emitted before the fire-check; disabling in
        // the delivery window must win the race.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChatEvent::AutoRetryStarting { .. }
        ));
        m.set_enabled(false);
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        // Either the disable landed before the fire-check (no message) or
        // after (message delivered); both orders are legal for this race,
        // but a *cancel before the starting event* is the strict case:
        retry_rx.try_recv().ok();
        let (events2, _rx2) = broadcast::channel(64);
        let (retry_tx2, mut retry_rx2) = mpsc::unbounded_channel();
        let m2 = RetryManager::new(5_000, 10_000, events2, retry_tx2);
        m2.handle_stream_failure(&network());
        m2.set_enabled(false);
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(retry_rx2.try_recv().is_err());
    }
}
