//! Gate-2 confirmation registry.
//!
//! A `READY_TO_SEND` callback suspends its HTTP response on a oneshot
//! channel stored here. Three resolution sources race: the in-voice
//! `confirm_pending_action` tool, the out-of-band `/tool-confirm` and
//! `/tool-cancel` endpoints, and the timeout. The first one wins; the
//! entry is removed from the map **before** the decision is sent, so a
//! waiter resolves exactly once.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::oneshot;

/// The outcome delivered to a suspended Gate-2 handler.
#[derive(Debug)]
pub enum ConfirmDecision {
    Confirmed,
    Cancelled { reason: Option<String> },
}

/// A suspended Gate-2 response waiting for the human.
pub struct PendingConfirm {
    pub tool_call_id: String,
    pub session_id: String,
    pub function_name: String,
    pub created_at: Instant,
    pub respond: oneshot::Sender<ConfirmDecision>,
}

pub struct ConfirmRegistry {
    pending: RwLock<HashMap<String, PendingConfirm>>,
    timeout: Duration,
}

impl ConfirmRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// The configured Gate-2 confirmation window.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn insert(&self, pending: PendingConfirm) {
        self.pending
            .write()
            .insert(pending.tool_call_id.clone(), pending);
    }

    /// Resolve a waiter as confirmed. Returns `true` if one was pending.
    pub fn confirm(&self, tool_call_id: &str) -> bool {
        if let Some(pending) = self.pending.write().remove(tool_call_id) {
            let _ = pending.respond.send(ConfirmDecision::Confirmed);
            return true;
        }
        false
    }

    /// Resolve a waiter as cancelled. Returns `true` if one was pending.
    pub fn cancel(&self, tool_call_id: &str, reason: Option<String>) -> bool {
        if let Some(pending) = self.pending.write().remove(tool_call_id) {
            let _ = pending.respond.send(ConfirmDecision::Cancelled { reason });
            return true;
        }
        false
    }

    /// Remove a timed-out waiter (called by the suspended handler itself).
    pub fn remove_expired(&self, tool_call_id: &str) {
        self.pending.write().remove(tool_call_id);
    }

    /// The most recent waiter for a session — the one a spoken "yes"
    /// refers to when the voice tool carries no id.
    pub fn latest_for_session(&self, session_id: &str) -> Option<String> {
        self.pending
            .read()
            .values()
            .filter(|p| p.session_id == session_id)
            .max_by_key(|p| p.created_at)
            .map(|p| p.tool_call_id.clone())
    }

    /// Cancel every waiter owned by a session (session close).
    pub fn cancel_for_session(&self, session_id: &str, reason: &str) -> usize {
        let ids: Vec<String> = {
            let pending = self.pending.read();
            pending
                .values()
                .filter(|p| p.session_id == session_id)
                .map(|p| p.tool_call_id.clone())
                .collect()
        };
        for id in &ids {
            self.cancel(id, Some(reason.to_owned()));
        }
        ids.len()
    }

    /// Drop waiters older than `max_age` without resolving them; the
    /// suspended handlers already timed out on their own.
    pub fn sweep_stale(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut pending = self.pending.write();
        let before = pending.len();
        pending.retain(|_, p| now.duration_since(p.created_at) < max_age);
        let removed = before - pending.len();
        if removed > 0 {
            tracing::debug!(removed, "swept stale gate-2 waiters");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.pending.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_registry() -> ConfirmRegistry {
        ConfirmRegistry::new(Duration::from_secs(30))
    }

    fn make_pending(
        id: &str,
        session_id: &str,
    ) -> (PendingConfirm, oneshot::Receiver<ConfirmDecision>) {
        let (tx, rx) = oneshot::channel();
        (
            PendingConfirm {
                tool_call_id: id.into(),
                session_id: session_id.into(),
                function_name: "send_email".into(),
                created_at: Instant::now(),
                respond: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn confirm_resolves_waiter() {
        let registry = make_registry();
        let (pending, rx) = make_pending("tc_1", "c1");
        registry.insert(pending);

        assert!(registry.confirm("tc_1"));
        assert!(matches!(rx.await.unwrap(), ConfirmDecision::Confirmed));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn cancel_resolves_waiter_with_reason() {
        let registry = make_registry();
        let (pending, rx) = make_pending("tc_1", "c1");
        registry.insert(pending);

        assert!(registry.cancel("tc_1", Some("User cancelled".into())));
        match rx.await.unwrap() {
            ConfirmDecision::Cancelled { reason } => {
                assert_eq!(reason.as_deref(), Some("User cancelled"));
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[test]
    fn resolution_is_exactly_once() {
        let registry = make_registry();
        let (pending, _rx) = make_pending("tc_1", "c1");
        registry.insert(pending);

        assert!(registry.confirm("tc_1"));
        // Losers become no-ops.
        assert!(!registry.confirm("tc_1"));
        assert!(!registry.cancel("tc_1", None));
    }

    #[test]
    fn confirm_nonexistent_returns_false() {
        let registry = make_registry();
        assert!(!registry.confirm("ghost"));
        assert!(!registry.cancel("ghost", None));
    }

    #[test]
    fn latest_for_session_picks_newest() {
        let registry = make_registry();
        let (p1, _rx1) = make_pending("tc_1", "c1");
        registry.insert(p1);
        std::thread::sleep(Duration::from_millis(2));
        let (p2, _rx2) = make_pending("tc_2", "c1");
        registry.insert(p2);
        let (p3, _rx3) = make_pending("tc_3", "c2");
        registry.insert(p3);

        assert_eq!(registry.latest_for_session("c1").as_deref(), Some("tc_2"));
        assert_eq!(registry.latest_for_session("c3"), None);
    }

    #[tokio::test]
    async fn session_close_cancels_own_waiters_only() {
        let registry = make_registry();
        let (p1, rx1) = make_pending("tc_1", "c1");
        let (p2, _rx2) = make_pending("tc_2", "c2");
        registry.insert(p1);
        registry.insert(p2);

        assert_eq!(registry.cancel_for_session("c1", "session_closed"), 1);
        match rx1.await.unwrap() {
            ConfirmDecision::Cancelled { reason } => {
                assert_eq!(reason.as_deref(), Some("session_closed"));
            }
            other => panic!("expected Cancelled, got {other:?}"),
        }
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn sweep_drops_stale_entries() {
        let registry = make_registry();
        let (pending, _rx) = make_pending("tc_1", "c1");
        registry.insert(pending);
        assert_eq!(registry.sweep_stale(Duration::from_secs(60)), 0);
        assert_eq!(registry.sweep_stale(Duration::from_nanos(0)), 1);
        assert_eq!(registry.count(), 0);
    }
}
