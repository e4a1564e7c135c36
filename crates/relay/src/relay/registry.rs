//! Connected-session registry.
//!
//! One [`SessionHandle`] per live browser connection. The handle carries
//! the outbound channels for both peers so HTTP gate handlers can push
//! notifications to the browser and nudge the upstream model without
//! touching the socket tasks directly.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::Message;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use vr_protocol::BrowserNotice;

/// Outbound frames to the upstream writer task: raw passthrough text or a
/// polite close when the session tears down.
#[derive(Debug)]
pub enum UpstreamFrame {
    Text(String),
    Close,
}

use super::audio::AudioMonitor;
use super::context::ConversationContext;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Phases
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-session lifecycle. New function calls are accepted only in `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Browser attached, upstream being acquired; browser frames queue.
    Establishing,
    /// Both peers open; bidirectional forwarding runs.
    Ready,
    /// One peer closed; in-flight tool calls settle, no new ones start.
    Draining,
    /// Both peers closed and cleanup done.
    Closed,
    /// Upstream acquisition failed; session surfaced 1011 to the browser.
    Failed,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionHandle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cheaply-cloneable view of a live session.
#[derive(Clone)]
pub struct SessionHandle {
    /// Connection id; doubles as the session id for its whole lifetime.
    pub connection_id: String,
    pub session_id: String,
    pub bot_id: Option<String>,
    pub bot_name: Option<String>,
    pub connected_at: DateTime<Utc>,
    browser_tx: mpsc::Sender<Message>,
    upstream_tx: mpsc::Sender<UpstreamFrame>,
    pub context: Arc<Mutex<ConversationContext>>,
    pub audio: Arc<AudioMonitor>,
    phase: Arc<Mutex<SessionPhase>>,
}

impl SessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection_id: String,
        bot_id: Option<String>,
        bot_name: Option<String>,
        browser_tx: mpsc::Sender<Message>,
        upstream_tx: mpsc::Sender<UpstreamFrame>,
        audio: Arc<AudioMonitor>,
    ) -> Self {
        Self {
            session_id: connection_id.clone(),
            connection_id,
            bot_id,
            bot_name,
            connected_at: Utc::now(),
            browser_tx,
            upstream_tx,
            context: Arc::new(Mutex::new(ConversationContext::new())),
            audio,
            phase: Arc::new(Mutex::new(SessionPhase::Establishing)),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn set_phase(&self, phase: SessionPhase) {
        *self.phase.lock() = phase;
    }

    /// Push an injected notification frame to the browser. Best-effort:
    /// returns `false` when the socket has gone away.
    pub async fn notify_browser(&self, notice: &BrowserNotice) -> bool {
        let json = match serde_json::to_string(notice) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize browser notice");
                return false;
            }
        };
        self.browser_tx.send(Message::Text(json)).await.is_ok()
    }

    /// Forward a raw frame to the browser.
    pub async fn forward_to_browser(&self, text: String) -> bool {
        self.browser_tx.send(Message::Text(text)).await.is_ok()
    }

    /// Send an event to the upstream model. Best-effort.
    pub async fn send_upstream(&self, event: Value) -> bool {
        self.upstream_tx
            .send(UpstreamFrame::Text(event.to_string()))
            .await
            .is_ok()
    }

    /// Forward a raw browser frame to the upstream untouched.
    pub async fn forward_to_upstream(&self, text: String) -> bool {
        self.upstream_tx
            .send(UpstreamFrame::Text(text))
            .await
            .is_ok()
    }

    /// Ask the upstream writer to close the socket with a normal code.
    pub async fn close_upstream(&self) {
        let _ = self.upstream_tx.send(UpstreamFrame::Close).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionRegistry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: SessionHandle) {
        self.sessions
            .write()
            .insert(handle.connection_id.clone(), handle);
    }

    pub fn get(&self, connection_id: &str) -> Option<SessionHandle> {
        self.sessions.read().get(connection_id).cloned()
    }

    pub fn remove(&self, connection_id: &str) -> Option<SessionHandle> {
        self.sessions.write().remove(connection_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Test support
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
pub(crate) fn test_handle(
    connection_id: &str,
) -> (
    SessionHandle,
    mpsc::Receiver<Message>,
    mpsc::Receiver<UpstreamFrame>,
) {
    let (browser_tx, browser_rx) = mpsc::channel(16);
    let (upstream_tx, upstream_rx) = mpsc::channel(16);
    let handle = SessionHandle::new(
        connection_id.to_owned(),
        None,
        None,
        browser_tx,
        upstream_tx,
        Arc::new(AudioMonitor::new(0.05)),
    );
    (handle, browser_rx, upstream_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vr_protocol::GateStatus;

    #[test]
    fn register_get_remove() {
        let registry = SessionRegistry::new();
        let (handle, _b, _u) = test_handle("c1");
        registry.register(handle);
        assert_eq!(registry.count(), 1);
        assert!(registry.get("c1").is_some());
        assert!(registry.get("c2").is_none());
        assert!(registry.remove("c1").is_some());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn session_id_equals_connection_id() {
        let (handle, _b, _u) = test_handle("c1");
        assert_eq!(handle.session_id, handle.connection_id);
    }

    #[test]
    fn phase_transitions() {
        let (handle, _b, _u) = test_handle("c1");
        assert_eq!(handle.phase(), SessionPhase::Establishing);
        handle.set_phase(SessionPhase::Ready);
        assert_eq!(handle.phase(), SessionPhase::Ready);
        // Clones share phase.
        let clone = handle.clone();
        clone.set_phase(SessionPhase::Closed);
        assert_eq!(handle.phase(), SessionPhase::Closed);
    }

    #[tokio::test]
    async fn notify_browser_delivers_frame() {
        let (handle, mut browser_rx, _u) = test_handle("c1");
        let delivered = handle
            .notify_browser(&BrowserNotice::ToolConfirmed {
                tool_call_id: "tc_1".into(),
                confirmed: true,
            })
            .await;
        assert!(delivered);

        let frame = browser_rx.recv().await.unwrap();
        let Message::Text(text) = frame else {
            panic!("expected text frame");
        };
        let json: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "tool_confirmed");
        assert_eq!(json["confirmed"], true);
    }

    #[tokio::test]
    async fn send_upstream_serializes_event() {
        let (handle, _b, mut upstream_rx) = test_handle("c1");
        assert!(handle.send_upstream(serde_json::json!({"type": "response.create"})).await);
        match upstream_rx.recv().await.unwrap() {
            UpstreamFrame::Text(text) => {
                let json: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(json["type"], "response.create");
            }
            UpstreamFrame::Close => panic!("expected text frame"),
        }
    }

    #[tokio::test]
    async fn close_upstream_sends_close_frame() {
        let (handle, _b, mut upstream_rx) = test_handle("c1");
        handle.close_upstream().await;
        assert!(matches!(
            upstream_rx.recv().await.unwrap(),
            UpstreamFrame::Close
        ));
    }

    #[tokio::test]
    async fn notify_browser_fails_when_socket_gone() {
        let (handle, browser_rx, _u) = test_handle("c1");
        drop(browser_rx);
        let delivered = handle
            .notify_browser(&BrowserNotice::ToolGate {
                tool_call_id: "tc_1".into(),
                gate: Some(1),
                status: GateStatus::Preparing,
                message: "m".into(),
                voice_response: None,
                requires_confirmation: None,
                awaiting_confirmation: None,
                cancellable: None,
                result: None,
                execution_time_ms: None,
            })
            .await;
        assert!(!delivered);
    }
}
