//! Cancellation-request registry.
//!
//! A cancel can arrive before the workflow's next gate callback; the
//! request parks here and the next gate inspection consumes it. Every
//! request is tagged with the owning session id so session close can
//! remove exactly its own entries.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub reason: Option<String>,
    pub session_id: Option<String>,
    pub requested_at: Instant,
}

#[derive(Default)]
pub struct CancelRegistry {
    requests: Mutex<HashMap<String, CancelRequest>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tool_call_id: &str, reason: Option<String>, session_id: Option<String>) {
        self.requests.lock().insert(
            tool_call_id.to_owned(),
            CancelRequest {
                reason,
                session_id,
                requested_at: Instant::now(),
            },
        );
    }

    /// Consume a pending cancel request, if any.
    pub fn take(&self, tool_call_id: &str) -> Option<CancelRequest> {
        self.requests.lock().remove(tool_call_id)
    }

    /// Inspect without consuming.
    pub fn peek(&self, tool_call_id: &str) -> Option<CancelRequest> {
        self.requests.lock().get(tool_call_id).cloned()
    }

    pub fn remove(&self, tool_call_id: &str) {
        self.requests.lock().remove(tool_call_id);
    }

    pub fn remove_for_session(&self, session_id: &str) -> usize {
        let mut requests = self.requests.lock();
        let before = requests.len();
        requests.retain(|_, req| req.session_id.as_deref() != Some(session_id));
        before - requests.len()
    }

    pub fn reap(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut requests = self.requests.lock();
        let before = requests.len();
        requests.retain(|_, req| now.duration_since(req.requested_at) < max_age);
        before - requests.len()
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }
}
