//! Callback-slot registry.
//!
//! Every tool call dispatched with a callback URL gets exactly one slot
//! mapping its `tool_call_id` back to the owning session, so gate
//! callbacks can find the browser socket and the upstream model. Slots
//! are cleared on Gate 3 / CANCELLED / FAILED / session close, and a
//! minutely reaper drops anything older than ten minutes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::relay::registry::SessionHandle;

#[derive(Clone)]
pub struct CallbackSlot {
    pub tool_call_id: String,
    pub function_name: String,
    pub session: SessionHandle,
    pub created_at: Instant,
}

#[derive(Default)]
pub struct CallbackRegistry {
    slots: Mutex<HashMap<String, CallbackSlot>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool_call_id: &str, function_name: &str, session: SessionHandle) {
        self.slots.lock().insert(
            tool_call_id.to_owned(),
            CallbackSlot {
                tool_call_id: tool_call_id.to_owned(),
                function_name: function_name.to_owned(),
                session,
                created_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, tool_call_id: &str) -> Option<CallbackSlot> {
        self.slots.lock().get(tool_call_id).cloned()
    }

    pub fn remove(&self, tool_call_id: &str) -> Option<CallbackSlot> {
        self.slots.lock().remove(tool_call_id)
    }

    pub fn contains(&self, tool_call_id: &str) -> bool {
        self.slots.lock().contains_key(tool_call_id)
    }

    /// Drop every slot owned by a session. Returns the number removed.
    pub fn remove_for_session(&self, session_id: &str) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.session.session_id != session_id);
        before - slots.len()
    }

    /// Drop slots older than `max_age`. Returns the number removed.
    pub fn reap(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| now.duration_since(slot.created_at) < max_age);
        let removed = before - slots.len();
        if removed > 0 {
            tracing::debug!(removed, "reaped stale callback slots");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.slots.lock().len()
    }
}
