//! Per-session in-memory cache with TTL.
//!
//! Holds free-form context keys, in-flight tool tracking, a bounded ring
//! of recently completed tools, and the last query result. Durable
//! context writes go through to the sink as `session_analytics` records.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use crate::sink::{RecordKind, RecordSink};

/// Recent-tool ring capacity.
const RECENT_RING: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct PendingTool {
    pub function_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentTool {
    pub function_name: String,
    pub status: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Default)]
struct SessionEntry {
    context: HashMap<String, Value>,
    pending_tools: HashMap<String, PendingTool>,
    recent_tools: VecDeque<RecentTool>,
    last_query_result: Option<Value>,
    last_touch: Option<Instant>,
}

pub struct SessionCache {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    ttl: Duration,
    sink: Arc<RecordSink>,
}

impl SessionCache {
    pub fn new(ttl: Duration, sink: Arc<RecordSink>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl,
            sink,
        }
    }

    // ── Context keys ──────────────────────────────────────────────

    pub fn set_context(&self, session_id: &str, key: &str, value: Value, durable: bool) {
        if durable {
            self.sink.record(
                RecordKind::SessionAnalytics,
                serde_json::json!({
                    "session_id": session_id,
                    "key": key,
                    "value": value,
                }),
            );
        }
        self.with_entry(session_id, |entry| {
            entry.context.insert(key.to_owned(), value);
        });
    }

    pub fn get_context(&self, session_id: &str, key: &str) -> Option<Value> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|e| e.context.get(key).cloned())
    }

    pub fn context_snapshot(&self, session_id: &str) -> Value {
        self.sessions
            .read()
            .get(session_id)
            .map(|e| serde_json::json!(e.context))
            .unwrap_or_else(|| serde_json::json!({}))
    }

    // ── Pending tools ─────────────────────────────────────────────

    pub fn track_pending(&self, session_id: &str, tool_call_id: &str, function_name: &str) {
        self.with_entry(session_id, |entry| {
            entry.pending_tools.insert(
                tool_call_id.to_owned(),
                PendingTool {
                    function_name: function_name.to_owned(),
                    status: "PENDING".into(),
                    created_at: Utc::now(),
                },
            );
        });
    }

    pub fn update_pending(&self, session_id: &str, tool_call_id: &str, status: &str) {
        self.with_entry(session_id, |entry| {
            if let Some(pending) = entry.pending_tools.get_mut(tool_call_id) {
                pending.status = status.to_owned();
            }
        });
    }

    /// Remove a pending tool and push it onto the recent ring.
    pub fn resolve_pending(&self, session_id: &str, tool_call_id: &str, status: &str) {
        self.with_entry(session_id, |entry| {
            if let Some(pending) = entry.pending_tools.remove(tool_call_id) {
                if entry.recent_tools.len() >= RECENT_RING {
                    entry.recent_tools.pop_front();
                }
                entry.recent_tools.push_back(RecentTool {
                    function_name: pending.function_name,
                    status: status.to_owned(),
                    completed_at: Utc::now(),
                });
            }
        });
    }

    pub fn pending_tools(&self, session_id: &str) -> Vec<(String, PendingTool)> {
        self.sessions
            .read()
            .get(session_id)
            .map(|e| {
                e.pending_tools
                    .iter()
                    .map(|(id, p)| (id.clone(), p.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn recent_tools(&self, session_id: &str) -> Vec<RecentTool> {
        self.sessions
            .read()
            .get(session_id)
            .map(|e| e.recent_tools.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ── Last query result ─────────────────────────────────────────

    pub fn set_last_query_result(&self, session_id: &str, value: Value) {
        self.with_entry(session_id, |entry| {
            entry.last_query_result = Some(value);
        });
    }

    pub fn last_query_result(&self, session_id: &str) -> Option<Value> {
        self.sessions
            .read()
            .get(session_id)
            .and_then(|e| e.last_query_result.clone())
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.write().remove(session_id);
    }

    /// Evict sessions idle past the TTL. Returns the eviction count.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, entry| match entry.last_touch {
            Some(touch) => now.duration_since(touch) < self.ttl,
            None => true,
        });
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    fn with_entry(&self, session_id: &str, f: impl FnOnce(&mut SessionEntry)) {
        let mut sessions = self.sessions.write();
        let entry = sessions.entry(session_id.to_owned()).or_default();
        entry.last_touch = Some(Instant::now());
        f(entry);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
