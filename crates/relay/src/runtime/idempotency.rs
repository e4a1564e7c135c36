//! Duplicate gate-callback suppression.
//!
//! Workflows retry callbacks; re-receiving the same `(tool_call_id, gate)`
//! within the TTL returns the original response verbatim and triggers no
//! further side effects.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

struct CachedResponse {
    stored_at: Instant,
    body: Value,
}

pub struct IdempotencyRegistry {
    entries: Mutex<HashMap<(String, u8), CachedResponse>>,
    ttl: Duration,
}

impl IdempotencyRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// The cached response for a duplicate submission, if still fresh.
    pub fn check(&self, tool_call_id: &str, gate: u8) -> Option<Value> {
        let entries = self.entries.lock();
        let cached = entries.get(&(tool_call_id.to_owned(), gate))?;
        if cached.stored_at.elapsed() < self.ttl {
            Some(cached.body.clone())
        } else {
            None
        }
    }

    pub fn store(&self, tool_call_id: &str, gate: u8, body: Value) {
        let mut entries = self.entries.lock();

        // Lazy cleanup when the map grows large.
        if entries.len() > 10_000 {
            let ttl = self.ttl;
            entries.retain(|_, c| c.stored_at.elapsed() < ttl);
        }

        entries.insert(
            (tool_call_id.to_owned(), gate),
            CachedResponse {
                stored_at: Instant::now(),
                body,
            },
        );
    }

    /// Drop expired entries. Returns the eviction count.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, c| c.stored_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_returns_original_body() {
        let registry = IdempotencyRegistry::new(Duration::from_secs(300));
        let body = serde_json::json!({"continue": true, "cancel": false});
        registry.store("tc_1", 1, body.clone());

        assert_eq!(registry.check("tc_1", 1), Some(body));
        // Different gate for the same id is a miss.
        assert_eq!(registry.check("tc_1", 2), None);
        assert_eq!(registry.check("tc_2", 1), None);
    }

    #[test]
    fn expired_entries_are_misses() {
        let registry = IdempotencyRegistry::new(Duration::from_millis(0));
        registry.store("tc_1", 1, serde_json::json!({}));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(registry.check("tc_1", 1), None);
    }

    #[test]
    fn sweep_evicts_expired() {
        let registry = IdempotencyRegistry::new(Duration::from_millis(0));
        registry.store("tc_1", 1, serde_json::json!({}));
        registry.store("tc_2", 3, serde_json::json!({}));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(registry.sweep(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn store_overwrites_previous_entry() {
        let registry = IdempotencyRegistry::new(Duration::from_secs(300));
        registry.store("tc_1", 2, serde_json::json!({"cancel": false}));
        registry.store("tc_1", 2, serde_json::json!({"cancel": true}));
        assert_eq!(
            registry.check("tc_1", 2),
            Some(serde_json::json!({"cancel": true}))
        );
    }
}
