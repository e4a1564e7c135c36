//! Fixed-window rate limiter keyed by client address.
//!
//! Not sliding: each key holds `{count, window_start}`; the count resets
//! when a full window has elapsed. Every decision carries the values for
//! the `X-RateLimit-*` headers. Keys idle past twice the window are
//! evicted by the five-minute reaper.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Bucket {
    count: u32,
    window_start: Instant,
}

/// Outcome of a rate check, including header values.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the current window resets.
    pub reset_secs: u64,
    /// Retry hint for 429 responses.
    pub retry_after_ms: u64,
}

pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    limit: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limit,
            window,
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_owned()).or_insert(Bucket {
            count: 0,
            window_start: now,
        });

        // Window rolled over: reset.
        if now.duration_since(bucket.window_start) >= self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        let elapsed = now.duration_since(bucket.window_start);
        let remaining_window = self.window.saturating_sub(elapsed);

        if bucket.count < self.limit {
            bucket.count += 1;
            RateDecision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit - bucket.count,
                reset_secs: remaining_window.as_secs(),
                retry_after_ms: 0,
            }
        } else {
            RateDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset_secs: remaining_window.as_secs(),
                retry_after_ms: remaining_window.as_millis() as u64,
            }
        }
    }

    /// Evict keys idle longer than twice the window.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_cutoff = self.window * 2;
        let mut buckets = self.buckets.lock();
        let before = buckets.len();
        buckets.retain(|_, b| now.duration_since(b.window_start) < idle_cutoff);
        before - buckets.len()
    }

    pub fn key_count(&self) -> usize {
        self.buckets.lock().len()
    }
}
