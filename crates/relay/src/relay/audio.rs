//! Audio transmission telemetry.
//!
//! Counts audio frames in both directions and tracks inter-packet gaps on
//! the received (upstream → browser) stream. The summary lands in the
//! final session audit record.

use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// A received-stream gap longer than this is recorded.
const GAP_RECORD_MS: u64 = 500;
/// A gap longer than this additionally logs a warning.
const GAP_WARN_MS: u64 = 2000;

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    received: u64,
    last_received_at: Option<Instant>,
    largest_gap_ms: u64,
    gap_count: u64,
}

/// Transmission health summary.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AudioHealth {
    pub packet_loss_rate: f64,
    pub is_healthy: bool,
    pub largest_gap_ms: u64,
    pub gap_count: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

pub struct AudioMonitor {
    inner: Mutex<Counters>,
    loss_threshold: f64,
}

impl AudioMonitor {
    pub fn new(loss_threshold: f64) -> Self {
        Self {
            inner: Mutex::new(Counters::default()),
            loss_threshold,
        }
    }

    /// A browser → upstream audio frame passed through.
    pub fn note_sent(&self) {
        self.inner.lock().sent += 1;
    }

    /// An upstream → browser audio frame passed through.
    pub fn note_received(&self) {
        self.note_received_at(Instant::now());
    }

    fn note_received_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_received_at {
            let gap = now.saturating_duration_since(last);
            let gap_ms = gap.as_millis() as u64;
            if gap_ms > GAP_RECORD_MS {
                inner.gap_count += 1;
                inner.largest_gap_ms = inner.largest_gap_ms.max(gap_ms);
                if gap_ms > GAP_WARN_MS {
                    tracing::warn!(gap_ms, "large audio gap on received stream");
                }
            }
        }
        inner.last_received_at = Some(now);
        inner.received += 1;
    }

    pub fn health(&self) -> AudioHealth {
        let inner = self.inner.lock();
        let sent = inner.sent.max(1);
        let loss = 1.0 - (inner.received as f64 / sent as f64);
        let loss = loss.clamp(0.0, 1.0);
        AudioHealth {
            packet_loss_rate: loss,
            is_healthy: loss < self.loss_threshold,
            largest_gap_ms: inner.largest_gap_ms,
            gap_count: inner.gap_count,
            frames_sent: inner.sent,
            frames_received: inner.received,
        }
    }
}
