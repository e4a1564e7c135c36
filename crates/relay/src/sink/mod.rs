//! Structured sink — fire-and-forget record delivery.
//!
//! `record(kind, payload)` never blocks and never fails the data path.
//! Records flow through a bounded channel to a worker task; delivery
//! failures land in a bounded retry buffer that a 30-second pulse drains.
//! Each record is attempted at most [`MAX_RETRIES`] times, then abandoned.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use vr_domain::{Error, Result};

/// Retry buffer capacity. Overflow drops the newest record.
const PENDING_CAP: usize = 1000;
/// Delivery attempts per record before it is abandoned.
const MAX_RETRIES: u32 = 3;
/// Channel capacity between producers and the worker.
const QUEUE_CAP: usize = 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Record kinds & transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    ToolExecution,
    Audit,
    SessionAnalytics,
    PendingLog,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ToolExecution => "tool_execution",
            Self::Audit => "audit",
            Self::SessionAnalytics => "session_analytics",
            Self::PendingLog => "pending_log",
        }
    }
}

/// Delivery backend. The production transport POSTs to the sink endpoint;
/// tests swap in a mock.
#[async_trait]
pub trait SinkTransport: Send + Sync {
    async fn deliver(&self, kind: RecordKind, payload: &Value) -> Result<()>;
}

pub struct HttpSinkTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpSinkTransport {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl SinkTransport for HttpSinkTransport {
    async fn deliver(&self, kind: RecordKind, payload: &Value) -> Result<()> {
        let body = serde_json::json!({
            "kind": kind.as_str(),
            "payload": payload,
            "recorded_at": Utc::now(),
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::Sink(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::Sink(format!("endpoint returned {}", resp.status())));
        }
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RecordSink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
struct SinkRecord {
    kind: RecordKind,
    payload: Value,
    retry_count: u32,
}

pub struct RecordSink {
    tx: mpsc::Sender<SinkRecord>,
    pending: Arc<Mutex<VecDeque<SinkRecord>>>,
    transport: Arc<dyn SinkTransport>,
}

impl RecordSink {
    /// Create the sink and spawn its worker task.
    pub fn spawn(transport: Arc<dyn SinkTransport>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<SinkRecord>(QUEUE_CAP);
        let pending = Arc::new(Mutex::new(VecDeque::new()));

        let sink = Arc::new(Self {
            tx,
            pending: pending.clone(),
            transport: transport.clone(),
        });

        tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = transport.deliver(record.kind, &record.payload).await {
                    tracing::warn!(kind = record.kind.as_str(), error = %e, "sink delivery failed");
                    push_pending(&pending, record);
                }
            }
        });

        sink
    }

    /// Enqueue a record. Non-blocking; drops with a warning when the
    /// worker queue is full.
    pub fn record(&self, kind: RecordKind, payload: Value) {
        let record = SinkRecord {
            kind,
            payload,
            retry_count: 0,
        };
        if let Err(e) = self.tx.try_send(record) {
            tracing::warn!(kind = kind.as_str(), error = %e, "sink queue full, dropping record");
        }
    }

    /// Retry buffered failures. Called on the 30-second pulse.
    pub async fn flush_pending(&self) {
        let batch: Vec<SinkRecord> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        tracing::debug!(count = batch.len(), "retrying buffered sink records");
        for mut record in batch {
            match self.transport.deliver(record.kind, &record.payload).await {
                Ok(()) => {}
                Err(e) => {
                    record.retry_count += 1;
                    if record.retry_count >= MAX_RETRIES {
                        tracing::warn!(
                            kind = record.kind.as_str(),
                            retries = record.retry_count,
                            error = %e,
                            "abandoning sink record"
                        );
                    } else {
                        push_pending(&self.pending, record);
                    }
                }
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

fn push_pending(pending: &Mutex<VecDeque<SinkRecord>>, record: SinkRecord) {
    let mut pending = pending.lock();
    if pending.len() >= PENDING_CAP {
        tracing::warn!(cap = PENDING_CAP, "sink retry buffer full, dropping record");
        return;
    }
    pending.push_back(record);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
