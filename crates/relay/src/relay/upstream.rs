//! Upstream connection manager.
//!
//! Opens one realtime WebSocket per session, shielded by bounded retry
//! with exponential backoff and a process-wide circuit breaker. The
//! upstream is the dominant failure mode; without the breaker a regional
//! outage turns every new browser connection into a retry storm.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Acquire attempts per session before giving up.
const MAX_ATTEMPTS: u32 = 5;
/// Base delay for the exponential backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Consecutive failed acquires that open the breaker.
const BREAKER_THRESHOLD: u32 = 5;
/// How long the breaker stays open.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("circuit_open")]
    CircuitOpen,
    #[error("handshake_timeout")]
    HandshakeTimeout,
    #[error("auth_failed: upstream rejected credentials ({0})")]
    AuthFailed(u16),
    #[error("transport: {0}")]
    Transport(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Circuit breaker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Process-wide breaker counting consecutive failed acquires.
/// A single success resets the counter and closes it.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner::default()),
            threshold,
            cooldown,
        }
    }

    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    fn is_open_at(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.opened_at {
            Some(opened) => now.duration_since(opened) < self.cooldown,
            None => false,
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.threshold {
            if inner.opened_at.is_none() {
                tracing::error!(
                    failures = inner.consecutive_failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "upstream circuit breaker opened"
                );
            }
            inner.opened_at = Some(now);
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.opened_at.is_some() {
            tracing::info!("upstream circuit breaker closed");
        }
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }
}

/// Backoff before retry `attempt` (0-indexed): `1s · 2^attempt`.
pub fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempt)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct UpstreamManager {
    url: String,
    api_key: String,
    handshake_timeout: Duration,
    breaker: CircuitBreaker,
}

impl UpstreamManager {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            handshake_timeout,
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Open an upstream socket for a session.
    ///
    /// Retries transient failures up to [`MAX_ATTEMPTS`] times; an auth
    /// rejection is permanent and fails immediately. Each failed acquire
    /// feeds the process-wide breaker.
    pub async fn acquire(&self, connection_id: &str) -> Result<UpstreamSocket, UpstreamError> {
        if self.breaker.is_open() {
            tracing::warn!(connection_id, "upstream acquire rejected: circuit open");
            return Err(UpstreamError::CircuitOpen);
        }

        let mut last_err = UpstreamError::Transport("no attempt made".into());
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }
            match self.connect_once().await {
                Ok(socket) => {
                    self.breaker.record_success();
                    tracing::info!(connection_id, attempt, "upstream connected");
                    return Ok(socket);
                }
                Err(e @ UpstreamError::AuthFailed(_)) => {
                    self.breaker.record_failure();
                    tracing::error!(connection_id, error = %e, "upstream auth failed");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(connection_id, attempt, error = %e, "upstream connect failed");
                    last_err = e;
                }
            }
        }

        self.breaker.record_failure();
        Err(last_err)
    }

    async fn connect_once(&self) -> Result<UpstreamSocket, UpstreamError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth);
        request
            .headers_mut()
            .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let connect = connect_async(request);
        match tokio::time::timeout(self.handshake_timeout, connect).await {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(tokio_tungstenite::tungstenite::Error::Http(response))) => {
                let status = response.status();
                if status.as_u16() == 401 || status.as_u16() == 403 {
                    Err(UpstreamError::AuthFailed(status.as_u16()))
                } else {
                    Err(UpstreamError::Transport(format!("HTTP {status}")))
                }
            }
            Ok(Err(e)) => Err(UpstreamError::Transport(e.to_string())),
            Err(_) => Err(UpstreamError::HandshakeTimeout),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        let t0 = Instant::now();
        for _ in 0..4 {
            breaker.record_failure_at(t0);
        }
        assert!(!breaker.is_open_at(t0));
        breaker.record_failure_at(t0);
        assert!(breaker.is_open_at(t0));
    }

    #[test]
    fn breaker_cooldown_elapses() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        let t0 = Instant::now();
        breaker.record_failure_at(t0);
        assert!(breaker.is_open_at(t0));
        assert!(breaker.is_open_at(t0 + Duration::from_secs(29)));
        assert!(!breaker.is_open_at(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn failure_after_cooldown_reopens() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        let t0 = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(t0);
        }
        let after_cooldown = t0 + Duration::from_secs(31);
        assert!(!breaker.is_open_at(after_cooldown));
        // Counter is still over threshold; one more failure re-opens.
        breaker.record_failure_at(after_cooldown);
        assert!(breaker.is_open_at(after_cooldown));
    }

    #[test]
    fn single_success_resets_breaker() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        let t0 = Instant::now();
        for _ in 0..5 {
            breaker.record_failure_at(t0);
        }
        assert!(breaker.is_open_at(t0));
        breaker.record_success();
        assert!(!breaker.is_open_at(t0));
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn acquire_fails_fast_when_open() {
        let manager = UpstreamManager::new(
            "wss://upstream.invalid/v1/realtime",
            "sk-test",
            Duration::from_secs(1),
        );
        for _ in 0..BREAKER_THRESHOLD {
            manager.breaker().record_failure();
        }
        let started = Instant::now();
        let err = manager.acquire("c1").await.unwrap_err();
        assert!(matches!(err, UpstreamError::CircuitOpen));
        // No handshake attempt, no backoff sleep.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(UpstreamError::CircuitOpen.to_string(), "circuit_open");
        assert_eq!(
            UpstreamError::HandshakeTimeout.to_string(),
            "handshake_timeout"
        );
        assert!(UpstreamError::AuthFailed(401).to_string().starts_with("auth_failed"));
    }
}
