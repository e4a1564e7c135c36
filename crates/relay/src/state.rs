use std::sync::Arc;
use std::time::{Duration, Instant};

use vr_domain::RelayConfig;

use crate::relay::cache::SessionCache;
use crate::relay::registry::SessionRegistry;
use crate::relay::upstream::UpstreamManager;
use crate::runtime::callbacks::CallbackRegistry;
use crate::runtime::cancel::CancelRegistry;
use crate::runtime::confirm::ConfirmRegistry;
use crate::runtime::idempotency::IdempotencyRegistry;
use crate::runtime::rate_limit::RateLimiter;
use crate::runtime::tools::ToolExecutor;
use crate::sink::{HttpSinkTransport, RecordSink, SinkTransport};

/// Idempotency-cache TTL for duplicate gate callbacks.
const IDEMPOTENCY_TTL: Duration = Duration::from_secs(300);
/// Session-cache entry TTL.
const SESSION_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Shared application state passed to all handlers.
///
/// Each registry guards its own map with its own lock; no handler ever
/// holds two registry locks at once.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub http: reqwest::Client,

    // ── Sessions ─────────────────────────────────────────────────────
    pub sessions: Arc<SessionRegistry>,
    pub cache: Arc<SessionCache>,

    // ── Gated execution registries ───────────────────────────────────
    pub callbacks: Arc<CallbackRegistry>,
    pub cancels: Arc<CancelRegistry>,
    pub confirms: Arc<ConfirmRegistry>,
    pub idempotency: Arc<IdempotencyRegistry>,

    // ── Edge protection ──────────────────────────────────────────────
    pub rate: Arc<RateLimiter>,

    // ── Upstream & dispatch ──────────────────────────────────────────
    pub upstream: Arc<UpstreamManager>,
    pub tools: Arc<ToolExecutor>,

    // ── Telemetry ────────────────────────────────────────────────────
    pub sink: Arc<RecordSink>,
    pub started_at: Instant,
}

impl AppState {
    pub fn from_config(config: Arc<RelayConfig>) -> Self {
        let http = reqwest::Client::new();
        let transport: Arc<dyn SinkTransport> =
            Arc::new(HttpSinkTransport::new(http.clone(), config.sink_url.clone()));
        Self::with_sink_transport(config, http, transport)
    }

    /// Build the state with an explicit sink transport (tests swap in a mock).
    pub fn with_sink_transport(
        config: Arc<RelayConfig>,
        http: reqwest::Client,
        transport: Arc<dyn SinkTransport>,
    ) -> Self {
        let sink = RecordSink::spawn(transport);
        let cache = Arc::new(SessionCache::new(SESSION_CACHE_TTL, sink.clone()));
        let callbacks = Arc::new(CallbackRegistry::new());
        let cancels = Arc::new(CancelRegistry::new());
        let confirms = Arc::new(ConfirmRegistry::new(Duration::from_secs(
            config.gate2_timeout_secs,
        )));
        let idempotency = Arc::new(IdempotencyRegistry::new(IDEMPOTENCY_TTL));
        let rate = Arc::new(RateLimiter::new(
            config.rate_limit,
            Duration::from_secs(config.rate_window_secs),
        ));
        let upstream = Arc::new(UpstreamManager::new(
            config.upstream_url.clone(),
            config.upstream_api_key.clone(),
            Duration::from_secs(config.handshake_timeout_secs),
        ));
        let tools = Arc::new(ToolExecutor::new(
            config.clone(),
            http.clone(),
            callbacks.clone(),
            confirms.clone(),
            cache.clone(),
            sink.clone(),
        ));

        Self {
            config,
            http,
            sessions: Arc::new(SessionRegistry::new()),
            cache,
            callbacks,
            cancels,
            confirms,
            idempotency,
            rate,
            upstream,
            tools,
            sink,
            started_at: Instant::now(),
        }
    }
}
