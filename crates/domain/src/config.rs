//! Relay configuration, read entirely from the environment.
//!
//! Missing upstream credentials or a missing sink endpoint are fatal:
//! `validate()` reports them as `ConfigSeverity::Error` and the server
//! refuses to start.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RelayConfig
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct RelayConfig {
    /// HTTP bind host.
    pub host: String,
    /// HTTP bind port.
    pub port: u16,

    /// Upstream realtime WebSocket endpoint.
    pub upstream_url: String,
    /// Bearer key sent on the upstream handshake.
    #[serde(skip_serializing)]
    pub upstream_api_key: String,

    /// Structured-sink HTTP endpoint (tool executions, audits, analytics).
    pub sink_url: String,

    /// Per-tool webhook map: function name → workflow URL.
    pub tool_webhooks: HashMap<String, String>,
    /// Fallback dispatcher webhook for tools without a dedicated entry.
    pub dispatch_webhook: Option<String>,

    /// Public base URL workflows call back on (`{base}/tool-progress`).
    pub callback_base_url: Option<String>,
    /// Hostname allowlist for callback URLs. Entries starting with `.`
    /// match as a domain suffix.
    pub callback_whitelist: Vec<String>,

    /// HMAC secret for gate callbacks. Empty ⇒ verification disabled.
    #[serde(skip_serializing)]
    pub hmac_secret: Option<String>,

    /// Requests allowed per rate window, keyed by client address.
    pub rate_limit: u32,
    /// Fixed rate window in seconds.
    pub rate_window_secs: u64,

    /// Gate-2 confirmation window in seconds.
    pub gate2_timeout_secs: u64,
    /// Upstream handshake deadline in seconds.
    pub handshake_timeout_secs: u64,
    /// Webhook dispatch POST deadline in seconds.
    pub dispatch_timeout_secs: u64,

    /// Packet-loss ratio above which a session's audio is unhealthy.
    pub audio_loss_threshold: f64,

    /// Optional TTS egress endpoint for assistant transcripts.
    pub tts_egress_url: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            upstream_url: String::new(),
            upstream_api_key: String::new(),
            sink_url: String::new(),
            tool_webhooks: HashMap::new(),
            dispatch_webhook: None,
            callback_base_url: None,
            callback_whitelist: Vec::new(),
            hmac_secret: None,
            rate_limit: 100,
            rate_window_secs: 60,
            gate2_timeout_secs: 30,
            handshake_timeout_secs: 30,
            dispatch_timeout_secs: 30,
            audio_loss_threshold: 0.05,
            tts_egress_url: None,
        }
    }
}

impl RelayConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through an arbitrary lookup function.
    /// Unset or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Self {
            host: get("VR_HOST").unwrap_or(d.host),
            port: get("VR_PORT").and_then(|v| v.parse().ok()).unwrap_or(d.port),
            upstream_url: get("VR_UPSTREAM_URL").unwrap_or_default(),
            upstream_api_key: get("VR_UPSTREAM_API_KEY").unwrap_or_default(),
            sink_url: get("VR_SINK_URL").unwrap_or_default(),
            tool_webhooks: get("VR_TOOL_WEBHOOKS")
                .map(|raw| parse_webhook_map(&raw))
                .unwrap_or_default(),
            dispatch_webhook: get("VR_DISPATCH_WEBHOOK"),
            callback_base_url: get("VR_CALLBACK_BASE_URL"),
            callback_whitelist: get("VR_CALLBACK_WHITELIST")
                .map(|raw| {
                    raw.split(',')
                        .map(|h| h.trim().to_owned())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            hmac_secret: get("VR_HMAC_SECRET"),
            rate_limit: get("VR_RATE_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.rate_limit),
            rate_window_secs: d.rate_window_secs,
            gate2_timeout_secs: get("VR_GATE2_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.gate2_timeout_secs),
            handshake_timeout_secs: get("VR_HANDSHAKE_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.handshake_timeout_secs),
            dispatch_timeout_secs: get("VR_DISPATCH_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.dispatch_timeout_secs),
            audio_loss_threshold: get("VR_AUDIO_LOSS_THRESHOLD")
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.audio_loss_threshold),
            tts_egress_url: get("VR_TTS_EGRESS_URL"),
        }
    }

    /// Validate the configuration. Error-severity issues abort startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut error = |field: &str, message: &str| {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message: message.into(),
            });
        };

        if self.upstream_url.is_empty() {
            error("VR_UPSTREAM_URL", "upstream WebSocket URL is required");
        } else if !self.upstream_url.starts_with("ws://") && !self.upstream_url.starts_with("wss://")
        {
            error("VR_UPSTREAM_URL", "must be a ws:// or wss:// URL");
        }
        if self.upstream_api_key.is_empty() {
            error("VR_UPSTREAM_API_KEY", "upstream API key is required");
        }
        if self.sink_url.is_empty() {
            error("VR_SINK_URL", "structured-sink endpoint is required");
        }
        if self.rate_limit == 0 {
            error("VR_RATE_LIMIT", "must be greater than zero");
        }

        if self.tool_webhooks.is_empty() && self.dispatch_webhook.is_none() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "VR_TOOL_WEBHOOKS".into(),
                message: "no tool webhooks configured — every remote tool call will fail".into(),
            });
        }
        if self.callback_base_url.is_some() && self.callback_whitelist.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "VR_CALLBACK_WHITELIST".into(),
                message: "callback base URL set but allowlist is empty — callbacks will be omitted"
                    .into(),
            });
        }

        issues
    }
}

/// Parse `name=url,name=url` pairs. Malformed pairs are skipped.
fn parse_webhook_map(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, url) = pair.trim().split_once('=')?;
            if name.is_empty() || url.is_empty() {
                return None;
            }
            Some((name.to_owned(), url.to_owned()))
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
