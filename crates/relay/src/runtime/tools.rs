//! Tool executor — routes model function calls to workflow webhooks.
//!
//! Remote tools resolve to a webhook by name (exact map entry, else the
//! default dispatcher); the request carries the args, a conversation
//! snapshot, a freshly minted `tool_call_id`, and — when admissible — a
//! callback URL for the gated execution protocol. Four local tools
//! resolve synchronously from in-process state and never leave the
//! process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::oneshot;
use uuid::Uuid;
use vr_domain::{Error, RelayConfig};
use vr_protocol::{upstream, WebhookResponse};

use crate::relay::cache::SessionCache;
use crate::relay::registry::SessionHandle;
use crate::runtime::callback_url::validate_callback_url;
use crate::runtime::callbacks::CallbackRegistry;
use crate::runtime::confirm::{ConfirmDecision, ConfirmRegistry, PendingConfirm};
use crate::sink::{RecordKind, RecordSink};

/// Conversation items included in webhook snapshots.
const SNAPSHOT_ITEMS: usize = 20;

pub struct ToolExecutor {
    config: Arc<RelayConfig>,
    http: reqwest::Client,
    callbacks: Arc<CallbackRegistry>,
    confirms: Arc<ConfirmRegistry>,
    cache: Arc<SessionCache>,
    sink: Arc<RecordSink>,
}

impl ToolExecutor {
    pub fn new(
        config: Arc<RelayConfig>,
        http: reqwest::Client,
        callbacks: Arc<CallbackRegistry>,
        confirms: Arc<ConfirmRegistry>,
        cache: Arc<SessionCache>,
        sink: Arc<RecordSink>,
    ) -> Self {
        Self {
            config,
            http,
            callbacks,
            confirms,
            cache,
            sink,
        }
    }

    /// Run a function call end to end: resolve, dispatch, record the
    /// result in the conversation, and hand it back to the model as a
    /// `function_call_output` followed by `response.create`.
    ///
    /// `call_id` is the model's own id for the invocation; the gate
    /// protocol uses the server-generated `tool_call_id` instead.
    pub async fn execute(
        &self,
        call_id: &str,
        function_name: &str,
        args: Value,
        session: &SessionHandle,
    ) {
        let output = self.run(function_name, args, session).await;

        {
            let mut ctx = session.context.lock();
            ctx.push_tool_result(call_id, output.clone());
        }

        if !session
            .send_upstream(upstream::function_call_output(call_id, &output))
            .await
        {
            tracing::warn!(
                session_id = %session.session_id,
                function_name,
                "upstream closed before tool result could be returned"
            );
            return;
        }
        session.send_upstream(upstream::response_create()).await;
    }

    async fn run(&self, function_name: &str, args: Value, session: &SessionHandle) -> Value {
        match function_name {
            "confirm_pending_action" => self.confirm_pending_action(&args, session),
            "get_session_context" => self.get_session_context(&args, session),
            "query_conversation_history" => self.query_conversation_history(&args, session),
            "query_user_analytics" => self.query_user_analytics(session),
            _ => self.dispatch_remote(function_name, args, session).await,
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Remote dispatch
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn dispatch_remote(
        &self,
        function_name: &str,
        args: Value,
        session: &SessionHandle,
    ) -> Value {
        let tool_call_id = generate_tool_call_id();

        {
            let mut ctx = session.context.lock();
            ctx.push_tool_call(&tool_call_id, function_name, args.clone());
        }
        self.cache
            .track_pending(&session.session_id, &tool_call_id, function_name);

        let (webhook_url, is_dispatcher) = match self.resolve_webhook(function_name) {
            Some(pair) => pair,
            None => {
                tracing::error!(function_name, "no webhook configured");
                self.cache
                    .resolve_pending(&session.session_id, &tool_call_id, "FAILED");
                return json!({
                    "success": false,
                    "error": "NO_WEBHOOK_CONFIGURED",
                    "message": format!("No webhook is configured for {function_name}"),
                });
            }
        };

        let callback_url = self.resolve_callback_url();
        if callback_url.is_some() {
            self.callbacks
                .register(&tool_call_id, function_name, session.clone());
        }

        let body = build_request_body(
            function_name,
            &args,
            session,
            &tool_call_id,
            callback_url.as_deref(),
            is_dispatcher,
        );

        tracing::info!(
            function_name,
            tool_call_id = %tool_call_id,
            dispatcher = is_dispatcher,
            has_callback = callback_url.is_some(),
            "dispatching tool call"
        );

        let started = Instant::now();
        let response = self
            .http
            .post(&webhook_url)
            .json(&body)
            .timeout(Duration::from_secs(self.config.dispatch_timeout_secs))
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                return self.dispatch_failed(
                    &tool_call_id,
                    function_name,
                    session,
                    Error::Dispatch(format!("webhook unreachable: {e}")),
                );
            }
        };

        let status = response.status();
        if !status.is_success() {
            return self.dispatch_failed(
                &tool_call_id,
                function_name,
                session,
                Error::Dispatch(format!("webhook returned {status}")),
            );
        }

        let parsed: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return self.dispatch_failed(
                    &tool_call_id,
                    function_name,
                    session,
                    Error::Dispatch(format!("invalid webhook response: {e}")),
                );
            }
        };

        let ack: WebhookResponse = serde_json::from_value(parsed.clone()).unwrap_or_default();
        if ack.success == Some(false) {
            tracing::warn!(
                function_name,
                tool_call_id = %tool_call_id,
                error = ack.error.as_deref().unwrap_or("unspecified"),
                "workflow reported failure on dispatch"
            );
        }
        tracing::debug!(
            function_name,
            tool_call_id = %tool_call_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool dispatch succeeded"
        );
        self.cache
            .update_pending(&session.session_id, &tool_call_id, "DISPATCHED");
        parsed
    }

    fn dispatch_failed(
        &self,
        tool_call_id: &str,
        function_name: &str,
        session: &SessionHandle,
        error: Error,
    ) -> Value {
        let message = error.to_string();
        tracing::error!(function_name, tool_call_id, error = %error, "tool dispatch failed");
        self.callbacks.remove(tool_call_id);
        self.cache
            .resolve_pending(&session.session_id, tool_call_id, "FAILED");
        self.sink.record(
            RecordKind::ToolExecution,
            json!({
                "tool_call_id": tool_call_id,
                "function_name": function_name,
                "session_id": session.session_id,
                "status": "dispatch_failed",
                "error": message,
            }),
        );
        json!({
            "success": false,
            "error": "DISPATCH_FAILED",
            "message": message,
        })
    }

    fn resolve_webhook(&self, function_name: &str) -> Option<(String, bool)> {
        if let Some(url) = self.config.tool_webhooks.get(function_name) {
            return Some((url.clone(), false));
        }
        self.config
            .dispatch_webhook
            .as_ref()
            .map(|url| (url.clone(), true))
    }

    /// The callback URL to hand the workflow, or `None` when no base is
    /// configured or the base fails the SSRF guard. Security over
    /// liveness: an inadmissible URL drops the callback, never the call.
    fn resolve_callback_url(&self) -> Option<String> {
        let base = self.config.callback_base_url.as_deref()?;
        let url = format!("{}/tool-progress", base.trim_end_matches('/'));
        match validate_callback_url(&url, &self.config.callback_whitelist) {
            Ok(()) => Some(url),
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "callback URL rejected, dispatching without callback");
                None
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Local tools
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// In-band voice path into the Gate-2 wait registry. Without an
    /// explicit id the most recent waiter for this session is resolved.
    fn confirm_pending_action(&self, args: &Value, session: &SessionHandle) -> Value {
        let confirmed = args
            .get("confirmed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let reason = args
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let target = args
            .get("tool_call_id")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .or_else(|| self.confirms.latest_for_session(&session.session_id));

        let Some(tool_call_id) = target else {
            return no_pending_action();
        };

        let resolved = if confirmed {
            self.confirms.confirm(&tool_call_id)
        } else {
            self.confirms
                .cancel(&tool_call_id, reason.or_else(|| Some("User cancelled".into())))
        };

        if !resolved {
            return no_pending_action();
        }

        self.sink.record(
            RecordKind::Audit,
            json!({
                "event": "gate2_voice_resolution",
                "tool_call_id": tool_call_id,
                "session_id": session.session_id,
                "confirmed": confirmed,
            }),
        );

        let voice_response = if confirmed {
            "Okay, going ahead with that now."
        } else {
            "Okay, I've cancelled that."
        };
        json!({
            "success": true,
            "tool_call_id": tool_call_id,
            "confirmed": confirmed,
            "voice_response": voice_response,
        })
    }

    fn get_session_context(&self, args: &Value, session: &SessionHandle) -> Value {
        let context = match args.get("key").and_then(Value::as_str) {
            Some(key) => self
                .cache
                .get_context(&session.session_id, key)
                .unwrap_or(Value::Null),
            None => self.cache.context_snapshot(&session.session_id),
        };
        json!({ "success": true, "context": context })
    }

    fn query_conversation_history(&self, args: &Value, session: &SessionHandle) -> Value {
        let limit = args
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(10)
            .min(100) as usize;
        let items = {
            let ctx = session.context.lock();
            serde_json::to_value(ctx.last_n(limit)).unwrap_or_default()
        };
        let count = items.as_array().map(Vec::len).unwrap_or(0);
        let result = json!({ "success": true, "items": items, "count": count });
        self.cache
            .set_last_query_result(&session.session_id, result.clone());
        result
    }

    fn query_user_analytics(&self, session: &SessionHandle) -> Value {
        let counters = session.context.lock().counters();
        json!({
            "success": true,
            "analytics": {
                "session_id": session.session_id,
                "counters": counters,
                "recent_tools": self.cache.recent_tools(&session.session_id),
                "pending_tools": self.cache.pending_tools(&session.session_id).len(),
                "audio": session.audio.health(),
            }
        })
    }

    /// Suspend a Gate-2 waiter for a callback and await its resolution.
    /// Used by the gate endpoint handler; lives here so the registry
    /// wiring stays in one place.
    pub fn register_gate2_waiter(
        &self,
        tool_call_id: &str,
        session_id: &str,
        function_name: &str,
    ) -> oneshot::Receiver<ConfirmDecision> {
        let (tx, rx) = oneshot::channel();
        self.confirms.insert(PendingConfirm {
            tool_call_id: tool_call_id.to_owned(),
            session_id: session_id.to_owned(),
            function_name: function_name.to_owned(),
            created_at: Instant::now(),
            respond: tx,
        });
        rx
    }
}

fn no_pending_action() -> Value {
    json!({
        "success": false,
        "message": "no pending action",
        "voice_response": "There's nothing waiting for confirmation right now.",
    })
}

/// `tc_` + millisecond timestamp + nine random characters.
pub fn generate_tool_call_id() -> String {
    let rand9: String = Uuid::new_v4().simple().to_string().chars().take(9).collect();
    format!("tc_{}_{}", Utc::now().timestamp_millis(), rand9)
}

/// Request body for a webhook dispatch. Per-tool webhooks get the args
/// spread at the top level; the dispatcher gets them nested.
pub(crate) fn build_request_body(
    function_name: &str,
    args: &Value,
    session: &SessionHandle,
    tool_call_id: &str,
    callback_url: Option<&str>,
    is_dispatcher: bool,
) -> Value {
    let context = session.context.lock().snapshot(SNAPSHOT_ITEMS);
    let timestamp = Utc::now().to_rfc3339();

    let mut body = if is_dispatcher {
        json!({
            "function": function_name,
            "args": args,
        })
    } else {
        match args {
            Value::Object(map) => Value::Object(map.clone()),
            other => json!({ "args": other }),
        }
    };

    let obj = body.as_object_mut().expect("body is always an object");
    obj.insert("connection_id".into(), json!(session.connection_id));
    obj.insert("session_id".into(), json!(session.session_id));
    obj.insert("tool_call_id".into(), json!(tool_call_id));
    if let Some(url) = callback_url {
        obj.insert("callback_url".into(), json!(url));
    }
    obj.insert("timestamp".into(), json!(timestamp));
    obj.insert("context".into(), context);
    body
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
