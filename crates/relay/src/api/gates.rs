//! Gate endpoints — the rendezvous between workflows and the human.
//!
//! Workflows hold execution open by awaiting the HTTP response to
//! `POST /tool-progress`; the user answers through a different channel
//! entirely (voice, or the out-of-band confirm/cancel endpoints). Every
//! `/tool-*` POST runs the same pre-processing pipeline, in order: raw
//! body capture, rate limit, HMAC verification, JSON decode, and — for
//! gated callbacks — the idempotency check before any side effect.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::Utc;
use serde_json::{json, Value};
use vr_protocol::{BrowserNotice, GateAck, GateCallback, GateDecision, GateStatus};

use crate::relay::nudge::nudge_agent;
use crate::runtime::confirm::ConfirmDecision;
use crate::runtime::rate_limit::RateDecision;
use crate::sink::RecordKind;
use crate::state::AppState;

use super::signature::{verify_signature, SIGNATURE_HEADER, TIMESTAMP_HEADER};

type RateHeaders = [(&'static str, String); 3];

fn rate_headers(decision: &RateDecision) -> RateHeaders {
    [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_secs.to_string()),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared pre-processing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn preprocess(
    state: &AppState,
    addr: SocketAddr,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(GateCallback, RateHeaders), Response> {
    // 1. Rate limit by peer address; headers are emitted either way.
    let decision = state.rate.check(&addr.ip().to_string());
    let rl = rate_headers(&decision);
    if !decision.allowed {
        return Err((
            StatusCode::TOO_MANY_REQUESTS,
            rl,
            Json(json!({
                "error": "rate limit exceeded",
                "retry_after_ms": decision.retry_after_ms,
            })),
        )
            .into_response());
    }

    // 2. HMAC over the raw body (when enabled).
    if let Some(secret) = state.config.hmac_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if signature.is_empty() || timestamp.is_empty() {
            return Err(auth_error(rl, "missing signature headers"));
        }
        if let Err(e) = verify_signature(secret, signature, timestamp, body, Utc::now().timestamp())
        {
            return Err(auth_error(rl, e));
        }
    }

    // 3. JSON decode; an id is mandatory.
    let callback: GateCallback = match serde_json::from_slice(body) {
        Ok(cb) => cb,
        Err(e) => {
            return Err((
                StatusCode::BAD_REQUEST,
                rl,
                Json(json!({ "error": format!("invalid JSON: {e}") })),
            )
                .into_response());
        }
    };
    if callback.id().is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            rl,
            Json(json!({ "error": "tool_call_id or intent_id is required" })),
        )
            .into_response());
    }

    Ok((callback, rl))
}

fn auth_error(rl: RateHeaders, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        rl,
        Json(json!({ "error": message })),
    )
        .into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /tool-progress
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn tool_progress(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (callback, rl) = match preprocess(&state, addr, &headers, &body) {
        Ok(pre) => pre,
        Err(response) => return response,
    };
    let (status, body) = handle_progress(&state, callback).await;
    (status, rl, Json(body)).into_response()
}

/// Dispatch a gate callback by status. Separated from the HTTP envelope
/// so the protocol logic is directly testable.
pub(crate) async fn handle_progress(state: &AppState, cb: GateCallback) -> (StatusCode, Value) {
    let id = cb.id().expect("preprocess guarantees an id").to_owned();

    // Idempotency precedes every side effect.
    if let Some(gate) = cb.gate_number() {
        if let Some(cached) = state.idempotency.check(&id, gate) {
            tracing::debug!(tool_call_id = %id, gate, "duplicate gate callback, replaying cached response");
            return (StatusCode::OK, cached);
        }
    }

    match cb.status() {
        Some(GateStatus::Preparing) => gate_preparing(state, &cb, &id).await,
        Some(GateStatus::ReadyToSend) => gate_ready_to_send(state, &cb, &id).await,
        Some(GateStatus::Completed) => gate_completed(state, &cb, &id).await,
        Some(GateStatus::Cancelled) => terminal(state, &cb, &id, GateStatus::Cancelled).await,
        Some(GateStatus::Failed) => terminal(state, &cb, &id, GateStatus::Failed).await,
        None => {
            tracing::warn!(
                tool_call_id = %id,
                status = cb.status.as_deref().unwrap_or("<missing>"),
                "unknown gate status, responding permissively"
            );
            (
                StatusCode::OK,
                serde_json::to_value(GateDecision::proceed()).unwrap_or_default(),
            )
        }
    }
}

/// Gate 1 — the workflow announces it is starting.
async fn gate_preparing(state: &AppState, cb: &GateCallback, id: &str) -> (StatusCode, Value) {
    if let Some(decision) = consume_cancel(state, cb, id, 1) {
        return decision;
    }

    if let Some(slot) = state.callbacks.get(id) {
        let delivered = slot
            .session
            .notify_browser(&BrowserNotice::ToolGate {
                tool_call_id: id.to_owned(),
                gate: Some(1),
                status: GateStatus::Preparing,
                message: cb
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Preparing {}", slot.function_name)),
                voice_response: None,
                requires_confirmation: None,
                awaiting_confirmation: None,
                cancellable: Some(cb.cancellable.unwrap_or(true)),
                result: None,
                execution_time_ms: None,
            })
            .await;
        if !delivered {
            tracing::debug!(tool_call_id = %id, "browser gone, gate 1 notice dropped");
        }
        nudge_agent(
            &slot.session,
            GateStatus::Preparing,
            &slot.function_name,
            cb.message.as_deref(),
        )
        .await;
        state
            .cache
            .update_pending(&slot.session.session_id, id, "PREPARING");
    }

    cache_and_ok(state, id, 1, GateDecision::proceed())
}

/// Gate 2 — the workflow blocks until the human decides.
async fn gate_ready_to_send(state: &AppState, cb: &GateCallback, id: &str) -> (StatusCode, Value) {
    if let Some(decision) = consume_cancel(state, cb, id, 2) {
        return decision;
    }

    let slot = state.callbacks.get(id);
    let (session_id, function_name) = match &slot {
        Some(slot) => (
            slot.session.session_id.clone(),
            slot.function_name.clone(),
        ),
        None => (String::new(), "the action".to_owned()),
    };

    if let Some(slot) = &slot {
        slot.session
            .notify_browser(&BrowserNotice::ToolGate {
                tool_call_id: id.to_owned(),
                gate: Some(2),
                status: GateStatus::ReadyToSend,
                message: cb
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{function_name} is ready to execute")),
                voice_response: None,
                requires_confirmation: Some(true),
                awaiting_confirmation: Some(true),
                cancellable: Some(cb.cancellable.unwrap_or(true)),
                result: None,
                execution_time_ms: None,
            })
            .await;
        nudge_agent(
            &slot.session,
            GateStatus::ReadyToSend,
            &function_name,
            cb.message.as_deref(),
        )
        .await;
        state.cache.update_pending(&session_id, id, "READY_TO_SEND");
    }

    // Suspend. The registry entry is removed before any decision is
    // delivered, so exactly one resolver wins.
    let rx = state.tools.register_gate2_waiter(id, &session_id, &function_name);

    // A cancel that slipped in between the check above and the insert
    // resolves the fresh waiter instead of waiting out the clock.
    if let Some(request) = state.cancels.take(id) {
        state.confirms.cancel(id, request.reason);
    }

    let decision = match tokio::time::timeout(state.confirms.timeout(), rx).await {
        Ok(Ok(ConfirmDecision::Confirmed)) => GateDecision::proceed(),
        Ok(Ok(ConfirmDecision::Cancelled { reason })) => {
            GateDecision::cancelled(reason.unwrap_or_else(|| "User cancelled".into()))
        }
        Ok(Err(_)) => {
            // Sender dropped without resolving (stale-waiter sweep).
            GateDecision::cancelled("Confirmation timeout")
        }
        Err(_) => {
            state.confirms.remove_expired(id);
            tracing::info!(tool_call_id = %id, "gate 2 confirmation timed out, auto-cancelling");
            if let Some(slot) = &slot {
                nudge_agent(
                    &slot.session,
                    GateStatus::Cancelled,
                    &function_name,
                    Some("The confirmation window expired."),
                )
                .await;
            }
            GateDecision::cancelled("Confirmation timeout")
        }
    };

    if let Some(slot) = &slot {
        slot.session
            .notify_browser(&BrowserNotice::ToolConfirmed {
                tool_call_id: id.to_owned(),
                confirmed: decision.proceed,
            })
            .await;
    }

    cache_and_ok(state, id, 2, decision)
}

/// Gate 3 — terminal success.
async fn gate_completed(state: &AppState, cb: &GateCallback, id: &str) -> (StatusCode, Value) {
    let slot = state.callbacks.remove(id);

    if let Some(slot) = &slot {
        slot.session
            .notify_browser(&BrowserNotice::ToolGate {
                tool_call_id: id.to_owned(),
                gate: Some(3),
                status: GateStatus::Completed,
                message: cb
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} completed", slot.function_name)),
                voice_response: cb.voice_response.clone(),
                requires_confirmation: None,
                awaiting_confirmation: None,
                cancellable: None,
                result: cb.result.clone(),
                execution_time_ms: cb.execution_time_ms,
            })
            .await;
        nudge_agent(
            &slot.session,
            GateStatus::Completed,
            &slot.function_name,
            cb.voice_response.as_deref(),
        )
        .await;
        state
            .cache
            .resolve_pending(&slot.session.session_id, id, "COMPLETED");
        state.sink.record(
            RecordKind::ToolExecution,
            json!({
                "tool_call_id": id,
                "function_name": slot.function_name,
                "session_id": slot.session.session_id,
                "status": "success",
                "result": cb.result,
                "execution_time_ms": cb.execution_time_ms,
            }),
        );
        state.sink.record(
            RecordKind::Audit,
            json!({
                "event": "tool_completed",
                "tool_call_id": id,
                "session_id": slot.session.session_id,
            }),
        );
    } else {
        tracing::warn!(tool_call_id = %id, "gate 3 for unknown callback slot");
    }

    let body = serde_json::to_value(GateAck::acknowledged()).unwrap_or_default();
    state.idempotency.store(id, 3, body.clone());
    (StatusCode::OK, body)
}

/// Terminal CANCELLED / FAILED callbacks.
async fn terminal(
    state: &AppState,
    cb: &GateCallback,
    id: &str,
    status: GateStatus,
) -> (StatusCode, Value) {
    let slot = state.callbacks.remove(id);
    state.cancels.remove(id);

    if let Some(slot) = &slot {
        let default_message = match status {
            GateStatus::Cancelled => format!("{} was cancelled", slot.function_name),
            _ => format!("{} failed", slot.function_name),
        };
        slot.session
            .notify_browser(&BrowserNotice::ToolGate {
                tool_call_id: id.to_owned(),
                gate: None,
                status,
                message: cb.message.clone().unwrap_or(default_message),
                voice_response: cb.voice_response.clone(),
                requires_confirmation: None,
                awaiting_confirmation: None,
                cancellable: None,
                result: None,
                execution_time_ms: None,
            })
            .await;
        nudge_agent(&slot.session, status, &slot.function_name, cb.message.as_deref()).await;
        state
            .cache
            .resolve_pending(&slot.session.session_id, id, status.as_str());
        state.sink.record(
            RecordKind::ToolExecution,
            json!({
                "tool_call_id": id,
                "function_name": slot.function_name,
                "session_id": slot.session.session_id,
                "status": status.as_str().to_lowercase(),
                "message": cb.message,
            }),
        );
    }

    let body = serde_json::to_value(GateAck::acknowledged()).unwrap_or_default();
    if let Some(gate) = cb.gate_number() {
        state.idempotency.store(id, gate, body.clone());
    }
    (StatusCode::OK, body)
}

/// Short-circuit a gate when a matching cancel request is parked and the
/// callback is cancellable. The request is consumed.
fn consume_cancel(
    state: &AppState,
    cb: &GateCallback,
    id: &str,
    gate: u8,
) -> Option<(StatusCode, Value)> {
    if !cb.cancellable.unwrap_or(true) {
        return None;
    }
    let request = state.cancels.take(id)?;
    tracing::info!(tool_call_id = %id, gate, "gate short-circuited by pending cancel");
    let decision =
        GateDecision::cancelled(request.reason.unwrap_or_else(|| "Cancelled".into()));
    Some(cache_and_ok(state, id, gate, decision))
}

fn cache_and_ok(
    state: &AppState,
    id: &str,
    gate: u8,
    decision: GateDecision,
) -> (StatusCode, Value) {
    let body = serde_json::to_value(&decision).unwrap_or_default();
    state.idempotency.store(id, gate, body.clone());
    (StatusCode::OK, body)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /tool-cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn tool_cancel(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (callback, rl) = match preprocess(&state, addr, &headers, &body) {
        Ok(pre) => pre,
        Err(response) => return response,
    };
    let (status, body) = handle_cancel(&state, callback).await;
    (status, rl, Json(body)).into_response()
}

pub(crate) async fn handle_cancel(state: &AppState, cb: GateCallback) -> (StatusCode, Value) {
    let id = cb.id().expect("preprocess guarantees an id").to_owned();
    let reason = cb.reason.clone().or_else(|| cb.message.clone());

    // A live Gate-2 waiter resolves immediately; otherwise the request
    // parks for the next gate inspection.
    if state.confirms.cancel(&id, reason.clone()) {
        tracing::info!(tool_call_id = %id, "cancel resolved a waiting gate 2");
    } else {
        let session_id = state
            .callbacks
            .get(&id)
            .map(|slot| slot.session.session_id.clone());
        state.cancels.set(&id, reason.clone(), session_id);
    }

    if let Some(slot) = state.callbacks.get(&id) {
        slot.session
            .notify_browser(&BrowserNotice::ToolCancelRequested {
                tool_call_id: id.clone(),
                reason,
            })
            .await;
    }

    (StatusCode::OK, json!({ "success": true }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /tool-confirm
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn tool_confirm(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let (callback, rl) = match preprocess(&state, addr, &headers, &body) {
        Ok(pre) => pre,
        Err(response) => return response,
    };
    let (status, body) = handle_confirm(&state, callback).await;
    (status, rl, Json(body)).into_response()
}

pub(crate) async fn handle_confirm(state: &AppState, cb: GateCallback) -> (StatusCode, Value) {
    let id = cb.id().expect("preprocess guarantees an id").to_owned();
    if state.confirms.confirm(&id) {
        (StatusCode::OK, json!({ "success": true }))
    } else {
        (
            StatusCode::NOT_FOUND,
            json!({ "error": "No pending confirmation" }),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /tool-status/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn tool_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let cancel = state.cancels.peek(&id);
    Json(json!({
        "tool_call_id": id,
        "cancelled": cancel.is_some(),
        "cancel_reason": cancel.and_then(|c| c.reason),
        "has_callback": state.callbacks.contains(&id),
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::registry::test_handle;
    use crate::sink::SinkTransport;
    use async_trait::async_trait;
    use std::sync::Arc;
    use vr_domain::RelayConfig;

    struct NullTransport;

    #[async_trait]
    impl SinkTransport for NullTransport {
        async fn deliver(&self, _kind: RecordKind, _payload: &Value) -> vr_domain::Result<()> {
            Ok(())
        }
    }

    fn test_state(config: RelayConfig) -> AppState {
        AppState::with_sink_transport(
            Arc::new(config),
            reqwest::Client::new(),
            Arc::new(NullTransport),
        )
    }

    fn callback(body: Value) -> GateCallback {
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn gate_one_proceeds_and_notifies_browser() {
        let state = test_state(RelayConfig::default());
        let (session, mut browser_rx, mut upstream_rx) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let (status, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "PREPARING", "gate": 1})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["continue"], true);
        assert_eq!(body["cancel"], false);

        let axum::extract::ws::Message::Text(frame) = browser_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let notice: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notice["type"], "tool_gate");
        assert_eq!(notice["gate"], 1);

        // The agent was nudged.
        assert!(upstream_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn gate_one_short_circuits_on_pending_cancel() {
        let state = test_state(RelayConfig::default());
        let (session, mut browser_rx, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);
        state
            .cancels
            .set("tc_1", Some("changed my mind".into()), Some("c1".into()));

        let (status, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "PREPARING", "cancellable": true})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["continue"], false);
        assert_eq!(body["cancel"], true);
        assert_eq!(body["reason"], "changed my mind");
        // The request was consumed and no gate notification fired.
        assert!(state.cancels.peek("tc_1").is_none());
        assert!(browser_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_cancellable_gate_ignores_pending_cancel() {
        let state = test_state(RelayConfig::default());
        state.cancels.set("tc_1", None, None);

        let (_, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "PREPARING", "cancellable": false})),
        )
        .await;

        assert_eq!(body["continue"], true);
        // Request stays parked for a cancellable gate.
        assert!(state.cancels.peek("tc_1").is_some());
    }

    #[tokio::test]
    async fn duplicate_gate_replays_cached_response_without_side_effects() {
        let state = test_state(RelayConfig::default());
        let (session, mut browser_rx, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let cb = json!({"tool_call_id": "tc_1", "status": "PREPARING", "gate": 1});
        let (_, first) = handle_progress(&state, callback(cb.clone())).await;
        let _ = browser_rx.recv().await; // consume the one notification

        let (_, second) = handle_progress(&state, callback(cb.clone())).await;
        let (_, third) = handle_progress(&state, callback(cb)).await;

        assert_eq!(first, second);
        assert_eq!(first, third);
        // No further browser notifications were emitted.
        assert!(browser_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn gate_two_confirmed_by_voice_path() {
        let state = test_state(RelayConfig::default());
        let (session, _b, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let resolver_state = state.clone();
        tokio::spawn(async move {
            // Wait for the waiter to appear, then confirm it.
            loop {
                if resolver_state.confirms.confirm("tc_1") {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let (status, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "READY_TO_SEND"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["continue"], true);
        assert_eq!(state.confirms.count(), 0);
    }

    #[tokio::test]
    async fn gate_two_times_out_into_auto_cancel() {
        let config = RelayConfig {
            gate2_timeout_secs: 0,
            ..RelayConfig::default()
        };
        let state = test_state(config);
        let (session, _b, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let (status, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "READY_TO_SEND"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["continue"], false);
        assert_eq!(body["cancel"], true);
        assert_eq!(body["reason"], "Confirmation timeout");
        assert_eq!(state.confirms.count(), 0);

        // The timeout result is cached: a retried gate 2 replays it
        // without a second wait.
        let (_, replay) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "READY_TO_SEND"})),
        )
        .await;
        assert_eq!(replay, body);
    }

    #[tokio::test]
    async fn gate_two_cancelled_while_waiting() {
        let state = test_state(RelayConfig::default());
        let (session, _b, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let resolver_state = state.clone();
        tokio::spawn(async move {
            loop {
                if resolver_state
                    .confirms
                    .cancel("tc_1", Some("User cancelled".into()))
                {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        });

        let (_, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "READY_TO_SEND"})),
        )
        .await;

        assert_eq!(body["continue"], false);
        assert_eq!(body["cancel"], true);
        assert_eq!(body["reason"], "User cancelled");
    }

    #[tokio::test]
    async fn gate_three_clears_slot_and_acknowledges() {
        let state = test_state(RelayConfig::default());
        let (session, mut browser_rx, _u) = test_handle("c1");
        state.cache.track_pending("c1", "tc_1", "send_email");
        state.callbacks.register("tc_1", "send_email", session);

        let (status, body) = handle_progress(
            &state,
            callback(json!({
                "tool_call_id": "tc_1",
                "status": "COMPLETED",
                "gate": 3,
                "result": {"sent": true},
                "voice_response": "Email sent.",
                "execution_time_ms": 1500,
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["received"], true);
        assert_eq!(body["status"], "acknowledged");
        assert!(!state.callbacks.contains("tc_1"));
        assert_eq!(state.cache.recent_tools("c1").len(), 1);

        let axum::extract::ws::Message::Text(frame) = browser_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let notice: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notice["gate"], 3);
        assert_eq!(notice["voice_response"], "Email sent.");
        assert_eq!(notice["execution_time_ms"], 1500);
    }

    #[tokio::test]
    async fn duplicate_gate_three_is_idempotent() {
        let state = test_state(RelayConfig::default());
        let (session, mut browser_rx, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let cb = json!({"tool_call_id": "tc_1", "status": "COMPLETED", "gate": 3});
        let (_, first) = handle_progress(&state, callback(cb.clone())).await;
        let _ = browser_rx.recv().await;

        let (_, second) = handle_progress(&state, callback(cb.clone())).await;
        let (_, third) = handle_progress(&state, callback(cb)).await;
        assert_eq!(first, second);
        assert_eq!(second, third);
        assert!(browser_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_status_notifies_and_clears() {
        let state = test_state(RelayConfig::default());
        let (session, mut browser_rx, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let (_, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "FAILED", "message": "SMTP down"})),
        )
        .await;

        assert_eq!(body["received"], true);
        assert!(!state.callbacks.contains("tc_1"));
        let axum::extract::ws::Message::Text(frame) = browser_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let notice: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notice["status"], "FAILED");
        assert_eq!(notice["message"], "SMTP down");
    }

    #[tokio::test]
    async fn unknown_status_is_permissive() {
        let state = test_state(RelayConfig::default());
        let (_, body) = handle_progress(
            &state,
            callback(json!({"tool_call_id": "tc_1", "status": "SHIPPING"})),
        )
        .await;
        assert_eq!(body["continue"], true);
        assert_eq!(body["cancel"], false);
    }

    #[tokio::test]
    async fn cancel_parks_request_when_no_waiter() {
        let state = test_state(RelayConfig::default());
        let (session, mut browser_rx, _u) = test_handle("c1");
        state.callbacks.register("tc_1", "send_email", session);

        let (status, body) = handle_cancel(
            &state,
            callback(json!({"tool_call_id": "tc_1", "reason": "too slow"})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        let parked = state.cancels.peek("tc_1").unwrap();
        assert_eq!(parked.reason.as_deref(), Some("too slow"));
        // Scoped to the owning session.
        assert_eq!(parked.session_id.as_deref(), Some("c1"));

        let axum::extract::ws::Message::Text(frame) = browser_rx.recv().await.unwrap() else {
            panic!("expected text frame");
        };
        let notice: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(notice["type"], "tool_cancel_requested");
    }

    #[tokio::test]
    async fn cancel_resolves_live_waiter() {
        let state = test_state(RelayConfig::default());
        let rx = state.tools.register_gate2_waiter("tc_1", "c1", "send_email");

        let (_, body) =
            handle_cancel(&state, callback(json!({"tool_call_id": "tc_1"}))).await;
        assert_eq!(body["success"], true);
        assert!(matches!(
            rx.await.unwrap(),
            ConfirmDecision::Cancelled { .. }
        ));
        // No parked request — the waiter consumed the cancel.
        assert!(state.cancels.peek("tc_1").is_none());
    }

    #[tokio::test]
    async fn confirm_endpoint_resolves_or_404s() {
        let state = test_state(RelayConfig::default());
        let rx = state.tools.register_gate2_waiter("tc_1", "c1", "send_email");

        let (status, _) =
            handle_confirm(&state, callback(json!({"tool_call_id": "tc_1"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(matches!(rx.await.unwrap(), ConfirmDecision::Confirmed));

        let (status, body) =
            handle_confirm(&state, callback(json!({"tool_call_id": "tc_1"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No pending confirmation");
    }

    #[tokio::test]
    async fn intent_id_is_accepted_as_the_id() {
        let state = test_state(RelayConfig::default());
        let (_, body) = handle_progress(
            &state,
            callback(json!({"intent_id": "in_7", "status": "PREPARING"})),
        )
        .await;
        assert_eq!(body["continue"], true);
        assert!(state.idempotency.check("in_7", 1).is_some());
    }
}
