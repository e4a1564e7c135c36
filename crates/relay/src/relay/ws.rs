//! Browser WebSocket endpoint — the per-session relay core.
//!
//! Flow:
//! 1. Browser connects to `/realtime` (optionally with `?bot_id=&bot_name=`).
//! 2. The relay acquires an upstream socket; browser frames sent in the
//!    meantime are queued, never dropped.
//! 3. Once both peers are open, queued frames flush FIFO and bidirectional
//!    forwarding runs until either peer closes.
//! 4. Function-call events from the upstream are intercepted and handed to
//!    the tool executor; transcription events are mirrored into the
//!    conversation context; everything else passes through untouched.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as UpstreamMessage;
use vr_protocol::upstream;

use crate::relay::audio::AudioMonitor;
use crate::relay::registry::{SessionHandle, SessionPhase, UpstreamFrame};
use crate::sink::RecordKind;
use crate::state::AppState;

/// Browser keepalive interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Outbound channel depth per peer.
const CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    /// Optional bot-registry metadata supplied by the client.
    pub bot_id: Option<String>,
    pub bot_name: Option<String>,
}

/// GET /realtime — upgrade to WebSocket.
pub async fn browser_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, query: ConnectQuery) {
    let connection_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(
        connection_id = %connection_id,
        bot_id = query.bot_id.as_deref().unwrap_or("-"),
        "browser connected"
    );

    let (mut browser_sink, mut browser_stream) = socket.split();

    // ── ESTABLISHING: acquire upstream, queueing browser frames ──────
    let mut queue: Vec<String> = Vec::new();
    let acquire = state.upstream.acquire(&connection_id);
    tokio::pin!(acquire);

    let outcome = loop {
        tokio::select! {
            result = &mut acquire => break result,
            frame = browser_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => queue.push(text),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!(connection_id = %connection_id, "browser left during upstream handshake");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "browser socket error during handshake");
                    return;
                }
            }
        }
    };

    let upstream_socket = match outcome {
        Ok(socket) => socket,
        Err(e) => {
            tracing::error!(connection_id = %connection_id, error = %e, "upstream acquisition failed");
            let _ = browser_sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: format!("upstream unavailable: {e}").into(),
                })))
                .await;
            return;
        }
    };

    // ── READY: wire up both peers ────────────────────────────────────
    let (mut upstream_sink, mut upstream_stream) = upstream_socket.split();
    let (browser_tx, mut browser_rx) = mpsc::channel::<Message>(CHANNEL_DEPTH);
    let (upstream_tx, mut upstream_rx) = mpsc::channel::<UpstreamFrame>(CHANNEL_DEPTH);

    let audio = Arc::new(AudioMonitor::new(state.config.audio_loss_threshold));
    let handle = SessionHandle::new(
        connection_id.clone(),
        query.bot_id,
        query.bot_name,
        browser_tx.clone(),
        upstream_tx,
        audio.clone(),
    );
    state.sessions.register(handle.clone());

    // Writer: browser outbound channel → browser socket.
    let browser_writer = tokio::spawn(async move {
        while let Some(msg) = browser_rx.recv().await {
            if browser_sink.send(msg).await.is_err() {
                break;
            }
        }
        let _ = browser_sink.close().await;
    });

    // Writer: upstream outbound channel → upstream socket. Sends a normal
    // close on teardown.
    let upstream_writer = tokio::spawn(async move {
        while let Some(frame) = upstream_rx.recv().await {
            match frame {
                UpstreamFrame::Text(text) => {
                    if upstream_sink.send(UpstreamMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                UpstreamFrame::Close => break,
            }
        }
        let _ = upstream_sink.send(UpstreamMessage::Close(None)).await;
    });

    // Keepalive: ping the browser until the socket goes away.
    let ping_tx = browser_tx.clone();
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await; // immediate first tick
        loop {
            interval.tick().await;
            if ping_tx.send(Message::Ping(Vec::new())).await.is_err() {
                break;
            }
        }
    });

    // Flush queued frames FIFO before live forwarding starts.
    handle.set_phase(SessionPhase::Ready);
    for text in queue.drain(..) {
        note_browser_frame(&audio, &text);
        if !handle.forward_to_upstream(text).await {
            break;
        }
    }
    tracing::info!(connection_id = %connection_id, "session ready");

    // ── Forwarding loops ─────────────────────────────────────────────
    let browser_to_upstream = async {
        while let Some(frame) = browser_stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    note_browser_frame(&audio, &text);
                    if !handle.forward_to_upstream(text).await {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "browser read error");
                    break;
                }
            }
        }
    };

    let upstream_to_browser = async {
        while let Some(frame) = upstream_stream.next().await {
            match frame {
                Ok(UpstreamMessage::Text(text)) => {
                    handle_upstream_frame(&state, &handle, text).await;
                }
                Ok(UpstreamMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "upstream read error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = browser_to_upstream => {
            tracing::info!(connection_id = %connection_id, "browser closed");
        }
        _ = upstream_to_browser => {
            tracing::info!(connection_id = %connection_id, "upstream closed");
        }
    }

    // ── DRAINING → CLOSED ────────────────────────────────────────────
    // In-flight tool dispatches hold handle clones and settle on their
    // own timeouts; the writer tasks exit once the last clone drops.
    handle.set_phase(SessionPhase::Draining);
    handle.close_upstream().await;
    ping_task.abort();
    teardown(&state, &handle).await;
    handle.set_phase(SessionPhase::Closed);
    state.sessions.remove(&connection_id);
    drop(browser_tx);
    drop(browser_writer);
    drop(upstream_writer);
    tracing::info!(connection_id = %connection_id, "session closed");
}

/// Count browser → upstream audio frames for the transmission monitor.
fn note_browser_frame(audio: &AudioMonitor, text: &str) {
    if let Some(event_type) = frame_type(text) {
        if event_type.contains("audio") {
            audio.note_sent();
        }
    }
}

fn frame_type(text: &str) -> Option<String> {
    let event: Value = serde_json::from_str(text).ok()?;
    event.get("type")?.as_str().map(str::to_owned)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Upstream interception
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_upstream_frame(state: &AppState, handle: &SessionHandle, text: String) {
    let event: Option<Value> = serde_json::from_str(&text).ok();
    let event_type = event
        .as_ref()
        .and_then(|e| e.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("");

    if event_type.contains("audio") {
        handle.audio.note_received();
    }

    match event_type {
        upstream::FUNCTION_CALL_DONE => {
            // Intercepted: the browser sees gate notifications instead.
            if let Some(event) = event.as_ref() {
                intercept_function_call(state, handle, event);
            }
            return;
        }
        upstream::INPUT_TRANSCRIPTION_DONE => {
            if let Some(transcript) = event
                .as_ref()
                .and_then(|e| e.get("transcript"))
                .and_then(Value::as_str)
            {
                handle.context.lock().push_user_message(transcript);
                tracing::debug!(session_id = %handle.session_id, "user transcript recorded");
            }
        }
        upstream::RESPONSE_TRANSCRIPT_DONE => {
            if let Some(transcript) = event
                .as_ref()
                .and_then(|e| e.get("transcript"))
                .and_then(Value::as_str)
            {
                handle.context.lock().push_assistant_message(transcript);
                spawn_tts_egress(state, handle, transcript);
            }
        }
        _ => {}
    }

    handle.forward_to_browser(text).await;
}

fn intercept_function_call(state: &AppState, handle: &SessionHandle, event: &Value) {
    let call_id = event
        .get("call_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let name = event
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    if call_id.is_empty() || name.is_empty() {
        tracing::warn!(session_id = %handle.session_id, "malformed function_call event, ignoring");
        return;
    }

    // `arguments` arrives as a JSON-encoded string.
    let args = event
        .get("arguments")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .unwrap_or_else(|| json!({}));

    if handle.phase() != SessionPhase::Ready {
        tracing::warn!(
            session_id = %handle.session_id,
            function_name = %name,
            "function call while not ready, dropping"
        );
        return;
    }

    tracing::info!(
        session_id = %handle.session_id,
        function_name = %name,
        call_id = %call_id,
        "function call intercepted"
    );

    // Dispatch off the forwarding loop so audio keeps flowing.
    let executor = state.tools.clone();
    let handle = handle.clone();
    tokio::spawn(async move {
        executor.execute(&call_id, &name, args, &handle).await;
    });
}

/// Fire-and-forget assistant-transcript egress for TTS injection.
fn spawn_tts_egress(state: &AppState, handle: &SessionHandle, transcript: &str) {
    let Some(url) = state.config.tts_egress_url.clone() else {
        return;
    };
    if transcript.is_empty() {
        return;
    }
    let client = state.http.clone();
    let body = json!({
        "connection_id": handle.connection_id,
        "text": transcript,
    });
    tokio::spawn(async move {
        if let Err(e) = client
            .post(&url)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            tracing::warn!(error = %e, "TTS egress failed");
        }
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Teardown
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Release everything a session owns: resolve its Gate-2 waiters, clear
/// its callback slots and cancel requests, drop its cache entry, and
/// write the final audit record.
pub(crate) async fn teardown(state: &AppState, handle: &SessionHandle) {
    let waiters = state
        .confirms
        .cancel_for_session(&handle.session_id, "session_closed");
    let slots = state.callbacks.remove_for_session(&handle.session_id);
    let cancels = state.cancels.remove_for_session(&handle.session_id);
    state.cache.remove_session(&handle.session_id);

    if waiters + slots + cancels > 0 {
        tracing::info!(
            session_id = %handle.session_id,
            waiters,
            slots,
            cancels,
            "released session registry entries"
        );
    }

    let (counters, started_at) = {
        let ctx = handle.context.lock();
        (ctx.counters(), ctx.started_at())
    };
    state.sink.record(
        RecordKind::Audit,
        json!({
            "event": "session_closed",
            "session_id": handle.session_id,
            "connection_id": handle.connection_id,
            "bot_id": handle.bot_id,
            "bot_name": handle.bot_name,
            "started_at": started_at,
            "duration_secs": (chrono::Utc::now() - started_at).num_seconds(),
            "counters": counters,
            "audio": handle.audio.health(),
        }),
    );
}
