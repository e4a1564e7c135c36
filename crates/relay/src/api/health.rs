//! Liveness probe with summary counters.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use serde_json::Value;

use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(health_payload(&state))
}

fn health_payload(state: &AppState) -> Value {
    serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.started_at.elapsed().as_secs(),
        "connections": state.sessions.count(),
        "active_callbacks": state.callbacks.count(),
        "pending_cancellations": state.cancels.count(),
        "gate2_waiters": state.confirms.count(),
    })
}
