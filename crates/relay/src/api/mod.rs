pub mod gates;
pub mod health;
pub mod signature;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full relay router: the browser WebSocket endpoint, the gate
/// callback endpoints, and the health probe.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/realtime", get(crate::relay::ws::browser_ws))
        .route("/tool-progress", post(gates::tool_progress))
        .route("/tool-cancel", post(gates::tool_cancel))
        .route("/tool-confirm", post(gates::tool_confirm))
        .route("/tool-status/:id", get(gates::tool_status))
        .route("/health", get(health::health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
