//! Health endpoint — the only unauthenticated route.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness plus a few cheap counters.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "terminals": state.terminals.session_count().await,
        "tailers": state.tailers.tailer_count().await,
    }))
}
