//! Chat SSE endpoint.
//!
//! `GET /api/chat-stream?session&since&limit` streams a session's journal:
//! history replay from the `since` cursor (the `Last-Event-ID` header
//! overrides the query parameter on reconnect), then live events, with
//! heartbeats. Authentication is a `?token=` query parameter because
//! `EventSource` cannot set headers.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::api_error;
use crate::auth::check_stream_token;
use crate::util::is_valid_session_id;
use crate::AppState;

#[derive(Deserialize)]
pub struct StreamQuery {
    pub session: Option<String>,
    pub since: Option<String>,
    pub limit: Option<usize>,
    pub token: Option<String>,
}

/// `GET /api/chat-stream` — attach an SSE client to a session's tailer.
pub async fn chat_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, (StatusCode, Json<Value>)> {
    if !check_stream_token(&state.config.auth.api_key, query.token.as_deref()) {
        return Err(api_error(StatusCode::FORBIDDEN, "FORBIDDEN", "Invalid token"));
    }

    let Some(session) = query.session.as_deref() else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "MISSING_SESSION",
            "session query parameter is required",
        ));
    };
    if !is_valid_session_id(session) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "INVALID_SESSION_ID",
            "Invalid session id",
        ));
    }
    if tokio::fs::metadata(state.paths.sidecar_file(session))
        .await
        .is_err()
    {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            format!("Session {session} not found"),
        ));
    }

    // Last-Event-ID (set by the browser on automatic reconnect) wins over
    // the explicit since parameter.
    let since = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .or(query.since.as_deref())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let limit = query
        .limit
        .unwrap_or(state.config.stream.history_limit_records);

    let rx = state.tailers.attach(session, since, limit).await;

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// `GET /api/chat-stream/stats` — per-tailer diagnostics.
pub async fn chat_stream_stats(State(state): State<AppState>) -> Json<Value> {
    let tailers = state.tailers.stats().await;
    Json(json!({
        "count": tailers.len(),
        "tailers": tailers,
    }))
}
