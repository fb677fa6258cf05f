//! REST endpoints for exec sessions.
//!
//! - `GET  /api/sessions`                — list sessions (paged)
//! - `POST /api/session/start`           — create a session
//! - `POST /api/sessions/{id}/messages`  — submit a user message
//! - `POST /api/sessions/{id}/cancel`    — cancel the running turn

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::api_error;
use crate::directory::{self, CreateError, DEFAULT_PAGE_LIMIT};
use crate::journal::writer::JournalError;
use crate::util::is_valid_session_id;
use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `GET /api/sessions?limit&offset` — newest-first session listing.
pub async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<directory::SessionPage> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset.unwrap_or(0);
    Json(directory::list_sessions(&state.paths, &state.engine, offset, limit).await)
}

#[derive(Deserialize)]
pub struct StartRequest {
    pub cwd: Option<String>,
    pub model: Option<String>,
}

/// `POST /api/session/start {cwd, model?}` — create a session.
///
/// The body is optional; omitted fields fall back to config defaults.
///
/// # Errors
///
/// - `400 Bad Request` with `{"code":"INVALID_CWD"}` — cwd does not exist
pub async fn start_session(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let payload = serde_json::from_slice::<StartRequest>(&body).unwrap_or(StartRequest {
        cwd: None,
        model: None,
    });
    match directory::create_session(
        &state.paths,
        &state.config,
        payload.cwd.as_deref(),
        payload.model.as_deref(),
    )
    .await
    {
        Ok(sidecar) => Ok(Json(json!({
            "sessionId": sidecar.id,
            "cwd": sidecar.cwd,
            "ready": true,
        }))),
        Err(CreateError::InvalidCwd(cwd)) => Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_CWD",
            format!("Working directory does not exist: {cwd}"),
        )),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            e.to_string(),
        )),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub content: Option<String>,
    pub image_path: Option<String>,
}

/// `POST /api/sessions/{id}/messages {content, imagePath?}` — submit a turn.
///
/// # Errors
///
/// - `404` `INVALID_SESSION_ID` — id is not a UUID
/// - `400` `MISSING_CONTENT` — body has no non-empty `content`
/// - `404` `SESSION_NOT_FOUND` — no sidecar for the id
pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !is_valid_session_id(&id) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "INVALID_SESSION_ID",
            "Invalid session id",
        ));
    }
    let payload = serde_json::from_slice::<MessageRequest>(&body).unwrap_or(MessageRequest {
        content: None,
        image_path: None,
    });
    let content = match payload.content.as_deref() {
        Some(content) if !content.trim().is_empty() => content,
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "MISSING_CONTENT",
                "Request body must include content",
            ));
        }
    };

    match state
        .engine
        .submit(&id, content, payload.image_path.as_deref())
        .await
    {
        Ok(receipt) => Ok(Json(json!({
            "accepted": true,
            "messageId": receipt.message_id,
        }))),
        Err(JournalError::SessionNotFound(_)) => Err(api_error(
            StatusCode::NOT_FOUND,
            "SESSION_NOT_FOUND",
            format!("Session {id} not found"),
        )),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL",
            e.to_string(),
        )),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    #[serde(default)]
    pub clear_queue: bool,
}

/// `POST /api/sessions/{id}/cancel {clearQueue?}` — cancel the running turn.
///
/// The body is optional; an absent or malformed body means
/// `clearQueue: false`.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !is_valid_session_id(&id) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            "INVALID_SESSION_ID",
            "Invalid session id",
        ));
    }
    let clear_queue = serde_json::from_slice::<CancelRequest>(&body)
        .map(|p| p.clear_queue)
        .unwrap_or(false);
    let outcome = state.engine.cancel(&id, clear_queue).await;
    Ok(Json(json!({
        "ok": true,
        "cancelled": outcome.cancelled,
        "running": outcome.running,
        "clearedQueue": outcome.cleared_queue,
    })))
}
