//! Terminal transport for PTY sessions.
//!
//! - `GET /api/terminal/ws?session&token` — WebSocket. The client sends
//!   binary frames (raw input) or JSON text frames (`{"type":"input"}`,
//!   `{"type":"resize"}`); the server sends `{"type":"output","data"}` and a
//!   final `{"type":"exit"}`.
//! - `GET /api/terminal/stream?session&token` — read-only SSE view of the
//!   same session (`output` / `exit` frames plus heartbeats).
//!
//! Both transports receive the buffered history prefix before live output.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::stream::Stream;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::api_error;
use crate::auth::check_stream_token;
use crate::pty::{self, PtyFrame, PtySession};
use crate::tailer::sse;
use crate::util::is_valid_terminal_id;
use crate::AppState;

#[derive(Deserialize)]
pub struct TerminalQuery {
    pub session: Option<String>,
    pub token: Option<String>,
}

fn authorize(state: &AppState, query: &TerminalQuery) -> Result<String, (StatusCode, Json<Value>)> {
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
    if !is_valid_terminal_id(session) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_SESSION_ID",
            "Invalid terminal session id",
        ));
    }
    Ok(session.to_string())
}

/// `GET /api/terminal/ws?session&token` — WebSocket upgrade.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let session_id = match authorize(&state, &query) {
        Ok(id) => id,
        Err(rejection) => return rejection.into_response(),
    };
    ws.on_upgrade(move |socket| handle_terminal_ws(socket, state, session_id))
}

async fn handle_terminal_ws(socket: WebSocket, state: AppState, session_id: String) {
    let session = match state.terminals.get_or_create(&session_id).await {
        Ok(session) => session,
        Err(e) => {
            let mut socket = socket;
            let _ = socket
                .send(Message::Text(
                    json!({"type": "error", "message": e}).to_string().into(),
                ))
                .await;
            return;
        }
    };

    let (frame_tx, mut frame_rx) = pty::client_channel();
    let sink_id = session.attach(frame_tx).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    // PTY → WS
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let message = match frame {
                PtyFrame::Data(data) => {
                    Message::Text(json!({"type": "output", "data": data}).to_string().into())
                }
                PtyFrame::Exit => {
                    let _ = ws_tx
                        .send(Message::Text(json!({"type": "exit"}).to_string().into()))
                        .await;
                    break;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // WS → PTY
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Binary(data) => {
                if session.write(data.to_vec()).await.is_err() {
                    break;
                }
            }
            Message::Text(text) => {
                if handle_terminal_control(&session, text.as_str()).await.is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    session.detach(sink_id).await;
    writer.abort();
    debug!("Terminal {session_id}: WebSocket client detached");
}

/// Dispatch one JSON control message; non-JSON text is forwarded verbatim.
async fn handle_terminal_control(session: &Arc<PtySession>, text: &str) -> Result<(), String> {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return session.write(text.as_bytes().to_vec()).await;
    };
    match value["type"].as_str() {
        Some("input") => {
            let data = value["data"].as_str().unwrap_or("");
            session.write(data.as_bytes().to_vec()).await
        }
        Some("resize") => {
            let cols = value["cols"].as_u64().unwrap_or(0);
            let rows = value["rows"].as_u64().unwrap_or(0);
            #[allow(clippy::cast_possible_truncation)]
            session.resize(cols.min(u64::from(u16::MAX)) as u16, rows.min(u64::from(u16::MAX)) as u16)
        }
        _ => Ok(()),
    }
}

/// `GET /api/terminal/stream?session&token` — SSE view of a terminal.
pub async fn terminal_stream(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, (StatusCode, Json<Value>)> {
    let session_id = authorize(&state, &query)?;
    let session = state
        .terminals
        .get_or_create(&session_id)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "SPAWN_FAILED", e))?;

    let (frame_tx, frame_rx) = pty::client_channel();
    let sink_id = session.attach(frame_tx).await;

    let heartbeat = tokio::time::interval(std::time::Duration::from_millis(
        state.config.stream.heartbeat_interval_ms,
    ));
    let stream = futures::stream::unfold(
        (frame_rx, heartbeat, false),
        |(mut rx, mut heartbeat, done)| async move {
            if done {
                return None;
            }
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(PtyFrame::Data(data)) => Some((
                        Ok::<_, Infallible>(sse::frame(None, "output", &json!({"data": data}))),
                        (rx, heartbeat, false),
                    )),
                    Some(PtyFrame::Exit) => Some((
                        Ok(sse::frame(None, "exit", &json!({}))),
                        (rx, heartbeat, true),
                    )),
                    None => None,
                },
                _ = heartbeat.tick() => Some((
                    Ok(sse::heartbeat_frame()),
                    (rx, heartbeat, false),
                )),
            }
        },
    );
    let stream = DetachOnDrop {
        inner: Box::pin(stream),
        session,
        sink_id,
        detached: false,
    };

    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

/// Stream wrapper that detaches the terminal client when the SSE response is
/// dropped, so the idle reaper sees an accurate client count.
struct DetachOnDrop<S> {
    inner: Pin<Box<S>>,
    session: Arc<PtySession>,
    sink_id: u64,
    detached: bool,
}

impl<S: Stream<Item = Result<Bytes, Infallible>>> Stream for DetachOnDrop<S> {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl<S> Drop for DetachOnDrop<S> {
    fn drop(&mut self) {
        if !self.detached {
            self.detached = true;
            let session = Arc::clone(&self.session);
            let sink_id = self.sink_id;
            tokio::spawn(async move {
                session.detach(sink_id).await;
            });
        }
    }
}
