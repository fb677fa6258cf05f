//! REST/SSE/WS route handlers.

pub mod chat_stream;
pub mod health;
pub mod sessions;
pub mod terminal;

use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

/// Build a `{"error": …, "code": …}` response tuple with one of the stable
/// error codes.
pub fn api_error(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
) -> (StatusCode, Json<Value>) {
    (
        status,
        Json(json!({ "error": message.into(), "code": code })),
    )
}
