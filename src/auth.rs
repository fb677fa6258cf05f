//! Pre-shared API key authentication.
//!
//! JSON endpoints go through the [`require_api_key`] middleware and expect
//! `Authorization: Bearer <key>`. The SSE and WebSocket endpoints validate
//! a `?token=` query parameter via [`check_stream_token`] instead —
//! browsers can set headers on neither `EventSource` nor WebSocket
//! upgrades. Both paths share the same constant-time comparison, and both
//! reject with the gateway's stable `code` field.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Axum middleware guarding the JSON API. The expected key is injected via
/// the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized` with `code: UNAUTHORIZED` — header missing or not
///   a Bearer credential
/// - `403 Forbidden` with `code: FORBIDDEN` — key present but invalid
/// - `500 Internal Server Error` — [`ApiKey`] extension not found
///   (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error", "code": "MISCONFIGURED"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": "Missing or invalid Authorization header",
                "code": "UNAUTHORIZED",
            })),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key", "code": "FORBIDDEN"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Validate the `?token=` query parameter carried by the streaming
/// endpoints (chat SSE, terminal WS/SSE). A missing token never matches.
pub fn check_stream_token(expected: &str, token: Option<&str>) -> bool {
    constant_time_eq(expected.as_bytes(), token.unwrap_or("").as_bytes())
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always walks the full length of `expected` regardless of how much of
/// `provided` exists, so an attacker cannot determine the key length from
/// response times. Missing positions compare against a sentinel that can
/// never match.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, &e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_stream_token() {
        assert!(check_stream_token("secret", Some("secret")));
        assert!(!check_stream_token("secret", Some("wrong")));
        assert!(!check_stream_token("secret", None));
        assert!(!check_stream_token("secret", Some("")));
    }
}
