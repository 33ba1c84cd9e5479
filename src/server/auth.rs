//! Bearer-token middleware for the broker server.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::server::ServerState;

/// Constant-time token comparison. Never branches on content before the
/// length check inside `ct_eq`.
pub fn validate_auth_token(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}

/// Rejects protected-route requests whose `Authorization: Bearer <token>`
/// header is missing, malformed, or non-matching. `/health` is mounted
/// outside this middleware.
pub async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(token) if validate_auth_token(&state.token, token) => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid or missing auth token" })),
        )
            .into_response(),
    }
}
