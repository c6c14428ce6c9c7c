//! Transport-layer auth middleware: a single `Authorization: Bearer` header
//! checked against a process-lifetime nonce (spec.md §6, REDESIGN FLAGS).
//!
//! Grounded on `original_source/pwnomcp/utils/auth/handler.py::Nonce` —
//! same bearer-extraction and "no local nonce ⇒ authorize" development
//! mode, collapsed from a decorator wrapping every route handler into one
//! `axum` middleware.

use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// The nonce a client must present, if any. `None` is an explicit
/// development mode — every request is authorized, and that fact is
/// logged loudly at startup so it's never silently enabled in production.
#[derive(Clone)]
pub struct AuthState {
    nonce: Option<String>,
}

impl AuthState {
    #[must_use]
    pub fn new(nonce: Option<String>) -> Self {
        if nonce.is_none() {
            tracing::warn!(
                "no auth nonce configured; HTTP attach endpoint is running in development mode \
                 and will authorize every request"
            );
        }
        Self { nonce }
    }

    /// Load a nonce from a file path, if given. Missing file or unset path
    /// both mean development mode.
    pub fn from_path(path: Option<&str>) -> Self {
        let nonce = path.and_then(|p| std::fs::read_to_string(p).ok()).map(|s| s.trim().to_string());
        Self::new(nonce)
    }

    fn extract_bearer(header: &str) -> Option<&str> {
        header.strip_prefix("Bearer ").map(str::trim)
    }

    fn authorize(&self, authorization_header: Option<&str>) -> bool {
        let Some(expected) = &self.nonce else {
            return true;
        };
        match authorization_header.and_then(Self::extract_bearer) {
            Some(token) => token == expected,
            None => false,
        }
    }
}

pub async fn require_auth(
    State(auth): State<AuthState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if auth.authorize(header) {
        next.run(request).await
    } else {
        tracing::warn!("rejected unauthenticated request");
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed", "message": "invalid or missing nonce"})),
        )
            .into_response()
    }
}
