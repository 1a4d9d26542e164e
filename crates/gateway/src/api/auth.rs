//! API authentication middleware.
//!
//! Reads the env var named by `config.server.api_token_env` (default
//! `TETHER_API_TOKEN`) **once at startup** and caches the SHA-256 digest in
//! `AppState`.
//! - If the env var is set and non-empty, every protected request must carry
//!   `Authorization: Bearer <token>`.
//! - If the env var is unset or empty, the server logs a warning once and
//!   allows unauthenticated access (dev mode).

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

/// Whether `header` (the raw `Authorization` value) carries the token whose
/// SHA-256 digest is `expected`.
pub fn bearer_matches(header: Option<&str>, expected: &[u8]) -> bool {
    let provided = header
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    // Compare fixed-length digests so timing does not leak the token length.
    let provided_hash = Sha256::digest(provided.as_bytes());
    bool::from(provided_hash.ct_eq(expected))
}

/// Axum middleware that enforces bearer-token authentication on protected
/// routes. Attach via `axum::middleware::from_fn_with_state`.
pub async fn require_api_token(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected_hash) = &state.api_token_hash else {
        return next.run(req).await;
    };

    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    if !bearer_matches(header, expected_hash) {
        tracing::debug!(path = %req.uri().path(), "rejected request with bad API token");
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({ "error": "invalid or missing API token" })),
        )
            .into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(token: &str) -> Vec<u8> {
        Sha256::digest(token.as_bytes()).to_vec()
    }

    #[test]
    fn matching_bearer_token_passes() {
        assert!(bearer_matches(Some("Bearer s3cret"), &digest("s3cret")));
    }

    #[test]
    fn wrong_or_missing_token_fails() {
        let expected = digest("s3cret");
        assert!(!bearer_matches(Some("Bearer nope"), &expected));
        assert!(!bearer_matches(Some("s3cret"), &expected));
        assert!(!bearer_matches(None, &expected));
    }
}
