use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use crate::api::api_error;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ContextQuery {
    #[serde(default)]
    pub q: String,
}

/// `GET /v1/context?q=...`: the context a turn with this text would get,
/// including degraded-mode fallbacks.
pub async fn get_context(
    State(state): State<AppState>,
    Query(query): Query<ContextQuery>,
) -> Response {
    if query.q.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "query parameter 'q' is required");
    }
    Json(state.context.fetch_context(&query.q).await).into_response()
}

#[derive(Debug, Deserialize)]
pub struct PendingQuery {
    #[serde(default = "d_50")]
    pub limit: usize,
}

fn d_50() -> usize {
    50
}

/// `GET /v1/queue/pending?limit=N`: oldest undelivered captures first.
pub async fn pending_captures(
    State(state): State<AppState>,
    Query(query): Query<PendingQuery>,
) -> Response {
    match state.captures.get_pending(query.limit.min(500)) {
        Ok(pending) => Json(serde_json::json!({
            "count": pending.len(),
            "captures": pending,
        }))
        .into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
