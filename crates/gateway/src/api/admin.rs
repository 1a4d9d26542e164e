//! Operator actions: probe the memory service, interrupt the agent, trip
//! the breaker, stop the server.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::api::{api_error, status_for};
use crate::state::AppState;

/// `GET /v1/memory/health`: the memory service's own health document.
///
/// Goes through the breaker, so an open circuit answers immediately with
/// 502 instead of waiting on a dead host.
pub async fn memory_health(State(state): State<AppState>) -> Response {
    match state.breaker.call(state.memory.health()).await {
        Ok(body) => Json(serde_json::json!({
            "breaker": state.breaker.state().as_str(),
            "service": body,
        }))
        .into_response(),
        Err(e) => {
            tracing::debug!(error = %e, "memory health probe failed");
            api_error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// `POST /v1/session/interrupt`: send Ctrl-C to the agent. Does not take
/// the arbiter, so it works while a turn is stuck.
pub async fn interrupt_session(State(state): State<AppState>) -> Response {
    tracing::warn!(holder = ?state.arbiter.holder().map(|h| h.label), "operator interrupt");
    match state.bridge.interrupt().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => api_error(status_for(&e), e.to_string()),
    }
}

/// `POST /v1/admin/breaker/trip`: force the memory breaker open.
pub async fn trip_breaker(State(state): State<AppState>) -> impl IntoResponse {
    tracing::warn!(breaker = %state.breaker.name(), "breaker tripped by operator");
    state.breaker.trip();
    Json(state.breaker.stats())
}

/// `POST /v1/admin/shutdown`: graceful stop, same path as SIGTERM.
pub async fn shutdown(State(state): State<AppState>) -> impl IntoResponse {
    tracing::info!(config = %state.config_path, "shutdown requested via API");
    state.shutdown_tx.notify_one();
    StatusCode::ACCEPTED
}
