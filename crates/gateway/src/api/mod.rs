pub mod admin;
pub mod auth;
pub mod context;
pub mod health;
pub mod inbound;
pub mod jobs;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tt_domain::error::Error;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes are split into **public** (no auth required) and **protected**
/// (gated behind the bearer-token middleware).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new().route("/v1/health", get(health::health));

    let protected = Router::new()
        // Operational surface
        .route("/v1/stats", get(health::stats))
        // Chat connector contract
        .route("/v1/inbound", post(inbound::inbound))
        // Jobs
        .route("/v1/jobs", get(jobs::list_jobs))
        .route("/v1/jobs/:name/trigger", post(jobs::trigger_job))
        // Memory context + outbox introspection
        .route("/v1/context", get(context::get_context))
        .route("/v1/queue/pending", get(context::pending_captures))
        .route("/v1/memory/health", get(admin::memory_health))
        // Operator actions
        .route("/v1/session/interrupt", post(admin::interrupt_session))
        .route("/v1/admin/breaker/trip", post(admin::trip_breaker))
        .route("/v1/admin/shutdown", post(admin::shutdown))
        .route_layer(middleware::from_fn_with_state(
            state,
            auth::require_api_token,
        ));

    public.merge(protected)
}

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// HTTP status for a failed turn or trigger.
pub(crate) fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::SessionBusy(_) | Error::SessionUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        Error::ResponseTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Error::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
