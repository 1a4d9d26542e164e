use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use crate::api::{api_error, status_for};
use crate::state::AppState;

/// `GET /v1/jobs`
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "jobs": state.scheduler.jobs(),
        "stats": state.scheduler.stats(),
    }))
}

/// `POST /v1/jobs/:name/trigger`
///
/// Runs the job now, bypassing its schedule and quiet hours. The call
/// returns as soon as the job is started or queued.
pub async fn trigger_job(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    let known = state
        .scheduler
        .jobs()
        .iter()
        .any(|j| j.name.eq_ignore_ascii_case(&name));
    if !known {
        return api_error(StatusCode::NOT_FOUND, format!("unknown job '{name}'"));
    }

    match state.scheduler.trigger_by_name(&name) {
        Ok(dispatch) => (StatusCode::ACCEPTED, Json(dispatch)).into_response(),
        Err(e) => {
            tracing::warn!(job = %name, error = %e, "manual trigger rejected");
            api_error(status_for(&e), e.to_string())
        }
    }
}
