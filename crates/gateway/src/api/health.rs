use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

/// `GET /v1/health`: liveness plus the two things most likely to be wrong.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "session": state.arbiter.session(),
        "memory_breaker": state.breaker.state().as_str(),
    }))
}

/// `GET /v1/stats`: breaker, outbox, scheduler, arbiter and cache in one
/// document.
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let queue = match state.captures.stats() {
        Ok(q) => serde_json::to_value(q).unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read outbox stats");
            serde_json::json!({ "error": e.to_string() })
        }
    };

    let holder = state.arbiter.holder().map(|h| {
        serde_json::json!({
            "label": h.label,
            "conversation": h.conversation,
            "held_secs": h.held_for.as_secs(),
        })
    });

    let cache = state.context.cache();
    let cache_entries = match cache.len() {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!(error = %e, "failed to count context cache entries");
            None
        }
    };

    Json(serde_json::json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "breaker": state.breaker.stats(),
        "queue": queue,
        "scheduler": state.scheduler.stats(),
        "arbiter": {
            "session": state.arbiter.session(),
            "held": state.arbiter.is_held(),
            "holder": holder,
            "last_conversation": state.arbiter.last_conversation(),
        },
        "cache": {
            "entries": cache_entries,
            "capacity": cache.capacity(),
        },
    }))
}
