//! HTTP server lifecycle: CORS, backpressure, bind, graceful shutdown.

use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use tokio::sync::Notify;
use tower_http::cors::{AllowOrigin, CorsLayer};

use tt_domain::config::{Config, CorsConfig};

use crate::{api, bootstrap};

/// Build state, spawn the background loops and serve until a shutdown
/// signal arrives. Waiters on the session are released on the way out.
pub async fn run(config: Arc<Config>, config_path: String) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tether starting");

    let shutdown_tx = Arc::new(Notify::new());
    let state =
        bootstrap::build_app_state(config.clone(), config_path, shutdown_tx.clone()).await?;
    bootstrap::spawn_background_tasks(&state);

    let max_concurrent = config.server.max_concurrent_requests;
    tracing::info!(max_concurrent, "concurrency limit set");

    let app = api::router(state.clone())
        .layer(build_cors_layer(&config.server.cors))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "tether listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("axum server error")?;

    // Anyone still queued for the session gets SessionUnavailable instead
    // of waiting out their acquire timeout.
    state.arbiter.close();
    let pending = state.captures.stats().map(|s| s.pending_count).unwrap_or(0);
    tracing::info!(pending_captures = pending, "shutdown complete");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM, or a notify on `shutdown`.
async fn shutdown_signal(shutdown: Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();
    let requested = shutdown.notified();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                    _ = requested => tracing::info!("shutdown requested"),
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "cannot register SIGTERM handler"),
        }
    }

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = requested => tracing::info!("shutdown requested"),
    }
}

// ── CORS ──────────────────────────────────────────────────────────────

/// `["*"]` is fully permissive (no credentials). Otherwise entries are
/// exact origins, or `scheme://host:*` to accept any numeric port.
pub fn build_cors_layer(cors: &CorsConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let headers = [header::CONTENT_TYPE, header::AUTHORIZATION];

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS allows every origin");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(headers);
    }

    let matcher = OriginMatcher::new(&cors.allowed_origins);
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            origin.to_str().map(|o| matcher.matches(o)).unwrap_or(false)
        }))
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(true)
}

#[derive(Debug, Clone, Default)]
struct OriginMatcher {
    exact: Vec<String>,
    any_port: Vec<String>,
}

impl OriginMatcher {
    fn new(origins: &[String]) -> Self {
        let mut m = Self::default();
        for origin in origins {
            match origin.strip_suffix('*') {
                Some(prefix) if prefix.ends_with(':') => m.any_port.push(prefix.to_owned()),
                _ if origin.parse::<HeaderValue>().is_ok() => m.exact.push(origin.clone()),
                _ => tracing::warn!(origin = %origin, "invalid CORS origin, skipping"),
            }
        }
        m
    }

    fn matches(&self, origin: &str) -> bool {
        self.exact.iter().any(|e| e == origin)
            || self.any_port.iter().any(|prefix| {
                origin
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(origins: &[&str]) -> OriginMatcher {
        OriginMatcher::new(&origins.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn exact_origins_match_verbatim() {
        let m = matcher(&["https://chat.example.com"]);
        assert!(m.matches("https://chat.example.com"));
        assert!(!m.matches("https://chat.example.com:8443"));
        assert!(!m.matches("http://chat.example.com"));
    }

    #[test]
    fn wildcard_port_accepts_only_digits() {
        let m = matcher(&["http://localhost:*"]);
        assert!(m.matches("http://localhost:5173"));
        assert!(!m.matches("http://localhost:"));
        assert!(!m.matches("http://localhost:80.evil.com"));
        assert!(!m.matches("http://localhost.evil.com:80"));
    }

    #[test]
    fn default_origins_cover_localhost() {
        let m = OriginMatcher::new(&CorsConfig::default().allowed_origins);
        assert!(m.matches("http://localhost:3000"));
        assert!(m.matches("http://127.0.0.1:5173"));
        assert!(!m.matches("https://example.com"));
    }
}
