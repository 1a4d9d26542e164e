//! REST implementation of [`MemoryProvider`].
//!
//! `RestMemoryClient` wraps a `reqwest::Client` and maps each trait method
//! onto one HTTP call, with retry + exponential back-off on transient
//! (5xx / transport) failures.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tt_domain::config::MemoryConfig;
use tt_domain::error::{Error, Result};
use tt_domain::trace::TraceEvent;
use uuid::Uuid;

use crate::provider::{MemoryProvider, MessageCapture};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP client for the memory service. Created once at boot; the inner
/// `reqwest::Client` keeps a connection pool.
#[derive(Debug, Clone)]
pub struct RestMemoryClient {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    workspace_id: Option<String>,
    timeout: Duration,
    max_retries: u32,
}

impl RestMemoryClient {
    pub fn new(cfg: &MemoryConfig) -> Result<Self> {
        let timeout = Duration::from_millis(cfg.timeout_ms);
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_owned(),
            api_key: cfg.api_key.clone(),
            workspace_id: cfg.workspace_id.clone(),
            timeout,
            max_retries: cfg.max_retries,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ── request helpers ──────────────────────────────────────────────

    fn decorate(&self, rb: RequestBuilder) -> RequestBuilder {
        let trace_id = Uuid::new_v4().to_string();
        let mut rb = rb
            .header("X-Client-Type", "tether")
            .header("X-Trace-Id", &trace_id);

        if let Some(ref key) = self.api_key {
            rb = rb.header("X-Api-Key", key);
        }
        if let Some(ref ws) = self.workspace_id {
            rb = rb.header("X-Workspace-Id", ws);
        }
        rb
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ── retry engine ─────────────────────────────────────────────────

    /// Execute a request with retry + exponential back-off.
    ///
    /// * Retries on 5xx and on transport errors (timeouts, refused).
    /// * Does **not** retry on 4xx.
    /// * Emits a `TraceEvent::MemoryCall` after every attempt.
    async fn execute_with_retry(
        &self,
        endpoint: &str,
        build_request: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt - 1));
                tokio::time::sleep(backoff).await;
            }

            let start = Instant::now();
            let result = self.decorate(build_request()).send().await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    TraceEvent::MemoryCall {
                        endpoint: endpoint.to_owned(),
                        status: status.as_u16(),
                        duration_ms,
                    }
                    .emit();

                    if status.is_server_error() {
                        let body = resp.text().await.unwrap_or_default();
                        last_err = Some(Error::Http(format!(
                            "{endpoint} returned {}: {body}",
                            status.as_u16()
                        )));
                        continue;
                    }

                    if status.is_client_error() {
                        let body = resp.text().await.unwrap_or_default();
                        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                            return Err(Error::Auth(format!(
                                "{endpoint} auth failed ({}): {body}",
                                status.as_u16()
                            )));
                        }
                        return Err(Error::Other(format!(
                            "{endpoint} rejected request ({}): {body}",
                            status.as_u16()
                        )));
                    }

                    return Ok(resp);
                }
                Err(e) => {
                    TraceEvent::MemoryCall {
                        endpoint: endpoint.to_owned(),
                        status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                        duration_ms,
                    }
                    .emit();
                    last_err = Some(from_reqwest(e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Http(format!("{endpoint}: all retries exhausted"))))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
impl MemoryProvider for RestMemoryClient {
    async fn fetch_context(&self, query: &str) -> Result<String> {
        let url = self.url("/context");
        let resp = self
            .execute_with_retry("POST /context", || {
                self.http.post(&url).query(&[("query", query)])
            })
            .await?;
        resp.text().await.map_err(from_reqwest)
    }

    async fn post_message(&self, capture: &MessageCapture) -> Result<()> {
        let url = self.url("/messages");
        self.execute_with_retry("POST /messages", || self.http.post(&url).json(capture))
            .await?;
        Ok(())
    }

    async fn health(&self) -> Result<serde_json::Value> {
        let url = self.url("/health");
        let resp = self
            .execute_with_retry("GET /health", || self.http.get(&url))
            .await?;
        let body = resp.text().await.map_err(from_reqwest)?;
        Ok(serde_json::from_str(&body).unwrap_or_else(|_| serde_json::json!({ "status": body })))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error conversion helper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Timeouts become `Error::Timeout`; everything else `Error::Http`.
pub fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;

    #[derive(Clone, Default)]
    struct Fake {
        message_hits: Arc<AtomicUsize>,
        fail_first: Arc<AtomicUsize>,
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client(base_url: String, max_retries: u32) -> RestMemoryClient {
        RestMemoryClient::new(&MemoryConfig {
            base_url,
            api_key: Some("secret".into()),
            max_retries,
            timeout_ms: 2000,
            ..MemoryConfig::default()
        })
        .unwrap()
    }

    fn app(fake: Fake) -> Router {
        Router::new()
            .route(
                "/context",
                post(
                    |headers: HeaderMap,
                     Query(q): Query<std::collections::HashMap<String, String>>| async move {
                        let key = headers
                            .get("x-api-key")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        format!("ctx for {} (key={key})", q.get("query").cloned().unwrap_or_default())
                    },
                ),
            )
            .route(
                "/messages",
                post(
                    |State(fake): State<Fake>, Json(body): Json<serde_json::Value>| async move {
                        fake.message_hits.fetch_add(1, Ordering::SeqCst);
                        if fake.fail_first.load(Ordering::SeqCst) > 0 {
                            fake.fail_first.fetch_sub(1, Ordering::SeqCst);
                            return AxumStatus::SERVICE_UNAVAILABLE;
                        }
                        if body.get("sessionId").is_none() {
                            return AxumStatus::BAD_REQUEST;
                        }
                        AxumStatus::ACCEPTED
                    },
                ),
            )
            .route("/health", get(|| async { Json(serde_json::json!({"ok": true})) }))
            .with_state(fake)
    }

    fn capture() -> MessageCapture {
        MessageCapture {
            session_id: "s".into(),
            user_message: "u".into(),
            assistant_response: "a".into(),
        }
    }

    #[tokio::test]
    async fn fetch_context_sends_query_and_headers() {
        let base = serve(app(Fake::default())).await;
        let text = client(base, 0).fetch_context("calendar today").await.unwrap();
        assert_eq!(text, "ctx for calendar today (key=secret)");
    }

    #[tokio::test]
    async fn post_message_retries_on_5xx() {
        let fake = Fake::default();
        fake.fail_first.store(1, Ordering::SeqCst);
        let base = serve(app(fake.clone())).await;

        client(base, 2).post_message(&capture()).await.unwrap();
        assert_eq!(fake.message_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_return_transient_error() {
        let fake = Fake::default();
        fake.fail_first.store(10, Ordering::SeqCst);
        let base = serve(app(fake.clone())).await;

        let err = client(base, 1).post_message(&capture()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fake.message_hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let base = serve(Router::new().route(
            "/messages",
            post(|| async { AxumStatus::UNPROCESSABLE_ENTITY }),
        ))
        .await;
        let err = client(base, 3).post_message(&capture()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn unreachable_service_is_transient() {
        // Bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{addr}"), 0)
            .fetch_context("q")
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn health_parses_json() {
        let base = serve(app(Fake::default())).await;
        let v = client(base, 0).health().await.unwrap();
        assert_eq!(v["ok"], true);
    }
}
