//! Outbound chat delivery.
//!
//! Replies, busy notices and "still working" updates all leave through a
//! [`ChatSink`]. The webhook sink splits long text into chunks and retries
//! transport errors and 5xx responses with exponential back-off.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tt_domain::config::OutboundConfig;
use tt_domain::error::{Error, Result};
use tt_memory::from_reqwest;
use tt_session::{BusyInfo, BusyNotifier, ProgressNotifier};

#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send(&self, channel: &str, text: &str) -> Result<()>;
}

/// Split `text` into pieces of at most `max_chars` characters, preferring
/// to cut at line breaks.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let max = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text.trim();

    while rest.chars().count() > max {
        let limit = rest
            .char_indices()
            .nth(max)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = rest[..limit]
            .rfind('\n')
            .filter(|&i| i > 0)
            .unwrap_or(limit);
        let piece = rest[..cut].trim_end();
        if !piece.is_empty() {
            chunks.push(piece.to_owned());
        }
        rest = rest[cut..].trim_start_matches('\n');
    }
    if !rest.is_empty() {
        chunks.push(rest.to_owned());
    }
    chunks
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Webhook sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WebhookSink {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    max_chunk_chars: usize,
    max_attempts: u32,
    backoff: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, cfg: &OutboundConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Http(format!("building webhook client: {e}")))?;

        let token = cfg
            .webhook_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty());

        Ok(Self {
            http,
            url: url.into(),
            token,
            max_chunk_chars: cfg.max_chunk_chars,
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_secs(1),
        })
    }

    /// Base delay before the first retry; doubles on each further attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn post_chunk(&self, payload: &serde_json::Value) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            let mut req = self.http.post(&self.url).json(payload);
            if let Some(token) = &self.token {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) if resp.status().is_server_error() => {
                    tracing::warn!(status = %resp.status(), attempt, "chat webhook 5xx");
                    last_err = Some(Error::Http(format!("chat webhook returned {}", resp.status())));
                }
                Ok(resp) => {
                    // 4xx: the payload will not get better by resending it.
                    return Err(Error::Http(format!("chat webhook returned {}", resp.status())));
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "chat webhook request failed");
                    last_err = Some(from_reqwest(e));
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff * (1 << (attempt - 1))).await;
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Http("chat webhook: all attempts failed".into())))
    }
}

#[async_trait]
impl ChatSink for WebhookSink {
    async fn send(&self, channel: &str, text: &str) -> Result<()> {
        let chunks = chunk_message(text, self.max_chunk_chars);
        let parts = chunks.len();
        for (i, chunk) in chunks.iter().enumerate() {
            let payload = serde_json::json!({
                "channel": channel,
                "text": chunk,
                "part": i + 1,
                "parts": parts,
            });
            self.post_chunk(&payload).await?;
        }
        tracing::debug!(channel = %channel, parts, "chat message delivered");
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Log sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Used when no webhook is configured: outbound text only goes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ChatSink for LogSink {
    async fn send(&self, channel: &str, text: &str) -> Result<()> {
        tracing::info!(channel = %channel, chars = text.chars().count(), text = %text, "outbound message");
        Ok(())
    }
}

// ── Notifiers ─────────────────────────────────────────────────────────

/// Posts busy and progress notices to one channel.
pub struct ChannelNotifier {
    sink: Arc<dyn ChatSink>,
    channel: String,
}

impl ChannelNotifier {
    pub fn new(sink: Arc<dyn ChatSink>, channel: impl Into<String>) -> Self {
        Self {
            sink,
            channel: channel.into(),
        }
    }

    async fn post(&self, text: &str) {
        if let Err(e) = self.sink.send(&self.channel, text).await {
            tracing::warn!(channel = %self.channel, error = %e, "failed to post notice");
        }
    }
}

#[async_trait]
impl BusyNotifier for ChannelNotifier {
    async fn notify_busy(&self, info: &BusyInfo) {
        let text = format!(
            "One moment, I'm finishing another task ({}s in). Your message is queued.",
            info.held_for.as_secs()
        );
        self.post(&text).await;
    }
}

#[async_trait]
impl ProgressNotifier for ChannelNotifier {
    async fn still_working(&self, elapsed: Duration) {
        let text = format!("Still working on it ({}s so far)...", elapsed.as_secs());
        self.post(&text).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn short_text_is_one_chunk() {
        assert_eq!(chunk_message("hello", 10), vec!["hello"]);
        assert!(chunk_message("   ", 10).is_empty());
    }

    #[test]
    fn chunks_prefer_line_breaks() {
        let text = "first line\nsecond line\nthird";
        let chunks = chunk_message(text, 15);
        assert_eq!(chunks, vec!["first line", "second line", "third"]);
    }

    #[test]
    fn long_line_is_hard_split_on_char_boundaries() {
        let text = "é".repeat(25);
        let chunks = chunk_message(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[derive(Clone, Default)]
    struct Hook {
        received: Arc<Mutex<Vec<serde_json::Value>>>,
        fail_first: Arc<Mutex<u32>>,
    }

    async fn receive(State(hook): State<Hook>, Json(body): Json<serde_json::Value>) -> StatusCode {
        {
            let mut remaining = hook.fail_first.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return StatusCode::BAD_GATEWAY;
            }
        }
        hook.received.lock().push(body);
        StatusCode::OK
    }

    async fn serve(hook: Hook) -> String {
        let app = Router::new().route("/hook", post(receive)).with_state(hook);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    fn cfg(max_chunk_chars: usize) -> OutboundConfig {
        OutboundConfig {
            max_chunk_chars,
            max_attempts: 3,
            ..OutboundConfig::default()
        }
    }

    #[tokio::test]
    async fn webhook_posts_every_chunk_in_order() {
        let hook = Hook::default();
        let url = serve(hook.clone()).await;
        let sink = WebhookSink::new(url, &cfg(7)).unwrap();

        sink.send("ops", "alpha\nbravo\ncharlie").await.unwrap();

        let got = hook.received.lock().clone();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0]["channel"], "ops");
        assert_eq!(got[0]["text"], "alpha");
        assert_eq!(got[2]["text"], "charlie");
        assert_eq!(got[2]["part"], 3);
        assert_eq!(got[2]["parts"], 3);
    }

    #[tokio::test]
    async fn webhook_retries_server_errors() {
        let hook = Hook::default();
        *hook.fail_first.lock() = 2;
        let url = serve(hook.clone()).await;
        let sink = WebhookSink::new(url, &cfg(4000))
            .unwrap()
            .with_backoff(Duration::from_millis(5));

        sink.send("ops", "hi").await.unwrap();
        assert_eq!(hook.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn webhook_gives_up_after_max_attempts() {
        let hook = Hook::default();
        *hook.fail_first.lock() = 10;
        let url = serve(hook.clone()).await;
        let sink = WebhookSink::new(url, &cfg(4000))
            .unwrap()
            .with_backoff(Duration::from_millis(5));

        assert!(sink.send("ops", "hi").await.is_err());
        assert_eq!(*hook.fail_first.lock(), 7);
    }
}
