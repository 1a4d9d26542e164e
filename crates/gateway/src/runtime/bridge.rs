//! One conversation turn against the shared agent session.
//!
//! ```text
//! fetch context (degraded ok) → acquire arbiter → ensure session →
//! snapshot → send → stabilize → release → garbage check → enqueue capture
//! ```
//!
//! Live chat and scheduled jobs both go through [`SessionBridge::ask`].

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tt_domain::config::SessionConfig;
use tt_domain::error::{Error, Result};
use tt_domain::trace::TraceEvent;
use tt_memory::{ContextResult, ContextService, ContextSource};
use tt_session::{
    AcquireRequest, BusyNotifier, GarbageFilter, ProgressNotifier, SessionArbiter,
    StabilizeOutcome, StabilizedResponse,
};
use tt_store::{CaptureStore, NewCapture};

/// Upper bound on waiting for a freshly started agent to show its prompt.
const AGENT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / reply
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnRequest<'a> {
    /// Shown to waiters while this turn holds the session.
    pub label: &'a str,
    pub channel: &'a str,
    pub text: &'a str,
    /// Conversation id. Recorded with the capture and used as the
    /// arbiter's isolation key, so switching peers resets the agent.
    pub session_id: &'a str,
    pub with_context: bool,
    /// Overrides `session.turn_timeout` for this turn. Counted from the
    /// moment the arbiter is held, never while waiting for it.
    pub deadline: Option<Duration>,
    pub busy: Option<&'a dyn BusyNotifier>,
    pub progress: Option<&'a dyn ProgressNotifier>,
}

impl<'a> TurnRequest<'a> {
    pub fn new(label: &'a str, channel: &'a str, text: &'a str) -> Self {
        Self {
            label,
            channel,
            text,
            session_id: channel,
            with_context: true,
            deadline: None,
            busy: None,
            progress: None,
        }
    }

    pub fn session_id(mut self, session_id: &'a str) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn without_context(mut self) -> Self {
        self.with_context = false;
        self
    }

    pub fn busy(mut self, notifier: &'a dyn BusyNotifier) -> Self {
        self.busy = Some(notifier);
        self
    }

    pub fn progress(mut self, notifier: &'a dyn ProgressNotifier) -> Self {
        self.progress = Some(notifier);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub text: String,
    /// `stable` or `timed_out` (partial output).
    pub outcome: &'static str,
    pub polls: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_source: Option<ContextSource>,
    pub context_degraded: bool,
    /// Outbox id, `None` if the capture could not be persisted.
    pub capture_id: Option<i64>,
}

/// Prefix the user's text with memory context. The unavailable notice is
/// passed through as well so the agent knows it is answering without memory.
pub fn compose_prompt(text: &str, context: Option<&ContextResult>) -> String {
    match context {
        Some(ctx) if !ctx.text.trim().is_empty() => {
            format!("<memory-context>\n{}\n</memory-context>\n\n{text}", ctx.text.trim())
        }
        _ => text.to_owned(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bridge
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionBridge {
    arbiter: Arc<SessionArbiter>,
    session: SessionConfig,
    garbage: GarbageFilter,
    context: Arc<ContextService>,
    captures: CaptureStore,
}

impl SessionBridge {
    pub fn new(
        arbiter: Arc<SessionArbiter>,
        session: SessionConfig,
        garbage: GarbageFilter,
        context: Arc<ContextService>,
        captures: CaptureStore,
    ) -> Self {
        Self {
            arbiter,
            session,
            garbage,
            context,
            captures,
        }
    }

    pub fn arbiter(&self) -> &Arc<SessionArbiter> {
        &self.arbiter
    }

    /// Run one turn end to end.
    ///
    /// The arbiter is held only for the exchange itself; context is fetched
    /// before acquiring and the capture is enqueued after releasing.
    pub async fn ask(&self, req: TurnRequest<'_>) -> Result<TurnReply> {
        let context = if req.with_context {
            Some(self.context.fetch_context(req.text).await)
        } else {
            None
        };
        let prompt = compose_prompt(req.text, context.as_ref());

        let mut acquire = AcquireRequest::new(req.label, req.session_id);
        if let Some(notifier) = req.busy {
            acquire = acquire.notify(notifier);
        }
        let mut guard = self.arbiter.acquire(acquire).await?;

        let turn_timeout = req.deadline.unwrap_or_else(|| self.session.turn_timeout());
        let exchange = match tokio::time::timeout(turn_timeout, self.exchange(&prompt, req.progress))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    label = %req.label,
                    timeout_secs = turn_timeout.as_secs(),
                    "turn exceeded its deadline, interrupting agent"
                );
                self.interrupt_quietly().await;
                Err(Error::ResponseTimeout(format!(
                    "{} exceeded {}s",
                    req.label,
                    turn_timeout.as_secs()
                )))
            }
        };
        if matches!(&exchange, Ok(r) if r.outcome == StabilizeOutcome::TimedOut) {
            // Leave the session idle for the next holder.
            self.interrupt_quietly().await;
        }
        guard.release();
        let response = exchange?;

        self.garbage.check(req.label, &response.text)?;

        let capture_id = self.record(&req, &response.text);
        Ok(TurnReply {
            text: response.text,
            outcome: response.outcome.as_str(),
            polls: response.polls,
            elapsed_ms: response.elapsed.as_millis() as u64,
            context_source: context.as_ref().map(|c| c.source),
            context_degraded: context.as_ref().is_some_and(|c| c.degraded),
            capture_id,
        })
    }

    /// Interrupt the agent without taking the arbiter. Operator escape
    /// hatch for a turn that is stuck while holding the session.
    pub async fn interrupt(&self) -> Result<()> {
        self.arbiter.interrupt().await
    }

    async fn exchange(
        &self,
        prompt: &str,
        progress: Option<&dyn ProgressNotifier>,
    ) -> Result<StabilizedResponse> {
        let stabilizer = self.arbiter.stabilizer();
        let session = self.arbiter.session();

        if stabilizer.driver().ensure_session(&self.session).await? {
            tracing::info!(session = %session, "agent session started");
            let ready = stabilizer
                .wait_for_idle(session, "", AGENT_STARTUP_TIMEOUT)
                .await?;
            if !ready {
                tracing::warn!(session = %session, "agent did not reach its prompt, sending anyway");
            }
        }

        let before = stabilizer.snapshot(session).await?;
        stabilizer.driver().send(session, prompt).await?;
        stabilizer
            .wait_for_response(session, &before, prompt, progress)
            .await
    }

    async fn interrupt_quietly(&self) {
        if let Err(e) = self.arbiter.interrupt().await {
            tracing::warn!(error = %e, "failed to interrupt agent");
        }
    }

    /// Persist the exchange to the outbox. Failures are logged, never
    /// surfaced to the user.
    fn record(&self, req: &TurnRequest<'_>, reply: &str) -> Option<i64> {
        let capture = NewCapture {
            session_id: req.session_id.to_owned(),
            user_message: req.text.to_owned(),
            assistant_response: reply.to_owned(),
            channel: req.channel.to_owned(),
        };
        match self.captures.enqueue(&capture) {
            Ok(id) => {
                TraceEvent::CaptureEnqueued {
                    id,
                    channel: req.channel.to_owned(),
                }
                .emit();
                Some(id)
            }
            Err(e) => {
                tracing::error!(error = %e, channel = %req.channel, "failed to enqueue capture");
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tt_domain::config::{BreakerConfig, StabilizerConfig};
    use tt_memory::testing::{StubMemory, StubMode};
    use tt_memory::CircuitBreaker;
    use tt_session::testing::ScriptedDriver;
    use tt_session::{MarkerTable, ResponseStabilizer, SessionDriver};
    use tt_store::{CaptureStatus, ContextCache, Store};

    use super::*;

    pub(crate) struct Harness {
        pub bridge: Arc<SessionBridge>,
        pub driver: Arc<ScriptedDriver>,
        pub memory: Arc<StubMemory>,
        pub captures: CaptureStore,
    }

    pub(crate) fn session_cfg() -> SessionConfig {
        SessionConfig {
            name: "agent".into(),
            turn_timeout_secs: 30,
            stabilizer: StabilizerConfig {
                poll_interval_ms: 1,
                stable_threshold: 3,
                total_timeout_secs: 10,
                startup_grace_ms: 0,
                ..StabilizerConfig::default()
            },
            ..SessionConfig::default()
        }
    }

    pub(crate) fn harness_with(cfg: SessionConfig, mode: StubMode) -> Harness {
        let driver = Arc::new(ScriptedDriver::with_session("agent", "❯ "));
        let markers = Arc::new(MarkerTable::from_config(&cfg.stabilizer).unwrap());
        let stabilizer = Arc::new(ResponseStabilizer::new(
            driver.clone(),
            markers,
            cfg.stabilizer.clone(),
            cfg.capture_lines,
        ));
        let arbiter = Arc::new(SessionArbiter::new(stabilizer, &cfg));

        let store = Store::open_in_memory().unwrap();
        let captures = CaptureStore::new(store.clone());
        let memory = Arc::new(StubMemory::new(mode));
        let breaker = Arc::new(CircuitBreaker::from_config("memory", &BreakerConfig::default()));
        let context = Arc::new(ContextService::new(
            memory.clone(),
            breaker,
            ContextCache::new(store, 16),
            Duration::from_secs(900),
            Duration::from_millis(200),
        ));
        let garbage = GarbageFilter::from_config(&cfg.garbage).unwrap();
        let bridge = Arc::new(SessionBridge::new(
            arbiter,
            cfg,
            garbage,
            context,
            captures.clone(),
        ));
        Harness {
            bridge,
            driver,
            memory,
            captures,
        }
    }

    pub(crate) fn harness() -> Harness {
        harness_with(session_cfg(), StubMode::Healthy)
    }

    #[tokio::test]
    async fn turn_returns_reply_and_enqueues_capture() {
        let h = harness();
        h.driver.on_send("hello", ["❯ hello\nHi there!\n❯ "]);

        let reply = h
            .bridge
            .ask(TurnRequest::new("chat:web", "web", "hello").session_id("conv-1"))
            .await
            .unwrap();

        assert_eq!(reply.text, "Hi there!");
        assert_eq!(reply.outcome, "stable");
        assert_eq!(reply.context_source, Some(ContextSource::Live));
        assert!(!reply.context_degraded);
        assert!(!h.bridge.arbiter().is_held());

        let sent = h.driver.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("live context"));
        assert!(sent[0].ends_with("hello"));

        let id = reply.capture_id.unwrap();
        let capture = h.captures.get(id).unwrap().unwrap();
        assert_eq!(capture.status, CaptureStatus::Pending);
        assert_eq!(capture.session_id, "conv-1");
        assert_eq!(capture.user_message, "hello");
        assert_eq!(capture.assistant_response, "Hi there!");
    }

    #[tokio::test]
    async fn memory_outage_degrades_context_but_not_the_turn() {
        let h = harness_with(session_cfg(), StubMode::Unreachable);
        h.driver.on_send("status", ["❯ status\nAll good.\n❯ "]);

        let reply = h
            .bridge
            .ask(TurnRequest::new("chat:web", "web", "status"))
            .await
            .unwrap();

        assert_eq!(reply.text, "All good.");
        assert!(reply.context_degraded);
        assert_eq!(reply.context_source, Some(ContextSource::Unavailable));
        assert!(reply.capture_id.is_some());
    }

    #[tokio::test]
    async fn without_context_sends_the_bare_text() {
        let h = harness();
        h.driver.on_send("ping", ["❯ ping\npong\n❯ "]);

        let reply = h
            .bridge
            .ask(TurnRequest::new("job:ping", "scheduled", "ping").without_context())
            .await
            .unwrap();

        assert_eq!(reply.text, "pong");
        assert_eq!(h.driver.sent_texts(), vec!["ping".to_string()]);
        assert_eq!(h.memory.calls(), 0);
        assert!(reply.context_source.is_none());
    }

    #[tokio::test]
    async fn garbage_reply_is_suppressed_and_not_captured() {
        let h = harness();
        h.driver
            .on_send("list", ["❯ list\n⏺ Bash(ls -la)\n  ⎿ total 0\n❯ "]);

        let err = h
            .bridge
            .ask(TurnRequest::new("chat:web", "web", "list").without_context())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::GarbageResponse(_)));
        assert_eq!(h.captures.stats().unwrap().pending_count, 0);
        assert!(!h.bridge.arbiter().is_held());
    }

    #[tokio::test]
    async fn hard_turn_timeout_interrupts_and_releases() {
        let cfg = SessionConfig {
            turn_timeout_secs: 1,
            ..session_cfg()
        };
        let h = harness_with(cfg, StubMode::Healthy);
        h.driver
            .on_send("slow", ["❯ slow\n✻ Pondering… (esc to interrupt)\n❯ "]);

        let err = h
            .bridge
            .ask(TurnRequest::new("chat:web", "web", "slow").without_context())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ResponseTimeout(_)));
        assert_eq!(h.driver.interrupts(), 1);
        assert!(!h.bridge.arbiter().is_held());
        assert_eq!(h.captures.stats().unwrap().pending_count, 0);
    }

    #[tokio::test]
    async fn per_turn_deadline_excludes_arbiter_wait() {
        let h = harness();
        h.driver.on_send("digest", ["❯ digest\nNothing new.\n❯ "]);

        let mut chat = h
            .bridge
            .arbiter()
            .acquire(AcquireRequest::new("chat:web", "web:1"))
            .await
            .unwrap();
        let bridge = h.bridge.clone();
        let job = tokio::spawn(async move {
            bridge
                .ask(
                    TurnRequest::new("job:digest", "ops", "digest")
                        .session_id("job:digest")
                        .deadline(Duration::from_millis(200))
                        .without_context(),
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(h.driver.interrupts(), 0);
        chat.release();

        let reply = job.await.unwrap().unwrap();
        assert_eq!(reply.text, "Nothing new.");
        assert_eq!(h.driver.interrupts(), 0);
    }

    #[tokio::test]
    async fn missing_session_is_started_before_sending() {
        let h = harness();
        h.driver.kill("agent").await.unwrap();
        h.driver.on_send("hi", ["❯ hi\nhello!\n❯ "]);

        let reply = h
            .bridge
            .ask(TurnRequest::new("chat:web", "web", "hi").without_context())
            .await
            .unwrap();

        assert_eq!(reply.text, "hello!");
        assert!(h.driver.is_alive("agent").await.unwrap());
    }

    #[tokio::test]
    async fn unreachable_session_is_reported() {
        let h = harness();
        h.driver.set_unavailable(true);

        let err = h
            .bridge
            .ask(TurnRequest::new("chat:web", "web", "hi").without_context())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SessionUnavailable(_)));
        assert!(err.user_apology().is_some());
        assert!(!h.bridge.arbiter().is_held());
    }

    #[test]
    fn prompt_composition() {
        let live = ContextResult {
            text: "  user prefers metric units ".into(),
            degraded: false,
            source: ContextSource::Live,
        };
        assert_eq!(
            compose_prompt("weather?", Some(&live)),
            "<memory-context>\nuser prefers metric units\n</memory-context>\n\nweather?"
        );
        assert_eq!(compose_prompt("weather?", None), "weather?");
    }
}
