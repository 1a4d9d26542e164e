//! Exclusive access to the shared agent session.
//!
//! Every interaction (chat turn, scheduled job, manual trigger) goes
//! through [`SessionArbiter::acquire`]. The returned [`ArbiterGuard`]
//! releases on drop, so panics, errors and cancelled futures can never
//! leave the session locked.
//!
//! When the acquiring conversation differs from the previous holder's, the
//! agent's conversational context is reset before the guard is handed
//! out, so one peer never sees another's history. The key is the
//! conversation (`telegram:42`, `job:digest`), not the connector.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tt_domain::config::SessionConfig;
use tt_domain::error::{Error, Result};
use tt_domain::trace::TraceEvent;

use crate::stabilizer::ResponseStabilizer;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who holds the session right now.
#[derive(Debug, Clone)]
pub struct BusyInfo {
    pub label: String,
    pub conversation: String,
    pub held_for: Duration,
}

impl BusyInfo {
    pub fn describe(&self) -> String {
        format!(
            "busy with {} ({}) for {}s",
            self.label,
            self.conversation,
            self.held_for.as_secs()
        )
    }
}

/// Told once when an acquirer has to wait, so the user can be informed.
#[async_trait]
pub trait BusyNotifier: Send + Sync {
    async fn notify_busy(&self, info: &BusyInfo);
}

pub struct AcquireRequest<'a> {
    /// Human-readable description of the work, e.g. `chat:web` or a job name.
    pub label: &'a str,
    /// Context isolation key. A change from the previous holder's value
    /// triggers a reset.
    pub conversation: &'a str,
    pub notifier: Option<&'a dyn BusyNotifier>,
}

impl<'a> AcquireRequest<'a> {
    pub fn new(label: &'a str, conversation: &'a str) -> Self {
        Self {
            label,
            conversation,
            notifier: None,
        }
    }

    pub fn notify(mut self, notifier: &'a dyn BusyNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

#[derive(Debug)]
struct Holder {
    label: String,
    conversation: String,
    since: Instant,
}

type HolderSlot = Arc<Mutex<Option<Holder>>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Arbiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionArbiter {
    sem: Arc<Semaphore>,
    holder: HolderSlot,
    last_conversation: Mutex<Option<String>>,
    stabilizer: Arc<ResponseStabilizer>,
    session: String,
    reset_command: String,
    reset_timeout: Duration,
    acquire_timeout: Duration,
}

impl SessionArbiter {
    pub fn new(stabilizer: Arc<ResponseStabilizer>, cfg: &SessionConfig) -> Self {
        Self {
            sem: Arc::new(Semaphore::new(1)),
            holder: Arc::new(Mutex::new(None)),
            last_conversation: Mutex::new(None),
            stabilizer,
            session: cfg.name.clone(),
            reset_command: cfg.reset_command.clone(),
            reset_timeout: cfg.reset_timeout(),
            acquire_timeout: cfg.acquire_timeout(),
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn stabilizer(&self) -> &Arc<ResponseStabilizer> {
        &self.stabilizer
    }

    pub fn holder(&self) -> Option<BusyInfo> {
        self.holder.lock().as_ref().map(|h| BusyInfo {
            label: h.label.clone(),
            conversation: h.conversation.clone(),
            held_for: h.since.elapsed(),
        })
    }

    pub fn is_held(&self) -> bool {
        self.sem.available_permits() == 0
    }

    pub fn last_conversation(&self) -> Option<String> {
        self.last_conversation.lock().clone()
    }

    /// Refuse all further acquisitions. Waiters fail with
    /// `SessionUnavailable`.
    pub fn close(&self) {
        self.sem.close();
    }

    /// Wait for exclusive access, notifying the request's notifier once
    /// if the session is busy. Fails with `SessionBusy` after the acquire
    /// timeout.
    pub async fn acquire(&self, req: AcquireRequest<'_>) -> Result<ArbiterGuard> {
        let start = Instant::now();
        let mut notified_busy = false;

        let permit = match self.sem.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(tokio::sync::TryAcquireError::Closed) => {
                return Err(Error::SessionUnavailable("arbiter closed".into()));
            }
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                if let (Some(notifier), Some(info)) = (req.notifier, self.holder()) {
                    notifier.notify_busy(&info).await;
                    notified_busy = true;
                }
                tracing::debug!(label = %req.label, "session busy, waiting");
                match tokio::time::timeout(self.acquire_timeout, self.sem.clone().acquire_owned())
                    .await
                {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => {
                        return Err(Error::SessionUnavailable("arbiter closed".into()));
                    }
                    Err(_) => {
                        let holder = self
                            .holder()
                            .map(|h| h.describe())
                            .unwrap_or_else(|| "busy".into());
                        tracing::warn!(
                            label = %req.label,
                            waited_secs = self.acquire_timeout.as_secs(),
                            holder = %holder,
                            "gave up waiting for the session"
                        );
                        return Err(Error::SessionBusy(format!(
                            "{} waited {}s: {holder}",
                            req.label,
                            self.acquire_timeout.as_secs()
                        )));
                    }
                }
            }
        };

        *self.holder.lock() = Some(Holder {
            label: req.label.to_owned(),
            conversation: req.conversation.to_owned(),
            since: Instant::now(),
        });
        // From here on the guard owns the permit; any early return or
        // cancellation releases it.
        let guard = ArbiterGuard {
            permit: Some(permit),
            holder: self.holder.clone(),
            label: req.label.to_owned(),
            acquired_at: Instant::now(),
        };

        TraceEvent::ArbiterAcquired {
            label: req.label.to_owned(),
            conversation: req.conversation.to_owned(),
            waited_ms: start.elapsed().as_millis() as u64,
            notified_busy,
        }
        .emit();

        let previous = self
            .last_conversation
            .lock()
            .replace(req.conversation.to_owned());
        if let Some(previous) = previous.filter(|p| p != req.conversation) {
            self.reset_context(&previous, req.conversation).await;
        }

        Ok(guard)
    }

    /// Interrupt whatever the agent is doing.
    pub async fn interrupt(&self) -> Result<()> {
        self.stabilizer.driver().interrupt(&self.session).await
    }

    /// Clear the agent's conversation before serving a new one. A reset
    /// that is not acknowledged in time is logged and the turn proceeds.
    async fn reset_context(&self, from: &str, to: &str) {
        let driver = self.stabilizer.driver();
        match driver.is_alive(&self.session).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(error = %e, "cannot check session before context reset");
                return;
            }
        }

        let start = Instant::now();
        let acknowledged = match self.send_reset().await {
            Ok(ack) => ack,
            Err(e) => {
                tracing::warn!(error = %e, "context reset failed");
                false
            }
        };
        if acknowledged {
            tracing::info!(from = %from, to = %to, "context reset on conversation switch");
        } else {
            tracing::warn!(
                from = %from,
                to = %to,
                timeout_ms = self.reset_timeout.as_millis() as u64,
                "context reset not acknowledged, isolation degraded"
            );
        }
        TraceEvent::ContextReset {
            from_conversation: from.to_owned(),
            to_conversation: to.to_owned(),
            acknowledged,
            duration_ms: start.elapsed().as_millis() as u64,
        }
        .emit();
    }

    async fn send_reset(&self) -> Result<bool> {
        let before = self.stabilizer.snapshot(&self.session).await?;
        self.stabilizer
            .driver()
            .send(&self.session, &self.reset_command)
            .await?;
        self.stabilizer
            .wait_for_idle(&self.session, &before, self.reset_timeout)
            .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Exclusive hold on the session. Released exactly once, on
/// [`ArbiterGuard::release`] or drop.
#[must_use = "the session is released as soon as the guard is dropped"]
pub struct ArbiterGuard {
    permit: Option<OwnedSemaphorePermit>,
    holder: HolderSlot,
    label: String,
    acquired_at: Instant,
}

impl std::fmt::Debug for ArbiterGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArbiterGuard")
            .field("label", &self.label)
            .field("held", &self.permit.is_some())
            .finish()
    }
}

impl ArbiterGuard {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        // Clear the holder first so the next acquirer never sees a stale one.
        self.holder.lock().take();
        drop(permit);

        TraceEvent::ArbiterReleased {
            label: self.label.clone(),
            held_ms: self.acquired_at.elapsed().as_millis() as u64,
        }
        .emit();
    }
}

impl Drop for ArbiterGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tt_domain::config::StabilizerConfig;

    use super::*;
    use crate::classify::MarkerTable;
    use crate::driver::SessionDriver;
    use crate::testing::ScriptedDriver;

    fn session_cfg() -> SessionConfig {
        SessionConfig {
            name: "agent".into(),
            reset_command: "/clear".into(),
            reset_timeout_ms: 2000,
            ..SessionConfig::default()
        }
    }

    fn arbiter(driver: Arc<ScriptedDriver>) -> Arc<SessionArbiter> {
        let stab_cfg = StabilizerConfig {
            poll_interval_ms: 1,
            startup_grace_ms: 0,
            ..StabilizerConfig::default()
        };
        let markers = Arc::new(MarkerTable::from_config(&stab_cfg).unwrap());
        let stabilizer = Arc::new(ResponseStabilizer::new(driver, markers, stab_cfg, 50));
        Arc::new(SessionArbiter::new(stabilizer, &session_cfg()))
    }

    fn idle_driver() -> Arc<ScriptedDriver> {
        Arc::new(ScriptedDriver::with_session("agent", "❯ "))
    }

    #[tokio::test]
    async fn at_most_one_holder() {
        let arb = arbiter(idle_driver());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let arb = arb.clone();
            let active = active.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let label = format!("task{i}");
                let _guard = arb.acquire(AcquireRequest::new(&label, "web")).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert!(!arb.is_held());
    }

    #[tokio::test]
    async fn panic_in_critical_section_releases() {
        let arb = arbiter(idle_driver());
        let a = arb.clone();
        let res = tokio::spawn(async move {
            let _guard = a.acquire(AcquireRequest::new("boom", "web")).await.unwrap();
            panic!("handler blew up");
        })
        .await;
        assert!(res.is_err());

        let guard = tokio::time::timeout(
            Duration::from_millis(200),
            arb.acquire(AcquireRequest::new("next", "web")),
        )
        .await
        .expect("session left locked")
        .unwrap();
        assert_eq!(arb.holder().unwrap().label, "next");
        drop(guard);
        assert!(arb.holder().is_none());
    }

    #[tokio::test]
    async fn error_path_releases() {
        let arb = arbiter(idle_driver());
        async fn failing_turn(arb: &SessionArbiter) -> Result<()> {
            let _guard = arb.acquire(AcquireRequest::new("turn", "web")).await?;
            Err(Error::Other("send failed".into()))
        }
        assert!(failing_turn(&arb).await.is_err());
        assert!(!arb.is_held());
    }

    struct CountingNotifier {
        calls: AtomicUsize,
        last: Mutex<Option<BusyInfo>>,
    }

    #[async_trait]
    impl BusyNotifier for CountingNotifier {
        async fn notify_busy(&self, info: &BusyInfo) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(info.clone());
        }
    }

    #[tokio::test]
    async fn waiter_is_notified_once() {
        let arb = arbiter(idle_driver());
        let mut first = arb
            .acquire(AcquireRequest::new("morning-brief", "web"))
            .await
            .unwrap();

        let notifier = Arc::new(CountingNotifier {
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        });
        let (a, n) = (arb.clone(), notifier.clone());
        let waiter = tokio::spawn(async move {
            let _g = a
                .acquire(AcquireRequest::new("chat", "web").notify(n.as_ref()))
                .await
                .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        first.release();
        first.release(); // idempotent
        waiter.await.unwrap();

        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
        let info = notifier.last.lock().clone().unwrap();
        assert_eq!(info.label, "morning-brief");
        assert!(info.describe().contains("morning-brief"));
    }

    #[tokio::test]
    async fn acquire_times_out_as_busy() {
        let driver = idle_driver();
        let stab_cfg = StabilizerConfig::default();
        let markers = Arc::new(MarkerTable::from_config(&stab_cfg).unwrap());
        let stabilizer = Arc::new(ResponseStabilizer::new(driver, markers, stab_cfg, 50));
        let arb = SessionArbiter::new(stabilizer, &session_cfg())
            .with_acquire_timeout(Duration::from_millis(20));

        let _held = arb.acquire(AcquireRequest::new("long job", "web")).await.unwrap();
        let err = arb
            .acquire(AcquireRequest::new("chat", "web"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionBusy(_)));
    }

    #[tokio::test]
    async fn closed_arbiter_is_unavailable() {
        let arb = arbiter(idle_driver());
        arb.close();
        let err = arb.acquire(AcquireRequest::new("x", "web")).await.unwrap_err();
        assert!(matches!(err, Error::SessionUnavailable(_)));
    }

    #[tokio::test]
    async fn conversation_switch_resets_context() {
        let driver = idle_driver();
        let arb = arbiter(driver.clone());

        drop(arb.acquire(AcquireRequest::new("a", "web:1")).await.unwrap());
        drop(arb.acquire(AcquireRequest::new("b", "web:1")).await.unwrap());
        assert!(driver.sent_texts().is_empty(), "first and same-conversation turns never reset");

        drop(arb.acquire(AcquireRequest::new("c", "telegram:42")).await.unwrap());
        assert_eq!(driver.sent_texts(), vec!["/clear".to_string()]);
        assert_eq!(arb.last_conversation().as_deref(), Some("telegram:42"));
    }

    #[tokio::test]
    async fn two_peers_on_one_connector_are_isolated() {
        let driver = idle_driver();
        let arb = arbiter(driver.clone());

        drop(arb.acquire(AcquireRequest::new("chat:telegram", "telegram:alice")).await.unwrap());
        drop(arb.acquire(AcquireRequest::new("chat:telegram", "telegram:bob")).await.unwrap());
        assert_eq!(driver.sent_texts(), vec!["/clear".to_string()]);

        drop(arb.acquire(AcquireRequest::new("job:digest", "job:digest")).await.unwrap());
        assert_eq!(driver.sent_texts().len(), 2);
    }

    #[tokio::test]
    async fn no_reset_when_session_is_not_running() {
        let driver = idle_driver();
        let arb = arbiter(driver.clone());
        drop(arb.acquire(AcquireRequest::new("a", "web")).await.unwrap());
        driver.kill("agent").await.unwrap();
        drop(arb.acquire(AcquireRequest::new("b", "telegram")).await.unwrap());
        assert!(driver.sent_texts().is_empty());
    }
}
