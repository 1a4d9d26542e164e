//! Response stabilization: decide when the agent has finished replying.
//!
//! The screen is polled at a fixed interval. Output is final once the
//! classifier reports idle for `stable_threshold` consecutive polls with
//! an unchanged screen. Any thinking marker resets the count. A screen
//! identical to the pre-send snapshot is not trusted as idle during the
//! startup grace window, since the agent may not have reacted yet.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tt_domain::config::{SessionConfig, StabilizerConfig};
use tt_domain::error::Result;
use tt_domain::trace::TraceEvent;

use crate::classify::{MarkerTable, ScreenClass};
use crate::diff::{diff_screens, extract_response};
use crate::driver::SessionDriver;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Poll state machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    /// Input sent, nothing observed yet.
    Sent,
    Polling,
    Thinking,
    Stable,
    TimedOut,
}

impl PollPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stable | Self::TimedOut)
    }
}

/// Pure state of one stabilization run. Time is passed in, so the
/// transitions can be driven directly.
#[derive(Debug)]
pub struct PollTracker {
    before: String,
    markers: Arc<MarkerTable>,
    threshold: u32,
    startup_grace: Duration,
    deadline: Duration,
    interim_grace: Duration,
    interim_interval: Duration,
    phase: PollPhase,
    polls: u32,
    stable_count: u32,
    last_screen: Option<String>,
    last_interim: Option<Duration>,
}

impl PollTracker {
    pub fn new(before: &str, markers: Arc<MarkerTable>, cfg: &StabilizerConfig) -> Self {
        Self {
            before: before.to_owned(),
            markers,
            threshold: cfg.stable_threshold.max(1),
            startup_grace: cfg.startup_grace(),
            deadline: cfg.total_timeout(),
            interim_grace: cfg.interim_grace(),
            interim_interval: cfg.interim_interval(),
            phase: PollPhase::Sent,
            polls: 0,
            stable_count: 0,
            last_screen: None,
            last_interim: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn polls(&self) -> u32 {
        self.polls
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    /// The most recent screen, or the pre-send snapshot before any poll.
    pub fn last_screen(&self) -> &str {
        self.last_screen.as_deref().unwrap_or(&self.before)
    }

    /// Feed one captured screen taken `elapsed` after the send.
    pub fn observe(&mut self, screen: &str, elapsed: Duration) -> PollPhase {
        if self.phase.is_terminal() {
            return self.phase;
        }
        self.polls += 1;

        let same_as_last = self.last_screen.as_deref() == Some(screen);
        let in_grace = elapsed < self.startup_grace && screen == self.before;

        self.phase = match self.markers.classify(screen) {
            ScreenClass::Thinking => {
                self.stable_count = 0;
                PollPhase::Thinking
            }
            ScreenClass::Idle if !in_grace => {
                self.stable_count = if same_as_last {
                    self.stable_count + 1
                } else {
                    1
                };
                if self.stable_count >= self.threshold {
                    PollPhase::Stable
                } else {
                    PollPhase::Polling
                }
            }
            _ => {
                self.stable_count = 0;
                PollPhase::Polling
            }
        };
        self.last_screen = Some(screen.to_owned());

        if self.phase != PollPhase::Stable && elapsed >= self.deadline {
            self.phase = PollPhase::TimedOut;
        }
        self.phase
    }

    /// Whether a "still working" notice is due. Only while thinking, after
    /// the grace period, and at most once per interval. Marks it sent.
    pub fn interim_due(&mut self, elapsed: Duration) -> bool {
        if self.phase != PollPhase::Thinking || elapsed <= self.interim_grace {
            return false;
        }
        let due = self
            .last_interim
            .map_or(true, |last| elapsed.saturating_sub(last) >= self.interim_interval);
        if due {
            self.last_interim = Some(elapsed);
        }
        due
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stabilizer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Receives interim "still working" updates during long turns.
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    async fn still_working(&self, elapsed: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilizeOutcome {
    Stable,
    /// The deadline passed; the text is whatever had appeared by then.
    TimedOut,
}

impl StabilizeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StabilizedResponse {
    /// Reply text with prompt echo and UI chrome removed.
    pub text: String,
    /// Everything that changed on screen since the pre-send snapshot.
    pub raw_diff: String,
    pub outcome: StabilizeOutcome,
    pub polls: u32,
    pub elapsed: Duration,
}

pub struct ResponseStabilizer {
    driver: Arc<dyn SessionDriver>,
    markers: Arc<MarkerTable>,
    cfg: StabilizerConfig,
    capture_lines: u32,
}

impl ResponseStabilizer {
    pub fn new(
        driver: Arc<dyn SessionDriver>,
        markers: Arc<MarkerTable>,
        cfg: StabilizerConfig,
        capture_lines: u32,
    ) -> Self {
        Self {
            driver,
            markers,
            cfg,
            capture_lines,
        }
    }

    pub fn from_config(driver: Arc<dyn SessionDriver>, session: &SessionConfig) -> Result<Self> {
        let markers = Arc::new(MarkerTable::from_config(&session.stabilizer)?);
        Ok(Self::new(
            driver,
            markers,
            session.stabilizer.clone(),
            session.capture_lines,
        ))
    }

    pub fn markers(&self) -> &Arc<MarkerTable> {
        &self.markers
    }

    pub fn driver(&self) -> &Arc<dyn SessionDriver> {
        &self.driver
    }

    /// Screen snapshot to diff a later reply against.
    pub async fn snapshot(&self, session: &str) -> Result<String> {
        self.driver
            .capture_screen(session, self.capture_lines)
            .await
    }

    /// Poll until the reply to `prompt` settles or the deadline passes.
    ///
    /// A timeout is not an error: the partial output is returned with
    /// [`StabilizeOutcome::TimedOut`]. Only driver failures are.
    pub async fn wait_for_response(
        &self,
        session: &str,
        before: &str,
        prompt: &str,
        progress: Option<&dyn ProgressNotifier>,
    ) -> Result<StabilizedResponse> {
        let start = Instant::now();
        let mut tracker = PollTracker::new(before, self.markers.clone(), &self.cfg);
        self.poll(session, &mut tracker, start, progress).await?;

        let elapsed = start.elapsed();
        let raw_diff = diff_screens(before, tracker.last_screen());
        let text = extract_response(&raw_diff, prompt, &self.markers);
        let outcome = if tracker.phase() == PollPhase::Stable {
            StabilizeOutcome::Stable
        } else {
            StabilizeOutcome::TimedOut
        };

        if outcome == StabilizeOutcome::TimedOut {
            tracing::warn!(
                session = %session,
                polls = tracker.polls(),
                elapsed_ms = elapsed.as_millis() as u64,
                partial_chars = text.chars().count(),
                "response did not stabilize before the deadline"
            );
        } else {
            tracing::debug!(session = %session, polls = tracker.polls(), "response stable");
        }
        TraceEvent::ResponseStabilized {
            outcome: outcome.as_str().into(),
            polls: tracker.polls(),
            duration_ms: elapsed.as_millis() as u64,
            response_chars: text.chars().count(),
        }
        .emit();

        Ok(StabilizedResponse {
            text,
            raw_diff,
            outcome,
            polls: tracker.polls(),
            elapsed,
        })
    }

    /// Wait until the session is idle after non-conversational input such
    /// as a context reset. Returns `false` if `timeout` passed first.
    pub async fn wait_for_idle(
        &self,
        session: &str,
        before: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let start = Instant::now();
        let mut tracker =
            PollTracker::new(before, self.markers.clone(), &self.cfg).with_deadline(timeout);
        self.poll(session, &mut tracker, start, None).await?;
        Ok(tracker.phase() == PollPhase::Stable)
    }

    async fn poll(
        &self,
        session: &str,
        tracker: &mut PollTracker,
        start: Instant,
        progress: Option<&dyn ProgressNotifier>,
    ) -> Result<()> {
        loop {
            tokio::time::sleep(self.cfg.poll_interval()).await;
            let screen = self.snapshot(session).await?;
            let elapsed = start.elapsed();
            if tracker.observe(&screen, elapsed).is_terminal() {
                return Ok(());
            }
            if tracker.interim_due(elapsed) {
                if let Some(progress) = progress {
                    progress.still_working(elapsed).await;
                }
            }
        }
    }
}
