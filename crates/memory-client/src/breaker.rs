//! Circuit breaker guarding calls to the memory service.
//!
//! ```text
//!   Closed ──(failures ≥ threshold)──▶ Open
//!     ▲                                 │
//!     │                      (recovery_timeout elapsed)
//!  success                              ▼
//!     └──────────── HalfOpen ◀──────────┘
//!                     │
//!                  failure ──▶ Open
//! ```
//!
//! HalfOpen admits exactly one probe at a time, and only that probe's
//! verdict moves the breaker out of HalfOpen. Late results from calls
//! admitted earlier are counted but never change the state. All state
//! sits behind a single mutex that is never held across an `.await`.

use std::future::Future;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tt_domain::config::BreakerConfig;
use tt_domain::error::{Error, Result};
use tt_domain::trace::TraceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    pub time_in_state_secs: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    state_since: Instant,
    total_successes: u64,
    total_failures: u64,
    times_opened: u64,
    probe_in_flight: bool,
    /// Bumped on every entry into HalfOpen; identifies the current probe.
    probe_epoch: u64,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                state_since: Instant::now(),
                total_successes: 0,
                total_failures: 0,
                times_opened: 0,
                probe_in_flight: false,
                probe_epoch: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, cfg: &BreakerConfig) -> Self {
        Self::new(name, cfg.failure_threshold, cfg.recovery_timeout())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An Open breaker whose recovery timeout has elapsed
    /// is reported (and moved to) HalfOpen.
    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    /// Whether a call may proceed right now.
    ///
    /// In HalfOpen this claims the single probe slot, so a caller that
    /// gets `true` must report back with [`record_success`] or
    /// [`record_failure`]. Prefer [`try_acquire`], which cannot leak the
    /// slot.
    ///
    /// [`record_success`]: Self::record_success
    /// [`record_failure`]: Self::record_failure
    /// [`try_acquire`]: Self::try_acquire
    pub fn allow_request(&self) -> bool {
        self.admit().is_some()
    }

    /// Report a success for a call admitted by [`allow_request`]. In
    /// HalfOpen the only admitted call is the probe.
    ///
    /// [`allow_request`]: Self::allow_request
    pub fn record_success(&self) {
        let probe = self.current_probe();
        self.settle(Verdict::Success, probe);
    }

    /// Report a failure for a call admitted by [`allow_request`].
    ///
    /// [`allow_request`]: Self::allow_request
    pub fn record_failure(&self) {
        let probe = self.current_probe();
        self.settle(Verdict::Failure, probe);
    }

    /// Claim permission for one call. The returned attempt must be settled
    /// with [`BreakerAttempt::success`] or [`BreakerAttempt::failure`];
    /// dropping it unsettled counts as a failure.
    pub fn try_acquire(&self) -> Option<BreakerAttempt<'_>> {
        self.admit().map(|probe| BreakerAttempt {
            breaker: self,
            probe,
            settled: false,
        })
    }

    /// Run `fut` under the breaker. Refused calls fail fast with
    /// `WorkerUnreachable`; transient errors count against the breaker.
    pub async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let Some(attempt) = self.try_acquire() else {
            return Err(Error::WorkerUnreachable(format!(
                "{} circuit is {}",
                self.name,
                self.state().as_str()
            )));
        };
        let result = fut.await;
        match &result {
            Ok(_) => attempt.success(),
            Err(e) => attempt.settle_error(e),
        }
        result
    }

    /// Force the breaker open, e.g. from an operator command.
    pub fn trip(&self) {
        let mut inner = self.inner.lock();
        inner.probe_in_flight = false;
        if inner.state != BreakerState::Open {
            self.transition(&mut inner, BreakerState::Open);
        } else {
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        BreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.consecutive_failures,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            times_opened: inner.times_opened,
            time_in_state_secs: inner.state_since.elapsed().as_secs(),
        }
    }

    // ── internals ────────────────────────────────────────────────────

    /// `Some(None)` admits a Closed-state call, `Some(Some(epoch))` the
    /// HalfOpen probe.
    fn admit(&self) -> Option<Option<u64>> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            BreakerState::Closed => Some(None),
            BreakerState::Open => None,
            BreakerState::HalfOpen if inner.probe_in_flight => None,
            BreakerState::HalfOpen => {
                inner.probe_in_flight = true;
                Some(Some(inner.probe_epoch))
            }
        }
    }

    fn current_probe(&self) -> Option<u64> {
        let inner = self.inner.lock();
        (inner.state == BreakerState::HalfOpen && inner.probe_in_flight)
            .then_some(inner.probe_epoch)
    }

    fn settle(&self, verdict: Verdict, probe: Option<u64>) {
        let mut inner = self.inner.lock();
        let is_probe = inner.state == BreakerState::HalfOpen
            && inner.probe_in_flight
            && probe == Some(inner.probe_epoch);
        if is_probe {
            inner.probe_in_flight = false;
        }

        match verdict {
            Verdict::Success => {
                inner.total_successes += 1;
                match inner.state {
                    BreakerState::Closed => inner.consecutive_failures = 0,
                    BreakerState::HalfOpen if is_probe => {
                        inner.consecutive_failures = 0;
                        self.transition(&mut inner, BreakerState::Closed);
                    }
                    _ => {}
                }
            }
            Verdict::Failure => {
                inner.total_failures += 1;
                match inner.state {
                    BreakerState::Closed => {
                        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                        if inner.consecutive_failures >= self.threshold {
                            self.transition(&mut inner, BreakerState::Open);
                        }
                    }
                    BreakerState::HalfOpen if is_probe => {
                        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                        self.transition(&mut inner, BreakerState::Open);
                    }
                    _ => {}
                }
            }
        }
    }

    fn refresh(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed >= self.recovery_timeout {
                self.transition(inner, BreakerState::HalfOpen);
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        inner.state = to;
        inner.state_since = Instant::now();
        match to {
            BreakerState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.times_opened += 1;
                tracing::warn!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    recovery_secs = self.recovery_timeout.as_secs(),
                    "circuit opened"
                );
            }
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.probe_epoch += 1;
                tracing::info!(breaker = %self.name, "circuit half-open, allowing one probe");
            }
            BreakerState::Closed => {
                inner.opened_at = None;
                tracing::info!(breaker = %self.name, "circuit closed");
            }
        }
        TraceEvent::BreakerTransition {
            from: from.as_str().into(),
            to: to.as_str().into(),
            consecutive_failures: inner.consecutive_failures,
        }
        .emit();
    }

    fn release_probe(&self, probe: Option<u64>) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen && probe == Some(inner.probe_epoch) {
            inner.probe_in_flight = false;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Verdict {
    Success,
    Failure,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BreakerAttempt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One admitted call. Settles exactly once.
#[must_use = "an unsettled attempt counts as a failure when dropped"]
pub struct BreakerAttempt<'a> {
    breaker: &'a CircuitBreaker,
    /// Epoch of the HalfOpen window this attempt probes, if it is a probe.
    probe: Option<u64>,
    settled: bool,
}

impl BreakerAttempt<'_> {
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle(Verdict::Success, self.probe);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle(Verdict::Failure, self.probe);
    }

    /// Settle from an error: transient errors (network, timeout, 5xx) are
    /// failures; anything else means the service answered, so it counts
    /// as a success for the breaker.
    pub fn settle_error(self, err: &Error) {
        if err.is_transient() {
            self.failure();
        } else {
            self.success();
        }
    }

    /// Give the slot back without a verdict (the call was never made).
    pub fn abandon(mut self) {
        self.settled = true;
        self.breaker.release_probe(self.probe);
    }
}

impl Drop for BreakerAttempt<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.settle(Verdict::Failure, self.probe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECOVERY: Duration = Duration::from_millis(40);

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new("memory", threshold, RECOVERY)
    }

    fn wait_recovery() {
        std::thread::sleep(RECOVERY + Duration::from_millis(15));
    }

    #[test]
    fn opens_after_exactly_threshold_failures() {
        let b = breaker(3);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
        assert_eq!(b.stats().times_opened, 1);
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let b = breaker(2);
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.stats().failure_count, 1);
    }

    #[test]
    fn full_cycle_open_half_open_closed() {
        let b = breaker(1);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        wait_recovery();
        assert_eq!(b.state(), BreakerState::HalfOpen);

        assert!(b.allow_request());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.stats().failure_count, 0);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(1);
        b.record_failure();
        wait_recovery();
        assert!(b.allow_request());
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.stats().times_opened, 2);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let b = breaker(1);
        b.record_failure();
        wait_recovery();

        let probe = b.try_acquire().expect("first probe admitted");
        assert!(b.try_acquire().is_none());
        assert!(!b.allow_request());
        probe.success();
        assert!(b.try_acquire().is_some());
    }

    #[test]
    fn late_success_does_not_close_an_open_breaker() {
        let b = breaker(1);
        let first = b.try_acquire().unwrap();
        let straggler = b.try_acquire().unwrap();
        first.failure();
        assert_eq!(b.state(), BreakerState::Open);

        straggler.success();
        assert_eq!(b.state(), BreakerState::Open);
        let stats = b.stats();
        assert_eq!(stats.total_successes, 1);
        assert_eq!(stats.times_opened, 1);
    }

    #[test]
    fn only_the_probe_settles_half_open() {
        let b = breaker(1);
        let straggler = b.try_acquire().unwrap();
        b.try_acquire().unwrap().failure();
        wait_recovery();

        let probe = b.try_acquire().unwrap();
        assert!(probe.is_probe());
        assert!(!straggler.is_probe());

        straggler.success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_none(), "probe slot still taken");

        probe.success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn straggler_failure_does_not_reopen_half_open() {
        let b = breaker(1);
        let straggler = b.try_acquire().unwrap();
        b.try_acquire().unwrap().failure();
        wait_recovery();
        let probe = b.try_acquire().unwrap();

        straggler.failure();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        probe.failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.stats().times_opened, 2);
    }

    #[test]
    fn probe_from_an_earlier_window_is_ignored() {
        let b = breaker(1);
        b.record_failure();
        wait_recovery();
        let old_probe = b.try_acquire().unwrap();
        b.trip();
        wait_recovery();
        let new_probe = b.try_acquire().unwrap();

        old_probe.success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        new_probe.success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn dropped_attempt_counts_as_failure() {
        let b = breaker(1);
        {
            let _attempt = b.try_acquire().unwrap();
        }
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn abandoned_probe_frees_the_slot() {
        let b = breaker(1);
        b.record_failure();
        wait_recovery();
        b.try_acquire().unwrap().abandon();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.try_acquire().is_some());
    }

    #[test]
    fn trip_forces_open() {
        let b = breaker(10);
        b.trip();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_request());
    }

    #[test]
    fn non_transient_errors_do_not_open() {
        let b = breaker(1);
        b.try_acquire()
            .unwrap()
            .settle_error(&Error::Other("422".into()));
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn call_fails_fast_when_open() {
        let b = breaker(1);
        let err = b
            .call(async { Err::<(), _>(Error::Http("refused".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Http(_)));

        let err = b.call(async { Ok::<_, Error>(1) }).await.unwrap_err();
        assert!(matches!(err, Error::WorkerUnreachable(_)));
        assert_eq!(b.stats().total_failures, 1);
    }
}
