//! Background delivery of the capture outbox.
//!
//! The conversational path only ever calls [`CaptureStore::enqueue`]. This
//! processor, driven by a timer in the gateway, drains pending captures to
//! the memory service through the circuit breaker.

use std::sync::Arc;

use tt_domain::config::QueueConfig;
use tt_domain::error::Error;
use tt_domain::trace::TraceEvent;
use tt_store::{CaptureStatus, CaptureStore, PendingCapture, SweepReport};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::provider::{MemoryProvider, MessageCapture};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub attempted: usize,
    pub sent: usize,
    /// Attempts that failed; the capture went back to pending.
    pub retried: usize,
    /// Attempts that exhausted the capture's retries.
    pub failed: usize,
    /// The whole cycle was skipped because the breaker was open.
    pub skipped_open: bool,
    /// The cycle ended before the batch limit because the breaker opened
    /// or refused the next attempt.
    pub stopped_early: bool,
}

pub struct CaptureProcessor {
    store: CaptureStore,
    provider: Arc<dyn MemoryProvider>,
    breaker: Arc<CircuitBreaker>,
    cfg: QueueConfig,
}

impl CaptureProcessor {
    pub fn new(
        store: CaptureStore,
        provider: Arc<dyn MemoryProvider>,
        breaker: Arc<CircuitBreaker>,
        cfg: QueueConfig,
    ) -> Self {
        Self {
            store,
            provider,
            breaker,
            cfg,
        }
    }

    pub fn store(&self) -> &CaptureStore {
        &self.store
    }

    /// Reset captures left in `sending` by a crash. Call before the first
    /// cycle.
    pub fn recover(&self) -> usize {
        match self.store.recover_stuck_sending() {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "capture recovery failed");
                0
            }
        }
    }

    /// One delivery pass over at most `batch_size` captures, oldest first.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        if self.breaker.state() == BreakerState::Open {
            report.skipped_open = true;
            tracing::debug!("memory breaker open, skipping outbox cycle");
            self.emit(&report);
            return report;
        }

        for i in 0..self.cfg.batch_size {
            if i > 0 && !self.cfg.item_delay().is_zero() {
                tokio::time::sleep(self.cfg.item_delay()).await;
            }
            if self.breaker.state() == BreakerState::Open {
                report.stopped_early = true;
                break;
            }

            let capture = match self.store.claim_next_pending() {
                Ok(Some(c)) => c,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to claim next capture");
                    break;
                }
            };

            let Some(attempt) = self.breaker.try_acquire() else {
                // Half-open with the probe already taken elsewhere.
                if let Err(e) = self.store.release_claim(capture.id) {
                    tracing::warn!(id = capture.id, error = %e, "failed to release capture claim");
                }
                report.stopped_early = true;
                break;
            };

            report.attempted += 1;
            let msg = MessageCapture::from(&capture);
            let outcome =
                tokio::time::timeout(self.cfg.item_timeout(), self.provider.post_message(&msg))
                    .await;

            match outcome {
                Ok(Ok(())) => {
                    attempt.success();
                    self.delivered(&capture, &mut report);
                }
                Ok(Err(e)) => {
                    attempt.settle_error(&e);
                    self.failed(&capture, &e.to_string(), &mut report);
                }
                Err(_) => {
                    attempt.failure();
                    let msg = format!(
                        "delivery timed out after {}ms",
                        self.cfg.item_timeout().as_millis()
                    );
                    self.failed(&capture, &msg, &mut report);
                }
            }
        }

        if report.attempted > 0 || report.stopped_early {
            tracing::info!(
                attempted = report.attempted,
                sent = report.sent,
                retried = report.retried,
                failed = report.failed,
                stopped_early = report.stopped_early,
                "outbox cycle finished"
            );
        }
        self.emit(&report);
        report
    }

    /// Delete terminal captures past their retention windows.
    pub fn sweep(&self) -> Option<SweepReport> {
        match self
            .store
            .sweep(self.cfg.sent_retention(), self.cfg.failed_retention())
        {
            Ok(r) => {
                if r.sent_deleted + r.failed_deleted > 0 {
                    tracing::info!(
                        sent = r.sent_deleted,
                        failed = r.failed_deleted,
                        "outbox retention sweep"
                    );
                }
                Some(r)
            }
            Err(e) => {
                tracing::warn!(error = %e, "outbox retention sweep failed");
                None
            }
        }
    }

    // ── internals ────────────────────────────────────────────────────

    fn delivered(&self, capture: &PendingCapture, report: &mut CycleReport) {
        match self.store.mark_sent(capture.id) {
            Ok(_) => {
                report.sent += 1;
                TraceEvent::CaptureDelivered {
                    id: capture.id,
                    attempts: capture.retries + 1,
                }
                .emit();
            }
            Err(e) => {
                tracing::warn!(id = capture.id, error = %e, "delivered capture could not be marked sent")
            }
        }
    }

    fn failed(&self, capture: &PendingCapture, error: &str, report: &mut CycleReport) {
        match self
            .store
            .record_failure(capture.id, error, self.cfg.max_retries)
        {
            Ok(outcome) => {
                let terminal = outcome.status == CaptureStatus::Failed;
                if terminal {
                    report.failed += 1;
                    let err = Error::MaxRetriesExceeded {
                        id: capture.id,
                        retries: outcome.retries,
                    };
                    tracing::warn!(error = %err, last_error = %error, "capture gave up");
                } else {
                    report.retried += 1;
                    tracing::debug!(id = capture.id, retries = outcome.retries, error = %error, "capture delivery failed");
                }
                TraceEvent::CaptureFailed {
                    id: capture.id,
                    retries: outcome.retries,
                    terminal,
                    error: error.to_owned(),
                }
                .emit();
            }
            Err(e) => {
                tracing::warn!(id = capture.id, error = %e, "failed to record capture failure")
            }
        }
    }

    fn emit(&self, report: &CycleReport) {
        TraceEvent::OutboxCycle {
            attempted: report.attempted,
            sent: report.sent,
            failed: report.retried + report.failed,
            skipped_open: report.skipped_open,
        }
        .emit();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{StubMemory, StubMode};
    use tt_store::{NewCapture, Store};

    fn cfg(max_retries: u32) -> QueueConfig {
        QueueConfig {
            batch_size: 10,
            item_timeout_ms: 200,
            item_delay_ms: 0,
            max_retries,
            ..QueueConfig::default()
        }
    }

    fn processor(
        mode: StubMode,
        threshold: u32,
        max_retries: u32,
    ) -> (CaptureProcessor, Arc<StubMemory>, Arc<CircuitBreaker>) {
        let stub = Arc::new(StubMemory::new(mode));
        let breaker = Arc::new(CircuitBreaker::new(
            "memory",
            threshold,
            Duration::from_secs(60),
        ));
        let store = CaptureStore::new(Store::open_in_memory().unwrap());
        let p = CaptureProcessor::new(store, stub.clone(), breaker.clone(), cfg(max_retries));
        (p, stub, breaker)
    }

    fn enqueue(p: &CaptureProcessor, n: usize) -> Vec<i64> {
        (0..n)
            .map(|i| {
                p.store()
                    .enqueue(&NewCapture {
                        session_id: format!("s{i}"),
                        user_message: format!("q{i}"),
                        assistant_response: format!("a{i}"),
                        channel: "web".into(),
                    })
                    .unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn healthy_service_drains_the_outbox() {
        let (p, stub, _) = processor(StubMode::Healthy, 5, 3);
        enqueue(&p, 3);

        let r = p.run_cycle().await;
        assert_eq!(r.attempted, 3);
        assert_eq!(r.sent, 3);
        assert_eq!(stub.delivered().len(), 3);
        assert_eq!(stub.delivered()[0].session_id, "s0");
        assert_eq!(p.store().stats().unwrap().sent_count, 3);
    }

    #[tokio::test]
    async fn unreachable_service_exhausts_retries() {
        let (p, _, _) = processor(StubMode::Unreachable, 100, 3);
        let ids = enqueue(&p, 5);

        p.run_cycle().await;
        for id in &ids {
            let c = p.store().get(*id).unwrap().unwrap();
            assert_eq!(c.status, CaptureStatus::Pending);
            assert_eq!(c.retries, 1);
        }

        p.run_cycle().await;
        p.run_cycle().await;
        for id in &ids {
            let c = p.store().get(*id).unwrap().unwrap();
            assert_eq!(c.status, CaptureStatus::Failed);
            assert_eq!(c.retries, 3);
        }
        assert!(p.store().get_pending(10).unwrap().is_empty());

        let r = p.run_cycle().await;
        assert_eq!(r.attempted, 0, "failed captures are never retried");
    }

    #[tokio::test]
    async fn open_breaker_skips_the_cycle() {
        let (p, stub, breaker) = processor(StubMode::Healthy, 5, 3);
        enqueue(&p, 2);
        breaker.trip();

        let r = p.run_cycle().await;
        assert!(r.skipped_open);
        assert_eq!(r.attempted, 0);
        assert_eq!(stub.calls(), 0);
        assert_eq!(p.store().stats().unwrap().pending_count, 2);
    }

    #[tokio::test]
    async fn breaker_opening_mid_cycle_stops_early() {
        let (p, _, breaker) = processor(StubMode::Unreachable, 2, 5);
        enqueue(&p, 6);

        let r = p.run_cycle().await;
        assert_eq!(r.attempted, 2);
        assert!(r.stopped_early);
        assert_eq!(breaker.state(), BreakerState::Open);

        let stats = p.store().stats().unwrap();
        assert_eq!(stats.pending_count, 6);
        assert_eq!(stats.sending_count, 0);
    }

    #[tokio::test]
    async fn slow_delivery_times_out_and_is_retried() {
        let (p, _, _) = processor(StubMode::Slow(Duration::from_secs(5)), 5, 3);
        let ids = enqueue(&p, 1);

        let r = p.run_cycle().await;
        assert_eq!(r.retried, 1);
        let c = p.store().get(ids[0]).unwrap().unwrap();
        assert_eq!(c.status, CaptureStatus::Pending);
        assert!(c.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn recover_then_deliver_after_crash() {
        let (p, stub, _) = processor(StubMode::Healthy, 5, 3);
        enqueue(&p, 1);
        // Simulate a crash mid-send.
        p.store().claim_next_pending().unwrap().unwrap();
        assert_eq!(p.run_cycle().await.attempted, 0);

        assert_eq!(p.recover(), 1);
        assert_eq!(p.run_cycle().await.sent, 1);
        assert_eq!(stub.delivered().len(), 1);
    }

    #[tokio::test]
    async fn batch_size_bounds_each_cycle() {
        let (mut p, _, _) = processor(StubMode::Healthy, 5, 3);
        p.cfg.batch_size = 2;
        enqueue(&p, 5);
        assert_eq!(p.run_cycle().await.sent, 2);
        assert_eq!(p.store().stats().unwrap().pending_count, 3);
    }
}
