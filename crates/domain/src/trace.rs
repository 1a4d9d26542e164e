use serde::Serialize;

/// Structured trace events emitted across all tether crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    ArbiterAcquired {
        label: String,
        conversation: String,
        waited_ms: u64,
        notified_busy: bool,
    },
    ArbiterReleased {
        label: String,
        held_ms: u64,
    },
    ContextReset {
        from_conversation: String,
        to_conversation: String,
        acknowledged: bool,
        duration_ms: u64,
    },
    ResponseStabilized {
        outcome: String,
        polls: u32,
        duration_ms: u64,
        response_chars: usize,
    },
    GarbageSuppressed {
        label: String,
        chars: usize,
        artifact_lines: usize,
    },
    MemoryCall {
        endpoint: String,
        status: u16,
        duration_ms: u64,
    },
    BreakerTransition {
        from: String,
        to: String,
        consecutive_failures: u32,
    },
    ContextServed {
        source: String,
        degraded: bool,
        chars: usize,
    },
    CaptureEnqueued {
        id: i64,
        channel: String,
    },
    CaptureDelivered {
        id: i64,
        attempts: u32,
    },
    CaptureFailed {
        id: i64,
        retries: u32,
        terminal: bool,
        error: String,
    },
    OutboxCycle {
        attempted: usize,
        sent: usize,
        failed: usize,
        skipped_open: bool,
    },
    JobTriggered {
        job: String,
        source: String,
    },
    JobQueued {
        job: String,
        queue_depth: usize,
    },
    JobDropped {
        job: String,
        reason: String,
    },
    JobFinished {
        job: String,
        outcome: String,
        duration_ms: u64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "tt_event");
    }
}
