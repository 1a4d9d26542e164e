use std::sync::Arc;
use std::time::Instant;

use tt_domain::config::Config;
use tt_memory::{CaptureProcessor, CircuitBreaker, ContextService, MemoryProvider};
use tt_scheduler::JobScheduler;
use tt_session::SessionArbiter;
use tt_store::CaptureStore;

use crate::outbound::ChatSink;
use crate::runtime::SessionBridge;

/// Shared application state passed to all API handlers.
///
/// Every collaborator is built once in [`crate::bootstrap::build_app_state`]
/// and shared by handle; nothing lives in a process-wide static.
#[derive(Clone)]
pub struct AppState {
    // ── Core ──────────────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub config_path: String,
    pub started_at: Instant,

    // ── Session ───────────────────────────────────────────────────────
    pub arbiter: Arc<SessionArbiter>,
    pub bridge: Arc<SessionBridge>,

    // ── Memory service ────────────────────────────────────────────────
    pub memory: Arc<dyn MemoryProvider>,
    pub breaker: Arc<CircuitBreaker>,
    pub context: Arc<ContextService>,
    pub captures: CaptureStore,
    pub processor: Arc<CaptureProcessor>,

    // ── Scheduling & outbound ─────────────────────────────────────────
    pub scheduler: JobScheduler,
    pub sink: Arc<dyn ChatSink>,

    // ── Security (startup-computed) ───────────────────────────────────
    /// SHA-256 hash of the API bearer token (read once at startup).
    /// `None` = dev mode (no auth enforced).
    pub api_token_hash: Option<Vec<u8>>,

    /// Notified to stop the HTTP server.
    pub shutdown_tx: Arc<tokio::sync::Notify>,
}
