//! AppState construction and background-task spawning.
//!
//! `serve` runs both; one-shot CLI commands (`ask`, `jobs run`) build the
//! state and skip the periodic loops they do not need.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use sha2::{Digest, Sha256};

use tt_domain::config::{Config, ConfigSeverity};
use tt_memory::{CaptureProcessor, CircuitBreaker, ContextService, MemoryProvider, RestMemoryClient};
use tt_scheduler::JobScheduler;
use tt_session::{GarbageFilter, ResponseStabilizer, SessionArbiter, SessionDriver, TmuxDriver};
use tt_store::{CaptureStore, ContextCache, Store};

use crate::outbound::{ChatSink, LogSink, WebhookSink};
use crate::runtime::{SessionBridge, SessionJobExecutor};
use crate::state::AppState;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`].
pub async fn build_app_state(
    config: Arc<Config>,
    config_path: String,
    shutdown_tx: Arc<tokio::sync::Notify>,
) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Persisted store ──────────────────────────────────────────────
    let store = Store::open(&config.store.path)
        .with_context(|| format!("opening store at {}", config.store.path.display()))?;
    let captures = CaptureStore::new(store.clone());
    let cache = ContextCache::new(store, config.cache.capacity);
    tracing::info!(path = %config.store.path.display(), "store ready");

    // ── Memory service + breaker ─────────────────────────────────────
    let memory: Arc<dyn MemoryProvider> = Arc::new(
        RestMemoryClient::new(&config.memory).context("creating memory client")?,
    );
    let breaker = Arc::new(CircuitBreaker::from_config("memory", &config.breaker));
    let context = Arc::new(ContextService::from_config(
        memory.clone(),
        breaker.clone(),
        cache,
        &config.memory,
        &config.cache,
    ));
    let processor = Arc::new(CaptureProcessor::new(
        captures.clone(),
        memory.clone(),
        breaker.clone(),
        config.queue.clone(),
    ));
    tracing::info!(
        url = %config.memory.base_url,
        failure_threshold = config.breaker.failure_threshold,
        "memory client ready"
    );

    // ── Agent session ────────────────────────────────────────────────
    let tmux = TmuxDriver::new();
    if !tmux.available().await {
        tracing::warn!("tmux not found on PATH, turns will fail until it is installed");
    }
    let driver: Arc<dyn SessionDriver> = Arc::new(tmux);
    let stabilizer = Arc::new(
        ResponseStabilizer::from_config(driver, &config.session)
            .context("compiling screen markers")?,
    );
    let arbiter = Arc::new(SessionArbiter::new(stabilizer, &config.session));
    let garbage =
        GarbageFilter::from_config(&config.session.garbage).context("compiling garbage patterns")?;
    let bridge = Arc::new(SessionBridge::new(
        arbiter.clone(),
        config.session.clone(),
        garbage,
        context.clone(),
        captures.clone(),
    ));
    tracing::info!(session = %config.session.name, "session arbiter ready");

    // ── Outbound chat ────────────────────────────────────────────────
    let sink: Arc<dyn ChatSink> = match &config.outbound.webhook_url {
        Some(url) => {
            let sink = WebhookSink::new(url.clone(), &config.outbound)
                .context("creating chat webhook client")?;
            tracing::info!(url = %sink.url(), "chat webhook sink ready");
            Arc::new(sink)
        }
        None => {
            tracing::info!("no outbound.webhook_url, outbound messages are only logged");
            Arc::new(LogSink)
        }
    };

    // ── Scheduler ────────────────────────────────────────────────────
    let executor = Arc::new(SessionJobExecutor::new(bridge.clone(), sink.clone()));
    let scheduler = JobScheduler::new(config.scheduler.clone(), &config.jobs, executor)
        .context("compiling job schedules")?;
    tracing::info!(
        jobs = config.jobs.len(),
        enabled = config.scheduler.enabled,
        queue_capacity = config.scheduler.queue_capacity,
        "scheduler ready"
    );

    // ── API token (read once, hash for constant-time comparison) ────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(t) => {
                tracing::info!(source = %format!("env:{env_var}"), "API bearer-token auth enabled");
                Some(Sha256::digest(t.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!("API bearer-token auth DISABLED, set the {env_var} env var");
                None
            }
        }
    };

    Ok(AppState {
        config,
        config_path,
        started_at: Instant::now(),
        arbiter,
        bridge,
        memory,
        breaker,
        context,
        captures,
        processor,
        scheduler,
        sink,
        api_token_hash,
        shutdown_tx,
    })
}

/// Spawn the long-running background tokio tasks (outbox delivery, outbox
/// retention sweep, scheduler tick).
///
/// Call this **after** [`build_app_state`] when running the HTTP server.
pub fn spawn_background_tasks(state: &AppState) {
    // ── Outbox delivery ──────────────────────────────────────────────
    {
        let processor = state.processor.clone();
        let every = state.config.queue.interval();
        tokio::spawn(async move {
            let recovered = processor.recover();
            if recovered > 0 {
                tracing::info!(recovered, "reset captures left in flight by a previous run");
            }
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let report = processor.run_cycle().await;
                if report.attempted > 0 {
                    tracing::debug!(
                        attempted = report.attempted,
                        sent = report.sent,
                        retried = report.retried,
                        failed = report.failed,
                        "outbox cycle"
                    );
                }
            }
        });
    }

    // ── Outbox retention sweep ───────────────────────────────────────
    {
        let processor = state.processor.clone();
        let every = state.config.queue.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                processor.sweep();
            }
        });
    }

    // ── Scheduler tick ───────────────────────────────────────────────
    if state.config.scheduler.enabled {
        let scheduler = state.scheduler.clone();
        let every = state.config.scheduler.tick();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                for (job, result) in scheduler.tick(chrono::Utc::now()) {
                    if let Err(e) = result {
                        tracing::warn!(job = %job, error = %e, "scheduled trigger not dispatched");
                    }
                }
            }
        });
    } else {
        tracing::info!("scheduler disabled, jobs run only when triggered manually");
    }

    tracing::info!("background tasks spawned");
}
