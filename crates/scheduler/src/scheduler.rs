//! Job scheduler with overlap prevention.
//!
//! At most one job body runs at a time system-wide. A job triggered while
//! another runs is appended to a bounded FIFO; overflow is dropped with a
//! warning. When the running job finishes the next queued job starts at
//! once, without waiting for a new trigger. Every execution is bounded by
//! a hard timeout that the executor enforces once it holds the session,
//! so time spent waiting behind a live chat turn is never counted and a
//! timeout never interrupts someone else's turn. The scheduler keeps a
//! looser backstop for executors that fail to honor it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tt_domain::config::{JobConfig, SchedulerConfig};
use tt_domain::error::{Error, Result};
use tt_domain::trace::TraceEvent;

use crate::cron::parse_tz;
use crate::dsl::{parse_trigger, Trigger};
use crate::quiet::QuietHours;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Executor seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Runs one job body. Implemented by the gateway on top of the session.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    /// Run the job to completion and return its output.
    ///
    /// `timeout` bounds the body once the executor holds the resource it
    /// runs on. On expiry the executor cancels the work while still
    /// holding it and returns `Error::ResponseTimeout`.
    async fn execute(&self, job: &JobConfig, timeout: Duration) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Schedule,
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Manual => "manual",
        }
    }
}

/// What happened to a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Dispatch {
    Started,
    Queued { position: usize },
    /// The same job is already running or waiting.
    AlreadyPending,
    SkippedQuietHours,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentJob {
    pub name: String,
    pub elapsed_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub current_job: Option<CurrentJob>,
    pub queue_depth: usize,
    pub queued: Vec<String>,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
    pub skipped_quiet: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub name: String,
    pub trigger: String,
    pub channel: String,
    pub enabled: bool,
    pub exempt_quiet_hours: bool,
    pub next_run: Option<DateTime<Utc>>,
}

struct ScheduledJob {
    config: JobConfig,
    trigger: Trigger,
    next_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ExecState {
    current: Option<(String, Instant)>,
    queue: VecDeque<JobConfig>,
    stats: SchedulerStats,
}

struct Shared {
    executor: Arc<dyn JobExecutor>,
    cfg: SchedulerConfig,
    tz: chrono_tz::Tz,
    quiet: Option<QuietHours>,
    jobs: Mutex<Vec<ScheduledJob>>,
    exec: Mutex<ExecState>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct JobScheduler {
    shared: Arc<Shared>,
}

impl JobScheduler {
    /// Compile every job's trigger. Any invalid trigger or quiet-hours
    /// window is a config error.
    pub fn new(
        cfg: SchedulerConfig,
        jobs: &[JobConfig],
        executor: Arc<dyn JobExecutor>,
    ) -> Result<Self> {
        let quiet = cfg
            .quiet_hours
            .as_ref()
            .map(QuietHours::from_config)
            .transpose()?;
        let jobs = jobs
            .iter()
            .map(|job| {
                let trigger = parse_trigger(&job.trigger)
                    .map_err(|e| Error::Config(format!("job '{}': {e}", job.name)))?;
                Ok(ScheduledJob {
                    config: job.clone(),
                    trigger,
                    next_run: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            shared: Arc::new(Shared {
                executor,
                tz: parse_tz(&cfg.timezone),
                quiet,
                cfg,
                jobs: Mutex::new(jobs),
                exec: Mutex::new(ExecState::default()),
            }),
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let exec = self.shared.exec.lock();
        let mut stats = exec.stats.clone();
        stats.current_job = exec.current.as_ref().map(|(name, since)| CurrentJob {
            name: name.clone(),
            elapsed_secs: since.elapsed().as_secs(),
        });
        stats.queue_depth = exec.queue.len();
        stats.queued = exec.queue.iter().map(|j| j.name.clone()).collect();
        stats
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        self.shared
            .jobs
            .lock()
            .iter()
            .map(|j| JobInfo {
                name: j.config.name.clone(),
                trigger: j.config.trigger.clone(),
                channel: j.config.channel.clone(),
                enabled: j.config.enabled,
                exempt_quiet_hours: j.config.exempt_quiet_hours,
                next_run: j.next_run,
            })
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        let exec = self.shared.exec.lock();
        exec.current.is_none() && exec.queue.is_empty()
    }

    /// Fire every enabled job whose next run is due, then reschedule it.
    /// A job seen for the first time is only scheduled, not fired.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<(String, Result<Dispatch>)> {
        let due: Vec<JobConfig> = {
            let mut jobs = self.shared.jobs.lock();
            let mut due = Vec::new();
            for job in jobs.iter_mut().filter(|j| j.config.enabled) {
                match job.next_run {
                    Some(at) if at <= now => due.push(job.config.clone()),
                    Some(_) => continue,
                    None => {}
                }
                job.next_run = job.trigger.next_after(&now, self.shared.tz);
                if job.next_run.is_none() {
                    tracing::warn!(job = %job.config.name, "trigger never fires again");
                }
            }
            due
        };

        due.into_iter()
            .map(|job| {
                let name = job.name.clone();
                let quiet = self
                    .shared
                    .quiet
                    .is_some_and(|q| q.contains_instant(&now, self.shared.tz));
                if quiet && !job.exempt_quiet_hours {
                    tracing::debug!(job = %name, "quiet hours, skipping job");
                    self.shared.exec.lock().stats.skipped_quiet += 1;
                    return (name, Ok(Dispatch::SkippedQuietHours));
                }
                let result = self.trigger(job, TriggerSource::Schedule);
                (name, result)
            })
            .collect()
    }

    /// Run a configured job now, regardless of its schedule, enabled flag
    /// or quiet hours.
    pub fn trigger_by_name(&self, name: &str) -> Result<Dispatch> {
        let job = self
            .shared
            .jobs
            .lock()
            .iter()
            .find(|j| j.config.name.eq_ignore_ascii_case(name))
            .map(|j| j.config.clone())
            .ok_or_else(|| Error::Other(format!("unknown job '{name}'")))?;
        self.trigger(job, TriggerSource::Manual)
    }

    /// Start `job` now if nothing is running, otherwise queue it.
    /// Fails with `QueueFull` when the queue is at capacity.
    pub fn trigger(&self, job: JobConfig, source: TriggerSource) -> Result<Dispatch> {
        TraceEvent::JobTriggered {
            job: job.name.clone(),
            source: source.as_str().into(),
        }
        .emit();

        let mut exec = self.shared.exec.lock();
        let pending = exec.current.as_ref().is_some_and(|(n, _)| *n == job.name)
            || exec.queue.iter().any(|q| q.name == job.name);
        if pending {
            tracing::debug!(job = %job.name, "job already running or queued");
            return Ok(Dispatch::AlreadyPending);
        }

        if exec.current.is_none() {
            exec.current = Some((job.name.clone(), Instant::now()));
            drop(exec);
            tokio::spawn(run_chain(self.shared.clone(), job));
            return Ok(Dispatch::Started);
        }

        if exec.queue.len() >= self.shared.cfg.queue_capacity {
            exec.stats.dropped += 1;
            let running = exec
                .current
                .as_ref()
                .map(|(n, _)| n.clone())
                .unwrap_or_default();
            drop(exec);
            tracing::warn!(
                job = %job.name,
                running = %running,
                capacity = self.shared.cfg.queue_capacity,
                "job queue full, dropping job"
            );
            TraceEvent::JobDropped {
                job: job.name.clone(),
                reason: "queue_full".into(),
            }
            .emit();
            return Err(Error::QueueFull(format!(
                "'{}' dropped: {} job(s) already waiting behind '{running}'",
                job.name, self.shared.cfg.queue_capacity
            )));
        }

        exec.queue.push_back(job.clone());
        let position = exec.queue.len();
        drop(exec);
        tracing::info!(job = %job.name, position, "job queued behind running job");
        TraceEvent::JobQueued {
            job: job.name,
            queue_depth: position,
        }
        .emit();
        Ok(Dispatch::Queued { position })
    }

    /// Wait until nothing is running or queued, or `timeout` passes.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_idle() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.is_idle()
    }
}

// ── execution ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Error,
    TimedOut,
    Panicked,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Panicked => "panicked",
        }
    }
}

/// Run `first`, then keep draining the queue. The hand-off to the next
/// job happens under the same lock that `trigger` checks, so a job is
/// never both queued and skipped.
async fn run_chain(shared: Arc<Shared>, first: JobConfig) {
    let mut next = Some(first);
    while let Some(job) = next {
        let outcome = run_one(&shared, &job).await;

        next = {
            let mut exec = shared.exec.lock();
            match outcome {
                Outcome::Ok => exec.stats.completed += 1,
                Outcome::TimedOut => exec.stats.timed_out += 1,
                Outcome::Error | Outcome::Panicked => exec.stats.failed += 1,
            }
            let next = exec.queue.pop_front();
            exec.current = next.as_ref().map(|j| (j.name.clone(), Instant::now()));
            next
        };

        if let Some(ref j) = next {
            tracing::info!(job = %j.name, "starting queued job");
        }
    }
}

async fn run_one(shared: &Arc<Shared>, job: &JobConfig) -> Outcome {
    let timeout = job
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| shared.cfg.job_timeout());
    let backstop = timeout + shared.cfg.start_grace();
    let start = Instant::now();
    tracing::info!(job = %job.name, timeout_secs = timeout.as_secs(), "job started");

    // A separate task so a panicking executor cannot wedge the chain.
    let handle = {
        let executor = shared.executor.clone();
        let job = job.clone();
        tokio::spawn(async move { executor.execute(&job, timeout).await })
    };
    let abort = handle.abort_handle();

    let outcome = match tokio::time::timeout(backstop, handle).await {
        Ok(Ok(Ok(output))) => {
            tracing::info!(job = %job.name, output_chars = output.chars().count(), "job finished");
            Outcome::Ok
        }
        Ok(Ok(Err(Error::ResponseTimeout(e)))) => {
            tracing::warn!(job = %job.name, timeout_secs = timeout.as_secs(), error = %e, "job timed out");
            Outcome::TimedOut
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(job = %job.name, error = %e, "job failed");
            Outcome::Error
        }
        Ok(Err(e)) => {
            tracing::error!(job = %job.name, error = %e, "job panicked");
            Outcome::Panicked
        }
        Err(_) => {
            // The executor ignored its deadline. Dropping the task releases
            // whatever it holds; the session is left to its next holder.
            abort.abort();
            tracing::error!(
                job = %job.name,
                backstop_secs = backstop.as_secs(),
                "job outlived its backstop, aborting"
            );
            Outcome::TimedOut
        }
    };

    TraceEvent::JobFinished {
        job: job.name.clone(),
        outcome: outcome.as_str().into(),
        duration_ms: start.elapsed().as_millis() as u64,
    }
    .emit();
    outcome
}
