mod memory;
mod observability;
mod outbound;
mod queue;
mod scheduler;
mod server;
mod session;
mod store;

pub use memory::*;
pub use observability::*;
pub use outbound::*;
pub use queue::*;
pub use scheduler::*;
pub use server::*;
pub use session::*;
pub use store::*;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub outbound: OutboundConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Static job definitions, loaded once at startup.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

fn error(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError {
        severity: ConfigSeverity::Error,
        field: field.into(),
        message: message.into(),
    }
}

fn warning(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError {
        severity: ConfigSeverity::Warning,
        field: field.into(),
        message: message.into(),
    }
}

fn check_patterns(field: &str, patterns: &[String], errors: &mut Vec<ConfigError>) {
    for (i, p) in patterns.iter().enumerate() {
        if let Err(e) = regex::Regex::new(p) {
            errors.push(error(format!("{field}[{i}]"), format!("invalid regex: {e}")));
        }
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good. Schedule trigger
    /// syntax is checked separately by the scheduler crate at boot.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(error("server.host", "host must not be empty"));
        }
        if self.server.max_concurrent_requests == 0 {
            errors.push(error(
                "server.max_concurrent_requests",
                "at least one concurrent request must be allowed",
            ));
        }
        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            errors.push(error(
                "observability.sample_rate",
                "sample rate must be within 0.0..=1.0",
            ));
        }

        // ── Session + stabilizer ──────────────────────────────────────
        if self.session.name.trim().is_empty() {
            errors.push(error("session.name", "session name must not be empty"));
        }
        if self.session.agent_command.trim().is_empty() {
            errors.push(error(
                "session.agent_command",
                "agent command must not be empty",
            ));
        }
        let stab = &self.session.stabilizer;
        if stab.poll_interval_ms == 0 {
            errors.push(error(
                "session.stabilizer.poll_interval_ms",
                "poll interval must be greater than 0",
            ));
        }
        if stab.stable_threshold == 0 {
            errors.push(error(
                "session.stabilizer.stable_threshold",
                "stable threshold must be at least 1",
            ));
        }
        if stab.tail_lines == 0 {
            errors.push(error(
                "session.stabilizer.tail_lines",
                "tail_lines must be at least 1",
            ));
        }
        if stab.total_timeout_secs >= self.session.turn_timeout_secs {
            errors.push(warning(
                "session.turn_timeout_secs",
                "turn timeout should exceed the stabilizer total timeout so partial output can be returned",
            ));
        }
        check_patterns(
            "session.stabilizer.markers.thinking",
            &stab.markers.thinking,
            &mut errors,
        );
        check_patterns(
            "session.stabilizer.markers.idle",
            &stab.markers.idle,
            &mut errors,
        );
        if stab.markers.idle.is_empty() {
            errors.push(error(
                "session.stabilizer.markers.idle",
                "at least one idle marker is required",
            ));
        }
        check_patterns(
            "session.garbage.patterns",
            &self.session.garbage.patterns,
            &mut errors,
        );
        if !(0.0..=1.0).contains(&self.session.garbage.min_artifact_ratio) {
            errors.push(error(
                "session.garbage.min_artifact_ratio",
                "ratio must be within 0.0..=1.0",
            ));
        }

        // ── Memory service, breaker, cache ───────────────────────────
        if self.memory.base_url.is_empty() {
            errors.push(error("memory.base_url", "base_url must not be empty"));
        }
        if self.breaker.failure_threshold == 0 {
            errors.push(error(
                "breaker.failure_threshold",
                "failure threshold must be at least 1",
            ));
        }
        if self.cache.capacity == 0 {
            errors.push(error("cache.capacity", "capacity must be at least 1"));
        }

        // ── Outbox ────────────────────────────────────────────────────
        if self.queue.batch_size == 0 {
            errors.push(error("queue.batch_size", "batch size must be at least 1"));
        }
        if self.queue.max_retries == 0 {
            errors.push(error("queue.max_retries", "max_retries must be at least 1"));
        }
        if self.queue.failed_retention_hours < self.queue.sent_retention_hours {
            errors.push(warning(
                "queue.failed_retention_hours",
                "failed captures are usually kept longer than sent ones",
            ));
        }

        // ── Scheduler + jobs ──────────────────────────────────────────
        if self.scheduler.queue_capacity == 0 {
            errors.push(error(
                "scheduler.queue_capacity",
                "queue capacity must be at least 1",
            ));
        }
        if let Some(ref qh) = self.scheduler.quiet_hours {
            if qh.start_time().is_none() {
                errors.push(error(
                    "scheduler.quiet_hours.start",
                    format!("expected HH:MM, got {:?}", qh.start),
                ));
            }
            if qh.end_time().is_none() {
                errors.push(error(
                    "scheduler.quiet_hours.end",
                    format!("expected HH:MM, got {:?}", qh.end),
                ));
            }
        }
        let mut seen = HashSet::new();
        for (i, job) in self.jobs.iter().enumerate() {
            if job.name.trim().is_empty() {
                errors.push(error(format!("jobs[{i}].name"), "job name must not be empty"));
            } else if !seen.insert(job.name.to_lowercase()) {
                errors.push(error(
                    format!("jobs[{i}].name"),
                    format!("duplicate job name {:?}", job.name),
                ));
            }
            if job.trigger.trim().is_empty() {
                errors.push(error(
                    format!("jobs[{i}].trigger"),
                    "trigger must not be empty",
                ));
            }
            if job.skill.trim().is_empty() && job.prompt.is_none() {
                errors.push(error(
                    format!("jobs[{i}]"),
                    "a job needs a skill or an explicit prompt",
                ));
            }
        }

        // ── Outbound ─────────────────────────────────────────────────
        if self.outbound.webhook_url.is_none() {
            errors.push(warning(
                "outbound.webhook_url",
                "no chat webhook configured; scheduled job output will only be logged",
            ));
        }
        if self.outbound.max_chunk_chars < 100 {
            errors.push(error(
                "outbound.max_chunk_chars",
                "chunk size must be at least 100 characters",
            ));
        }

        if self.server.cors.allowed_origins.len() == 1
            && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(warning(
                "server.cors.allowed_origins",
                "wildcard \"*\" allows all origins (not recommended for production)",
            ));
        }

        errors
    }
}
