use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// How often due jobs are checked.
    #[serde(default = "d_15")]
    pub tick_secs: u64,
    /// Bound on jobs waiting behind the running one.
    #[serde(default = "d_5")]
    pub queue_capacity: usize,
    /// Default hard timeout for one job execution, counted once the job
    /// holds the session.
    #[serde(default = "d_1200")]
    pub job_timeout_secs: u64,
    /// Extra time a job may spend waiting for the session before the
    /// scheduler gives up on it regardless of its own deadline.
    #[serde(default = "d_600")]
    pub start_grace_secs: u64,
    /// IANA timezone used for cron evaluation and quiet hours.
    #[serde(default = "d_tz")]
    pub timezone: String,
    #[serde(default)]
    pub quiet_hours: Option<QuietHoursConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_secs: 15,
            queue_capacity: 5,
            job_timeout_secs: 1200,
            start_grace_secs: 600,
            timezone: d_tz(),
            quiet_hours: None,
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn start_grace(&self) -> Duration {
        Duration::from_secs(self.start_grace_secs)
    }
}

/// Global do-not-disturb window in local time. `start > end` wraps
/// past midnight (e.g. 22:00 to 07:00).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuietHoursConfig {
    pub start: String,
    pub end: String,
}

impl QuietHoursConfig {
    pub fn start_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.start, "%H:%M").ok()
    }

    pub fn end_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.end, "%H:%M").ok()
    }
}

// ── Jobs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    /// Skill the agent is asked to run. Used to build the prompt when
    /// `prompt` is absent.
    #[serde(default)]
    pub skill: String,
    /// Schedule DSL or cron expression.
    pub trigger: String,
    /// Logical channel the output belongs to.
    #[serde(default = "d_channel")]
    pub channel: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub exempt_quiet_hours: bool,
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Overrides `scheduler.job_timeout_secs` for this job.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl JobConfig {
    /// The text sent to the agent for this job.
    pub fn render_prompt(&self) -> String {
        match &self.prompt {
            Some(p) => p.clone(),
            None => format!("/{}", self.skill.trim_start_matches('/')),
        }
    }
}

fn d_true() -> bool {
    true
}
fn d_5() -> usize {
    5
}
fn d_15() -> u64 {
    15
}
fn d_600() -> u64 {
    600
}
fn d_1200() -> u64 {
    1200
}
fn d_tz() -> String {
    "UTC".into()
}
fn d_channel() -> String {
    "scheduled".into()
}
