//! `tt-scheduler`: scheduled jobs against the shared session.
//!
//! Triggers are written in a small DSL ([`parse_trigger`]) that compiles to
//! either a fixed interval or a timezone-aware cron expression. The
//! [`JobScheduler`] runs at most one job at a time and queues the rest in a
//! bounded FIFO.

pub mod cron;
pub mod dsl;
pub mod quiet;
pub mod scheduler;

pub use cron::{parse_tz, CronExpr};
pub use dsl::{parse_trigger, Trigger};
pub use quiet::QuietHours;
pub use scheduler::{
    CurrentJob, Dispatch, JobExecutor, JobInfo, JobScheduler, SchedulerStats, TriggerSource,
};
