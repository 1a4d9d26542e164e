use chrono::{DateTime, NaiveTime, Utc};
use tt_domain::config::QuietHoursConfig;
use tt_domain::error::{Error, Result};

/// Do-not-disturb window in local wall-clock time. The window is
/// half-open, `[start, end)`, and wraps past midnight when `start > end`.
/// `start == end` is an empty window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn from_config(cfg: &QuietHoursConfig) -> Result<Self> {
        match (cfg.start_time(), cfg.end_time()) {
            (Some(start), Some(end)) => Ok(Self::new(start, end)),
            _ => Err(Error::Config(format!(
                "quiet hours '{}'-'{}' must be HH:MM",
                cfg.start, cfg.end
            ))),
        }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }

    pub fn contains_instant(&self, now: &DateTime<Utc>, tz: chrono_tz::Tz) -> bool {
        self.contains(now.with_timezone(&tz).time())
    }
}
