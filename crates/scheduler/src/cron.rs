//! Timezone-aware 5-field cron expressions (min hour dom month dow).
//!
//! Fields accept `*`, `N`, `A-B`, `*/S`, `A-B/S`, `N/S` and comma lists.
//! Day-of-week is 0-7 with both 0 and 7 meaning Sunday. When both
//! day-of-month and day-of-week are restricted, either may match.

use std::fmt;

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};
use tt_domain::error::{Error, Result};

/// Parse an IANA timezone name, falling back to UTC.
pub fn parse_tz(tz: &str) -> chrono_tz::Tz {
    tz.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn parse_field(field: &str, name: &str, min: u32, max: u32) -> Result<u64> {
    let bad = |why: &str| Error::Config(format!("cron {name} field '{field}': {why}"));
    let num = |s: &str| s.parse::<u32>().map_err(|_| bad("not a number"));

    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => (r, Some(num(s)?)),
            None => (part, None),
        };
        let step = step.unwrap_or(1);
        if step == 0 {
            return Err(bad("step must be positive"));
        }
        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (num(a)?, num(b)?)
        } else {
            let n = num(range)?;
            // `N/S` means "from N every S".
            (n, if part.contains('/') { max } else { n })
        };
        if lo < min || hi > max || lo > hi {
            return Err(bad(&format!("out of range {min}-{max}")));
        }
        for v in (lo..=hi).step_by(step as usize) {
            bits |= 1 << v;
        }
    }
    Ok(bits)
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Config(format!(
                "cron expression '{expr}' must have 5 fields, found {}",
                fields.len()
            )));
        }
        let mut days_of_week = parse_field(fields[4], "day-of-week", 0, 7)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }
        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], "minute", 0, 59)?,
            hours: parse_field(fields[1], "hour", 0, 23)?,
            days_of_month: parse_field(fields[2], "day-of-month", 1, 31)?,
            months: parse_field(fields[3], "month", 1, 12)?,
            days_of_week,
            dom_restricted: fields[2] != "*",
            dow_restricted: fields[4] != "*",
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether a local wall-clock minute matches.
    pub fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        let bit = |mask: u64, v: u32| mask & (1 << v) != 0;
        if !bit(self.minutes, dt.minute())
            || !bit(self.hours, dt.hour())
            || !bit(self.months, dt.month())
        {
            return false;
        }
        let dom = bit(self.days_of_month, dt.day());
        let dow = bit(self.days_of_week, dt.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// Next matching instant strictly after `after`, evaluated in `tz`.
    ///
    /// Local minutes that fall in a spring-forward gap are skipped. In a
    /// fall-back overlap the earlier instant is chosen.
    pub fn next_after(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&tz).naive_local();
        let mut candidate = local + chrono::Duration::seconds(60 - i64::from(local.second()));
        candidate = candidate.with_second(0)?.with_nanosecond(0)?;

        // One leap year of minutes bounds the search.
        for _ in 0..366 * 24 * 60 {
            if self.matches_local(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc))
                    }
                    chrono::LocalResult::None => {}
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
