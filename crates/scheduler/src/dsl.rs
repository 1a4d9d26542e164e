//! Schedule DSL.
//!
//! ```text
//! every 30m | every 2h | every 45s | every 1d
//! hourly
//! daily at 07:30          (also: daily 07:30)
//! weekdays at 08:00
//! weekends at 10:00
//! weekly on mon at 09:00
//! cron: 0 7 * * 1-5       (or a bare 5-field expression)
//! ```

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use tt_domain::error::{Error, Result};

use crate::cron::CronExpr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    Interval(Duration),
    Cron(CronExpr),
}

impl Trigger {
    pub fn next_after(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        match self {
            Self::Interval(every) => {
                let step = chrono::Duration::from_std(*every).ok()?;
                after.checked_add_signed(step)
            }
            Self::Cron(expr) => expr.next_after(after, tz),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval(d) => write!(f, "every {}s", d.as_secs()),
            Self::Cron(expr) => write!(f, "cron {expr}"),
        }
    }
}

fn every_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^every\s+(\d+)\s*(s|secs?|seconds?|m|mins?|minutes?|h|hrs?|hours?|d|days?)$",
        )
        .expect("valid trigger regex")
    })
}

fn at_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(daily|weekdays|weekends|weekly\s+on\s+([a-z]+))(?:\s+at)?\s+(\d{1,2}):(\d{2})$")
            .expect("valid trigger regex")
    })
}

fn day_of_week(name: &str) -> Option<u32> {
    let day = match name.get(..3)? {
        "sun" => 0,
        "mon" => 1,
        "tue" => 2,
        "wed" => 3,
        "thu" => 4,
        "fri" => 5,
        "sat" => 6,
        _ => return None,
    };
    Some(day)
}

/// `None` when the interval does not fit a `chrono::Duration`.
fn interval(n: u64, unit: &str) -> Option<Duration> {
    let scale = match unit.as_bytes().first() {
        Some(b'm') => 60,
        Some(b'h') => 3600,
        Some(b'd') => 86_400,
        _ => 1,
    };
    let every = Duration::from_secs(n.checked_mul(scale)?);
    chrono::Duration::from_std(every).ok()?;
    Some(every)
}

/// Compile a trigger string. Matching is case-insensitive.
pub fn parse_trigger(spec: &str) -> Result<Trigger> {
    let raw = spec.trim();
    let s = raw.to_lowercase();
    let s = s.split_whitespace().collect::<Vec<_>>().join(" ");
    let invalid = |why: &str| Error::Config(format!("invalid trigger '{raw}': {why}"));

    if s.is_empty() {
        return Err(invalid("empty"));
    }

    if let Some(c) = every_re().captures(&s) {
        let n: u64 = c[1].parse().map_err(|_| invalid("bad number"))?;
        if n == 0 {
            return Err(invalid("interval must be positive"));
        }
        return interval(n, &c[2])
            .map(Trigger::Interval)
            .ok_or_else(|| invalid("interval too large"));
    }

    if s == "hourly" {
        return Ok(Trigger::Cron(CronExpr::parse("0 * * * *")?));
    }

    if let Some(c) = at_re().captures(&s) {
        let hour: u32 = c[3].parse().map_err(|_| invalid("bad hour"))?;
        let minute: u32 = c[4].parse().map_err(|_| invalid("bad minute"))?;
        if hour > 23 || minute > 59 {
            return Err(invalid("time out of range"));
        }
        let dow = match &c[1] {
            "daily" => "*".to_owned(),
            "weekdays" => "1-5".to_owned(),
            "weekends" => "0,6".to_owned(),
            _ => {
                let day = c.get(2).map(|m| m.as_str()).unwrap_or_default();
                day_of_week(day)
                    .ok_or_else(|| invalid("unknown day of week"))?
                    .to_string()
            }
        };
        return Ok(Trigger::Cron(CronExpr::parse(&format!(
            "{minute} {hour} * * {dow}"
        ))?));
    }

    let expr = s.strip_prefix("cron:").map(str::trim).unwrap_or(&s);
    if expr.split_whitespace().count() == 5 {
        return Ok(Trigger::Cron(CronExpr::parse(expr)?));
    }

    Err(invalid("expected 'every <n><s|m|h|d>', 'hourly', 'daily at HH:MM', 'weekdays at HH:MM', 'weekends at HH:MM', 'weekly on <day> at HH:MM' or a cron expression"))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn cron(spec: &str) -> String {
        match parse_trigger(spec).unwrap() {
            Trigger::Cron(c) => c.as_str().to_owned(),
            other => panic!("expected cron, got {other:?}"),
        }
    }

    #[test]
    fn intervals() {
        assert_eq!(
            parse_trigger("every 30m").unwrap(),
            Trigger::Interval(Duration::from_secs(1800))
        );
        assert_eq!(
            parse_trigger("Every 2 hours").unwrap(),
            Trigger::Interval(Duration::from_secs(7200))
        );
        assert_eq!(
            parse_trigger("every 45s").unwrap(),
            Trigger::Interval(Duration::from_secs(45))
        );
        assert_eq!(
            parse_trigger("every 1d").unwrap(),
            Trigger::Interval(Duration::from_secs(86_400))
        );
        assert!(parse_trigger("every 0m").is_err());
    }

    #[test]
    fn calendar_shorthands() {
        assert_eq!(cron("hourly"), "0 * * * *");
        assert_eq!(cron("daily at 07:30"), "30 7 * * *");
        assert_eq!(cron("daily 7:05"), "5 7 * * *");
        assert_eq!(cron("weekdays at 08:00"), "0 8 * * 1-5");
        assert_eq!(cron("weekends at 10:15"), "15 10 * * 0,6");
        assert_eq!(cron("weekly on Monday at 09:00"), "0 9 * * 1");
        assert_eq!(cron("weekly on fri 17:45"), "45 17 * * 5");
    }

    #[test]
    fn cron_passthrough() {
        assert_eq!(cron("cron: 0 7 * * 1-5"), "0 7 * * 1-5");
        assert_eq!(cron("*/10 * * * *"), "*/10 * * * *");
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "sometimes", "daily at 25:00", "weekly on funday at 09:00", "cron: 1 2 3"] {
            assert!(parse_trigger(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn oversized_intervals_are_rejected() {
        for bad in ["every 99999999999999d", "every 18446744073709551615s"] {
            assert!(parse_trigger(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn interval_past_the_calendar_never_fires() {
        let t = Trigger::Interval(Duration::from_secs(86_400 * 365 * 300_000));
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert_eq!(t.next_after(&now, chrono_tz::UTC), None);
    }

    #[test]
    fn interval_next_run() {
        let t = parse_trigger("every 15m").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        assert_eq!(
            t.next_after(&now, chrono_tz::UTC),
            Some(Utc.with_ymd_and_hms(2024, 6, 15, 10, 15, 0).unwrap())
        );
    }
}
