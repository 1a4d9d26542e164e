//! Detection of replies that are leaked tool or shell output.

use regex::RegexSet;
use tt_domain::config::GarbageConfig;
use tt_domain::error::{Error, Result};
use tt_domain::trace::TraceEvent;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GarbageVerdict {
    pub total_lines: usize,
    pub artifact_lines: usize,
    pub is_garbage: bool,
}

#[derive(Debug, Clone)]
pub struct GarbageFilter {
    patterns: RegexSet,
    min_ratio: f64,
}

impl GarbageFilter {
    pub fn new(patterns: &[String], min_ratio: f64) -> Result<Self> {
        let patterns = RegexSet::new(patterns)
            .map_err(|e| Error::Config(format!("invalid garbage pattern: {e}")))?;
        Ok(Self {
            patterns,
            min_ratio: min_ratio.clamp(0.0, 1.0),
        })
    }

    pub fn from_config(cfg: &GarbageConfig) -> Result<Self> {
        Self::new(&cfg.patterns, cfg.min_artifact_ratio)
    }

    /// An empty reply is garbage. Otherwise the reply is garbage when at
    /// least `min_ratio` of its non-blank lines match an artifact pattern.
    pub fn assess(&self, text: &str) -> GarbageVerdict {
        let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
        let artifact_lines = lines.iter().filter(|l| self.patterns.is_match(l)).count();
        let is_garbage = lines.is_empty()
            || (artifact_lines > 0
                && artifact_lines as f64 / lines.len() as f64 >= self.min_ratio);
        GarbageVerdict {
            total_lines: lines.len(),
            artifact_lines,
            is_garbage,
        }
    }

    /// `Err(GarbageResponse)` when the reply must not be delivered.
    pub fn check(&self, label: &str, text: &str) -> Result<()> {
        let verdict = self.assess(text);
        if !verdict.is_garbage {
            return Ok(());
        }
        tracing::warn!(
            label = %label,
            lines = verdict.total_lines,
            artifact_lines = verdict.artifact_lines,
            "suppressing reply that looks like tool output"
        );
        TraceEvent::GarbageSuppressed {
            label: label.to_owned(),
            chars: text.chars().count(),
            artifact_lines: verdict.artifact_lines,
        }
        .emit();
        Err(Error::GarbageResponse(format!(
            "{} of {} lines look like tool output",
            verdict.artifact_lines, verdict.total_lines
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> GarbageFilter {
        GarbageFilter::from_config(&GarbageConfig::default()).unwrap()
    }

    #[test]
    fn prose_passes() {
        let f = filter();
        assert!(f.check("chat", "Sure! Your next meeting is at 3pm.\nWant a reminder?").is_ok());
    }

    #[test]
    fn tool_dump_is_suppressed() {
        let f = filter();
        let text = "⏺ Bash(ls -la)\n  ⎿ total 48\n  ⎿ drwxr-xr-x  5 user\n$ cat notes.md";
        let err = f.check("chat", text).unwrap_err();
        assert!(matches!(err, Error::GarbageResponse(_)));
    }

    #[test]
    fn a_few_artifacts_inside_prose_are_tolerated() {
        let f = filter();
        let text = "I checked your notes.\n⎿ read 3 files\nYou have two open tasks.\nBoth are due Friday.";
        let v = f.assess(text);
        assert_eq!(v.artifact_lines, 1);
        assert!(!v.is_garbage);
    }

    #[test]
    fn empty_reply_is_garbage() {
        assert!(filter().assess("  \n\n").is_garbage);
    }
}
