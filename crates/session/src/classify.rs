//! Screen classification over a replaceable marker table.
//!
//! Only the last `tail_lines` non-blank lines are inspected, so a spinner
//! glyph or prompt that scrolled up into history never affects the result.

use regex::RegexSet;
use tt_domain::config::StabilizerConfig;
use tt_domain::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenClass {
    /// A working indicator is visible near the bottom.
    Thinking,
    /// No working indicator and an idle prompt is visible.
    Idle,
    /// Neither: output is still arriving or the UI is in an unknown state.
    Busy,
}

#[derive(Debug, Clone)]
pub struct MarkerTable {
    thinking: RegexSet,
    idle: RegexSet,
    tail_lines: usize,
}

impl MarkerTable {
    pub fn new(thinking: &[String], idle: &[String], tail_lines: usize) -> Result<Self> {
        let thinking = RegexSet::new(thinking)
            .map_err(|e| Error::Config(format!("invalid thinking marker: {e}")))?;
        let idle =
            RegexSet::new(idle).map_err(|e| Error::Config(format!("invalid idle marker: {e}")))?;
        Ok(Self {
            thinking,
            idle,
            tail_lines: tail_lines.max(1),
        })
    }

    pub fn from_config(cfg: &StabilizerConfig) -> Result<Self> {
        Self::new(&cfg.markers.thinking, &cfg.markers.idle, cfg.tail_lines)
    }

    /// The last `tail_lines` non-blank lines, top to bottom.
    pub fn tail<'a>(&self, screen: &'a str) -> Vec<&'a str> {
        let mut tail: Vec<&str> = screen
            .lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(self.tail_lines)
            .collect();
        tail.reverse();
        tail
    }

    pub fn is_thinking_line(&self, line: &str) -> bool {
        self.thinking.is_match(line)
    }

    pub fn is_idle_line(&self, line: &str) -> bool {
        self.idle.is_match(line)
    }

    pub fn classify(&self, screen: &str) -> ScreenClass {
        let tail = self.tail(screen);
        if tail.iter().any(|l| self.is_thinking_line(l)) {
            ScreenClass::Thinking
        } else if tail.iter().any(|l| self.is_idle_line(l)) {
            ScreenClass::Idle
        } else {
            ScreenClass::Busy
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(tail: usize) -> MarkerTable {
        MarkerTable::new(
            &[r"(?i)working\.\.\.".into(), r"[⠋⠙⠹]".into()],
            &[r"^\s*>\s*$".into()],
            tail,
        )
        .unwrap()
    }

    #[test]
    fn thinking_wins_over_idle() {
        let t = table(4);
        assert_eq!(t.classify("hello\n⠙ Working...\n>\n"), ScreenClass::Thinking);
    }

    #[test]
    fn idle_prompt_at_bottom() {
        let t = table(4);
        assert_eq!(t.classify("answer text\n\n> \n\n\n"), ScreenClass::Idle);
    }

    #[test]
    fn markers_above_the_tail_are_ignored() {
        let t = table(2);
        let screen = "Working...\nline a\nline b\nline c\n>";
        assert_eq!(t.classify(screen), ScreenClass::Idle);
        let screen = ">\nline a\nline b\nline c";
        assert_eq!(t.classify(screen), ScreenClass::Busy);
    }

    #[test]
    fn defaults_recognize_a_prompt() {
        let t = MarkerTable::from_config(&StabilizerConfig::default()).unwrap();
        assert_eq!(t.classify("⏺ Done.\n\n❯ \n"), ScreenClass::Idle);
        assert_eq!(
            t.classify("⏺ Reading files\n✻ Pondering… (esc to interrupt)\n❯ \n"),
            ScreenClass::Thinking
        );
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = MarkerTable::new(&["(".into()], &[], 4).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
