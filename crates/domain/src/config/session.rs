use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The single long-lived terminal session hosting the agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Terminal session name (tmux session name).
    #[serde(default = "d_session_name")]
    pub name: String,
    #[serde(default = "d_working_dir")]
    pub working_dir: PathBuf,
    /// Command launched inside a freshly created session.
    #[serde(default = "d_agent_command")]
    pub agent_command: String,
    /// Scrollback lines captured per screen snapshot.
    #[serde(default = "d_500")]
    pub capture_lines: u32,
    /// Input sent to the agent when the serving channel changes.
    #[serde(default = "d_reset_command")]
    pub reset_command: String,
    #[serde(default = "d_10000")]
    pub reset_timeout_ms: u64,
    /// Upper bound on waiting for the arbiter.
    #[serde(default = "d_600")]
    pub acquire_timeout_secs: u64,
    /// Hard cap on one full turn (acquire, send, stabilize).
    #[serde(default = "d_900")]
    pub turn_timeout_secs: u64,
    #[serde(default)]
    pub stabilizer: StabilizerConfig,
    #[serde(default)]
    pub garbage: GarbageConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: d_session_name(),
            working_dir: d_working_dir(),
            agent_command: d_agent_command(),
            capture_lines: 500,
            reset_command: d_reset_command(),
            reset_timeout_ms: 10_000,
            acquire_timeout_secs: 600,
            turn_timeout_secs: 900,
            stabilizer: StabilizerConfig::default(),
            garbage: GarbageConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }
}

// ── Stabilizer ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StabilizerConfig {
    #[serde(default = "d_750")]
    pub poll_interval_ms: u64,
    /// Consecutive identical idle polls before output is final.
    #[serde(default = "d_3")]
    pub stable_threshold: u32,
    #[serde(default = "d_600")]
    pub total_timeout_secs: u64,
    /// Number of trailing non-blank lines the classifier looks at.
    #[serde(default = "d_8")]
    pub tail_lines: usize,
    /// Window during which an unchanged screen is not treated as idle.
    #[serde(default = "d_3000")]
    pub startup_grace_ms: u64,
    #[serde(default = "d_45")]
    pub interim_grace_secs: u64,
    #[serde(default = "d_120")]
    pub interim_interval_secs: u64,
    #[serde(default)]
    pub markers: MarkerConfig,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 750,
            stable_threshold: 3,
            total_timeout_secs: 600,
            tail_lines: 8,
            startup_grace_ms: 3000,
            interim_grace_secs: 45,
            interim_interval_secs: 120,
            markers: MarkerConfig::default(),
        }
    }
}

impl StabilizerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn interim_grace(&self) -> Duration {
        Duration::from_secs(self.interim_grace_secs)
    }

    pub fn interim_interval(&self) -> Duration {
        Duration::from_secs(self.interim_interval_secs)
    }
}

/// Regex table used to classify the tail of the screen.
///
/// These are heuristics for one particular agent UI. Replace them
/// wholesale in config when driving a different agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerConfig {
    #[serde(default = "d_thinking_markers")]
    pub thinking: Vec<String>,
    #[serde(default = "d_idle_markers")]
    pub idle: Vec<String>,
}

impl Default for MarkerConfig {
    fn default() -> Self {
        Self {
            thinking: d_thinking_markers(),
            idle: d_idle_markers(),
        }
    }
}

// ── Garbage filter ──────────────────────────────────────────────────

/// Detects replies that are leaked tool or shell output rather than prose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GarbageConfig {
    #[serde(default = "d_garbage_patterns")]
    pub patterns: Vec<String>,
    /// Share of non-blank lines that must match before a reply is suppressed.
    #[serde(default = "d_ratio")]
    pub min_artifact_ratio: f64,
}

impl Default for GarbageConfig {
    fn default() -> Self {
        Self {
            patterns: d_garbage_patterns(),
            min_artifact_ratio: d_ratio(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_session_name() -> String {
    "tether-agent".into()
}
fn d_working_dir() -> PathBuf {
    PathBuf::from(".")
}
fn d_agent_command() -> String {
    "claude".into()
}
fn d_reset_command() -> String {
    "/clear".into()
}
fn d_3() -> u32 {
    3
}
fn d_8() -> usize {
    8
}
fn d_45() -> u64 {
    45
}
fn d_120() -> u64 {
    120
}
fn d_500() -> u32 {
    500
}
fn d_600() -> u64 {
    600
}
fn d_750() -> u64 {
    750
}
fn d_900() -> u64 {
    900
}
fn d_3000() -> u64 {
    3000
}
fn d_10000() -> u64 {
    10_000
}
fn d_ratio() -> f64 {
    0.6
}
fn d_thinking_markers() -> Vec<String> {
    vec![
        r"[⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏]".into(),
        r"^\s*[✻✶✳✢✽·*]\s+\w+…".into(),
        r"(?i)esc to interrupt".into(),
        r"(?i)\b(thinking|working|processing)\.\.\.".into(),
    ]
}
fn d_idle_markers() -> Vec<String> {
    vec![
        r"^\s*[❯>]\s*$".into(),
        r"^\s*│\s*>\s*│?\s*$".into(),
        r"(?i)\?\s+for shortcuts".into(),
    ]
}
fn d_garbage_patterns() -> Vec<String> {
    vec![
        r"^\s*⏺\s*(Bash|Read|Write|Edit|Update|Grep|Glob|Task|WebFetch|Search)\(".into(),
        r"^\s*⎿".into(),
        r"^\s*\$ \S".into(),
        r"(?i)^\s*</?(function_calls|invoke|parameter|tool_use|tool_result)\b".into(),
        r"^\s*(Running|Reading|Searching|Listed)\b.*…".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_uses_defaults() {
        let cfg: SessionConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.name, "tether-agent");
        assert_eq!(cfg.reset_command, "/clear");
        assert_eq!(cfg.stabilizer.stable_threshold, 3);
        assert!(cfg.stabilizer.poll_interval() < Duration::from_secs(1));
        assert!(!cfg.stabilizer.markers.idle.is_empty());
        assert!((cfg.garbage.min_artifact_ratio - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn marker_table_replaces_defaults_wholesale() {
        let toml_str = r#"
            [stabilizer.markers]
            idle = ["^READY$"]
        "#;
        let cfg: SessionConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.stabilizer.markers.idle, vec!["^READY$"]);
        // thinking keeps its defaults when omitted
        assert!(!cfg.stabilizer.markers.thinking.is_empty());
    }

    #[test]
    fn default_patterns_compile() {
        let cfg = SessionConfig::default();
        for p in cfg
            .stabilizer
            .markers
            .thinking
            .iter()
            .chain(&cfg.stabilizer.markers.idle)
            .chain(&cfg.garbage.patterns)
        {
            assert!(regex::Regex::new(p).is_ok(), "pattern {p:?} should compile");
        }
    }
}
