use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory service connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "d_memory_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    /// Per-request HTTP timeout used by the REST client.
    #[serde(default = "d_8000")]
    pub timeout_ms: u64,
    /// Retries on transport errors and 5xx, with exponential backoff.
    #[serde(default = "d_2")]
    pub max_retries: u32,
    /// Tighter bound for context reads on the conversational path.
    #[serde(default = "d_3000")]
    pub context_timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            base_url: d_memory_url(),
            api_key: None,
            workspace_id: None,
            timeout_ms: 8000,
            max_retries: 2,
            context_timeout_ms: 3000,
        }
    }
}

impl MemoryConfig {
    pub fn context_timeout(&self) -> Duration {
        Duration::from_millis(self.context_timeout_ms)
    }
}

// ── Circuit breaker ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "d_5")]
    pub failure_threshold: u32,
    /// Time spent Open before a single probe is allowed.
    #[serde(default = "d_60")]
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

// ── Context cache ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entries younger than this are fresh; older ones are stale but usable.
    #[serde(default = "d_900")]
    pub ttl_secs: u64,
    #[serde(default = "d_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 900,
            capacity: d_capacity(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_memory_url() -> String {
    "http://localhost:5000".into()
}
fn d_2() -> u32 {
    2
}
fn d_5() -> u32 {
    5
}
fn d_60() -> u64 {
    60
}
fn d_900() -> u64 {
    900
}
fn d_3000() -> u64 {
    3000
}
fn d_8000() -> u64 {
    8000
}
fn d_capacity() -> usize {
    256
}
