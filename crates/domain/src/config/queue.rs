use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Capture outbox processing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Seconds between processor cycles.
    #[serde(default = "d_30")]
    pub interval_secs: u64,
    /// Maximum captures attempted per cycle.
    #[serde(default = "d_10")]
    pub batch_size: usize,
    #[serde(default = "d_5000")]
    pub item_timeout_ms: u64,
    /// Pause between items inside one cycle.
    #[serde(default = "d_250")]
    pub item_delay_ms: u64,
    /// Attempts before a capture is marked failed for good.
    #[serde(default = "d_5")]
    pub max_retries: u32,
    #[serde(default = "d_24")]
    pub sent_retention_hours: u64,
    #[serde(default = "d_168")]
    pub failed_retention_hours: u64,
    #[serde(default = "d_3600")]
    pub sweep_interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            batch_size: 10,
            item_timeout_ms: 5000,
            item_delay_ms: 250,
            max_retries: 5,
            sent_retention_hours: 24,
            failed_retention_hours: 168,
            sweep_interval_secs: 3600,
        }
    }
}

impl QueueConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn sent_retention(&self) -> Duration {
        Duration::from_secs(self.sent_retention_hours * 3600)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_hours * 3600)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn d_5() -> u32 {
    5
}
fn d_10() -> usize {
    10
}
fn d_24() -> u64 {
    24
}
fn d_30() -> u64 {
    30
}
fn d_168() -> u64 {
    168
}
fn d_250() -> u64 {
    250
}
fn d_3600() -> u64 {
    3600
}
fn d_5000() -> u64 {
    5000
}
