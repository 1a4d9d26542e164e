use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound chat delivery
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where unsolicited messages (scheduled job output, busy notices for
/// webhook-originated turns) are posted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Chat gateway webhook. `None` logs messages instead of posting them.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Environment variable with a bearer token for the webhook.
    #[serde(default)]
    pub webhook_token_env: Option<String>,
    /// Long messages are split into chunks no larger than this.
    #[serde(default = "d_4000")]
    pub max_chunk_chars: usize,
    #[serde(default = "d_3")]
    pub max_attempts: u32,
    #[serde(default = "d_10000")]
    pub timeout_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_token_env: None,
            max_chunk_chars: 4000,
            max_attempts: 3,
            timeout_ms: 10_000,
        }
    }
}

fn d_3() -> u32 {
    3
}
fn d_4000() -> usize {
    4000
}
fn d_10000() -> u64 {
    10_000
}
