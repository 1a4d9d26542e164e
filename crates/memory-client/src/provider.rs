//! The `MemoryProvider` trait: the two calls tether makes against the
//! memory service, plus a health probe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tt_domain::error::Result;
use tt_store::PendingCapture;

/// Body of `POST /messages`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCapture {
    pub session_id: String,
    pub user_message: String,
    pub assistant_response: String,
}

impl From<&PendingCapture> for MessageCapture {
    fn from(c: &PendingCapture) -> Self {
        Self {
            session_id: c.session_id.clone(),
            user_message: c.user_message.clone(),
            assistant_response: c.assistant_response.clone(),
        }
    }
}

/// Abstraction over the memory service.
///
/// Implementations may talk to the real REST API or be a test double.
/// Callers wrap every call in the circuit breaker; implementations do not.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Context text relevant to `query` (POST /context?query=...).
    async fn fetch_context(&self, query: &str) -> Result<String>;

    /// Record one conversation exchange (POST /messages).
    async fn post_message(&self, capture: &MessageCapture) -> Result<()>;

    /// Liveness probe (GET /health).
    async fn health(&self) -> Result<serde_json::Value>;
}
