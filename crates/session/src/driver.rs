use async_trait::async_trait;
use tt_domain::config::SessionConfig;
use tt_domain::error::Result;

/// Terminal multiplexer operations needed to drive one interactive agent.
///
/// Every failure to reach the multiplexer or the session surfaces as
/// `Error::SessionUnavailable`.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Names of the live sessions.
    async fn list_sessions(&self) -> Result<Vec<String>>;

    /// Create the session and start the agent if it is not running.
    /// Returns `true` when a new session was created.
    async fn ensure_session(&self, cfg: &SessionConfig) -> Result<bool>;

    /// Type `text` into the session and submit it.
    async fn send(&self, session: &str, text: &str) -> Result<()>;

    /// Interrupt whatever the agent is doing. Safe to call repeatedly.
    async fn interrupt(&self, session: &str) -> Result<()>;

    /// Plain-text snapshot of the last `lines` lines, ANSI stripped.
    async fn capture_screen(&self, session: &str, lines: u32) -> Result<String>;

    async fn kill(&self, session: &str) -> Result<()>;

    async fn is_alive(&self, session: &str) -> Result<bool> {
        Ok(self.list_sessions().await?.iter().any(|s| s == session))
    }
}
