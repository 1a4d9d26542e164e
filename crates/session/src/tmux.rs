//! tmux-backed [`SessionDriver`].
//!
//! Single-line input goes through `send-keys -l`; anything with a newline
//! is loaded into a named buffer and pasted with `paste-buffer -p` so the
//! agent receives it as one bracketed paste instead of several submits.

use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tt_domain::config::SessionConfig;
use tt_domain::error::{Error, Result};

use crate::ansi::strip_ansi;
use crate::driver::SessionDriver;

const PASTE_BUFFER: &str = "tether-paste";
/// Time the agent UI needs to ingest a bracketed paste before Enter.
const PASTE_SETTLE: Duration = Duration::from_millis(400);

#[derive(Debug, Clone)]
pub struct TmuxDriver {
    binary: String,
    width: u16,
    height: u16,
}

impl Default for TmuxDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl TmuxDriver {
    pub fn new() -> Self {
        Self::with_binary("tmux")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            width: 200,
            height: 50,
        }
    }

    /// Whether the tmux binary can be executed at all.
    pub async fn available(&self) -> bool {
        Command::new(&self.binary)
            .arg("-V")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::SessionUnavailable(format!("cannot run {}: {e}", self.binary)))
    }

    /// Run and require a zero exit status.
    async fn run_ok(&self, args: &[&str]) -> Result<Output> {
        let out = self.run(args).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(Error::SessionUnavailable(format!(
                "tmux {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                out.status,
                stderr.trim()
            )));
        }
        Ok(out)
    }
}

/// Whether `text` must be delivered as a bracketed paste.
pub(crate) fn needs_paste(text: &str) -> bool {
    text.contains('\n')
}

#[async_trait]
impl SessionDriver for TmuxDriver {
    async fn list_sessions(&self) -> Result<Vec<String>> {
        let out = self.run(&["list-sessions", "-F", "#{session_name}"]).await?;
        if !out.status.success() {
            // No server running means no sessions.
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn ensure_session(&self, cfg: &SessionConfig) -> Result<bool> {
        if self.is_alive(&cfg.name).await? {
            return Ok(false);
        }
        let dir = cfg.working_dir.to_string_lossy();
        let width = self.width.to_string();
        let height = self.height.to_string();
        self.run_ok(&[
            "new-session",
            "-d",
            "-s",
            &cfg.name,
            "-x",
            &width,
            "-y",
            &height,
            "-c",
            &dir,
            &cfg.agent_command,
        ])
        .await?;
        tracing::info!(session = %cfg.name, command = %cfg.agent_command, "agent session created");
        Ok(true)
    }

    async fn send(&self, session: &str, text: &str) -> Result<()> {
        if needs_paste(text) {
            self.run_ok(&["set-buffer", "-b", PASTE_BUFFER, "--", text])
                .await?;
            self.run_ok(&["paste-buffer", "-b", PASTE_BUFFER, "-t", session, "-p", "-d"])
                .await?;
            tokio::time::sleep(PASTE_SETTLE).await;
        } else {
            self.run_ok(&["send-keys", "-t", session, "-l", "--", text])
                .await?;
        }
        self.run_ok(&["send-keys", "-t", session, "Enter"]).await?;
        Ok(())
    }

    async fn interrupt(&self, session: &str) -> Result<()> {
        self.run_ok(&["send-keys", "-t", session, "C-c"]).await?;
        tracing::info!(session = %session, "interrupt sent");
        Ok(())
    }

    async fn capture_screen(&self, session: &str, lines: u32) -> Result<String> {
        let start = format!("-{lines}");
        let out = self
            .run_ok(&["capture-pane", "-p", "-J", "-t", session, "-S", &start])
            .await?;
        Ok(strip_ansi(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn kill(&self, session: &str) -> Result<()> {
        if !self.is_alive(session).await? {
            return Ok(());
        }
        self.run_ok(&["kill-session", "-t", session]).await?;
        tracing::info!(session = %session, "agent session killed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiline_text_is_pasted() {
        assert!(needs_paste("line one\nline two"));
        assert!(!needs_paste("just one line"));
    }

    #[tokio::test]
    async fn missing_binary_is_session_unavailable() {
        let driver = TmuxDriver::with_binary("/nonexistent/tmux-binary");
        assert!(!driver.available().await);
        let err = driver.list_sessions().await.unwrap_err();
        assert!(matches!(err, Error::SessionUnavailable(_)));
        let err = driver.capture_screen("s", 10).await.unwrap_err();
        assert!(matches!(err, Error::SessionUnavailable(_)));
    }
}
