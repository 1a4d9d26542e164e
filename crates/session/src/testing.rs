//! In-process [`SessionDriver`] for tests and dry runs.
//!
//! Screens are served from a queue; the last one stays on screen once the
//! queue drains. A reaction registered with [`ScriptedDriver::on_send`]
//! replaces the queue whenever matching input is sent.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tt_domain::config::SessionConfig;
use tt_domain::error::{Error, Result};

use crate::driver::SessionDriver;

#[derive(Default)]
struct Script {
    queue: VecDeque<String>,
    current: String,
    reactions: Vec<(String, Vec<String>)>,
    sent: Vec<(String, String)>,
    interrupts: usize,
    sessions: HashSet<String>,
    unavailable: bool,
}

#[derive(Default)]
pub struct ScriptedDriver {
    script: Mutex<Script>,
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver whose session already exists and shows `screen`.
    pub fn with_session(name: &str, screen: &str) -> Self {
        let driver = Self::new();
        {
            let mut s = driver.script.lock();
            s.sessions.insert(name.to_owned());
            s.current = screen.to_owned();
        }
        driver
    }

    /// Append screens to be returned by subsequent captures.
    pub fn push_screens<I, S>(&self, screens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .lock()
            .queue
            .extend(screens.into_iter().map(Into::into));
    }

    /// When sent text contains `needle`, replace pending screens with
    /// `screens`.
    pub fn on_send<I, S>(&self, needle: &str, screens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script.lock().reactions.push((
            needle.to_owned(),
            screens.into_iter().map(Into::into).collect(),
        ));
    }

    /// Make every driver call fail with `SessionUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.script.lock().unavailable = unavailable;
    }

    /// `(session, text)` pairs in send order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.script.lock().sent.clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.script.lock().sent.iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn interrupts(&self) -> usize {
        self.script.lock().interrupts
    }

    fn check(&self) -> Result<()> {
        if self.script.lock().unavailable {
            return Err(Error::SessionUnavailable("scripted driver offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionDriver for ScriptedDriver {
    async fn list_sessions(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.script.lock().sessions.iter().cloned().collect())
    }

    async fn ensure_session(&self, cfg: &SessionConfig) -> Result<bool> {
        self.check()?;
        Ok(self.script.lock().sessions.insert(cfg.name.clone()))
    }

    async fn send(&self, session: &str, text: &str) -> Result<()> {
        self.check()?;
        let mut s = self.script.lock();
        s.sent.push((session.to_owned(), text.to_owned()));
        let reaction = s
            .reactions
            .iter()
            .find(|(needle, _)| text.contains(needle.as_str()))
            .map(|(_, screens)| screens.clone());
        if let Some(screens) = reaction {
            s.queue = screens.into();
        }
        Ok(())
    }

    async fn interrupt(&self, _session: &str) -> Result<()> {
        self.check()?;
        self.script.lock().interrupts += 1;
        Ok(())
    }

    async fn capture_screen(&self, _session: &str, _lines: u32) -> Result<String> {
        self.check()?;
        let mut s = self.script.lock();
        if let Some(next) = s.queue.pop_front() {
            s.current = next;
        }
        Ok(s.current.clone())
    }

    async fn kill(&self, session: &str) -> Result<()> {
        self.check()?;
        self.script.lock().sessions.remove(session);
        Ok(())
    }
}
