//! In-memory [`MemoryProvider`] double for tests in this and dependent
//! crates.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tt_domain::error::{Error, Result};

use crate::provider::{MemoryProvider, MessageCapture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubMode {
    /// Every call succeeds.
    Healthy,
    /// Every call fails with a transient error.
    Unreachable,
    /// Every call hangs for the given duration before succeeding.
    Slow(Duration),
}

/// Scriptable memory service. Records delivered messages and counts calls.
#[derive(Debug)]
pub struct StubMemory {
    mode: Mutex<StubMode>,
    context: Mutex<String>,
    delivered: Mutex<Vec<MessageCapture>>,
    calls: Mutex<usize>,
}

impl StubMemory {
    pub fn new(mode: StubMode) -> Self {
        Self {
            mode: Mutex::new(mode),
            context: Mutex::new("live context".into()),
            delivered: Mutex::new(Vec::new()),
            calls: Mutex::new(0),
        }
    }

    pub fn set_mode(&self, mode: StubMode) {
        *self.mode.lock() = mode;
    }

    pub fn set_context(&self, text: impl Into<String>) {
        *self.context.lock() = text.into();
    }

    pub fn delivered(&self) -> Vec<MessageCapture> {
        self.delivered.lock().clone()
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock()
    }

    async fn gate(&self) -> Result<()> {
        *self.calls.lock() += 1;
        let mode = *self.mode.lock();
        match mode {
            StubMode::Healthy => Ok(()),
            StubMode::Unreachable => Err(Error::Http("connection refused".into())),
            StubMode::Slow(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MemoryProvider for StubMemory {
    async fn fetch_context(&self, _query: &str) -> Result<String> {
        self.gate().await?;
        Ok(self.context.lock().clone())
    }

    async fn post_message(&self, capture: &MessageCapture) -> Result<()> {
        self.gate().await?;
        self.delivered.lock().push(capture.clone());
        Ok(())
    }

    async fn health(&self) -> Result<serde_json::Value> {
        self.gate().await?;
        Ok(serde_json::json!({ "status": "ok" }))
    }
}
