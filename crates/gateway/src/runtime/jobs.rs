//! Scheduled jobs run as ordinary turns on the shared session.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tt_domain::config::JobConfig;
use tt_domain::error::Result;
use tt_scheduler::JobExecutor;

use crate::outbound::{ChannelNotifier, ChatSink};
use crate::runtime::bridge::{SessionBridge, TurnRequest};

pub struct SessionJobExecutor {
    bridge: Arc<SessionBridge>,
    sink: Arc<dyn ChatSink>,
}

impl SessionJobExecutor {
    pub fn new(bridge: Arc<SessionBridge>, sink: Arc<dyn ChatSink>) -> Self {
        Self { bridge, sink }
    }
}

#[async_trait]
impl JobExecutor for SessionJobExecutor {
    /// The deadline is handed to the bridge, which counts it from the
    /// moment the arbiter is held and interrupts the agent under that
    /// hold. A job waiting behind a chat turn never interrupts it.
    async fn execute(&self, job: &JobConfig, timeout: Duration) -> Result<String> {
        let prompt = job.render_prompt();
        let label = format!("job:{}", job.name);
        let notifier = ChannelNotifier::new(self.sink.clone(), job.channel.clone());

        let reply = self
            .bridge
            .ask(
                TurnRequest::new(&label, &job.channel, &prompt)
                    .session_id(&label)
                    .deadline(timeout)
                    .progress(&notifier),
            )
            .await?;

        if let Err(e) = self.sink.send(&job.channel, &reply.text).await {
            tracing::warn!(job = %job.name, error = %e, "failed to deliver job output");
        }
        Ok(reply.text)
    }
}
