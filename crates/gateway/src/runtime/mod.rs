//! Turn execution on top of the shared session.

pub mod bridge;
pub mod jobs;

pub use bridge::{compose_prompt, SessionBridge, TurnReply, TurnRequest};
pub use jobs::SessionJobExecutor;
