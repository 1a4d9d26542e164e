//! `tt-memory`: everything between a conversation turn and the external
//! memory service.
//!
//! - [`MemoryProvider`] abstracts the service; [`RestMemoryClient`] is the
//!   HTTP implementation.
//! - [`CircuitBreaker`] gates every call so a dead service fails fast.
//! - [`ContextService`] serves context reads, falling back to the
//!   persisted cache (degraded mode) when the breaker refuses or the call
//!   fails.
//! - [`CaptureProcessor`] drains the durable capture outbox through the
//!   breaker.

pub mod breaker;
pub mod context;
pub mod outbox;
pub mod provider;
pub mod rest;
pub mod testing;

pub use breaker::{BreakerAttempt, BreakerState, BreakerStats, CircuitBreaker};
pub use context::{ContextResult, ContextService, ContextSource, UNAVAILABLE_NOTICE};
pub use outbox::{CaptureProcessor, CycleReport};
pub use provider::{MemoryProvider, MessageCapture};
pub use rest::{from_reqwest, RestMemoryClient};
