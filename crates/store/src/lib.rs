//! SQLite-backed persistence for tether.
//!
//! One database file per process holds two tables:
//!
//! - `pending_captures`: the durable outbox of conversation exchanges
//!   waiting to be delivered to the memory service ([`CaptureStore`]).
//! - `context_cache`: last-known context text per query fingerprint,
//!   read when the memory service is unreachable ([`ContextCache`]).

pub mod captures;
pub mod context_cache;
mod db;

pub use captures::{
    CaptureStatus, CaptureStore, FailureOutcome, NewCapture, PendingCapture, QueueStats,
    SweepReport,
};
pub use context_cache::{fingerprint, CachedContext, ContextCache};
pub use db::Store;
