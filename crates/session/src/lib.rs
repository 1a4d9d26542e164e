//! `tt-session`: the single shared agent session.
//!
//! - [`SessionDriver`] abstracts the terminal multiplexer; [`TmuxDriver`]
//!   drives tmux.
//! - [`MarkerTable`] classifies the tail of a screen as thinking or idle.
//! - [`ResponseStabilizer`] polls the screen until the reply settles and
//!   [`diff_screens`] extracts what changed.
//! - [`GarbageFilter`] rejects replies that are leaked tool output.
//! - [`SessionArbiter`] serializes every interaction with the session.

pub mod ansi;
pub mod arbiter;
pub mod classify;
pub mod diff;
pub mod driver;
pub mod garbage;
pub mod stabilizer;
pub mod testing;
pub mod tmux;

pub use arbiter::{AcquireRequest, ArbiterGuard, BusyInfo, BusyNotifier, SessionArbiter};
pub use classify::{MarkerTable, ScreenClass};
pub use diff::{diff_screens, extract_response};
pub use driver::SessionDriver;
pub use garbage::{GarbageFilter, GarbageVerdict};
pub use stabilizer::{
    PollPhase, PollTracker, ProgressNotifier, ResponseStabilizer, StabilizeOutcome,
    StabilizedResponse,
};
pub use tmux::TmuxDriver;
