//! `tt-gateway`: library half of the `tether` binary.
//!
//! Bootstrap, the HTTP surface, CLI helpers and the session bridge that
//! ties the arbiter, stabilizer, memory service and scheduler together.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod outbound;
pub mod runtime;
pub mod server;
pub mod state;
