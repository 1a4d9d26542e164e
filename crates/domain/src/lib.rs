//! `tt-domain`: shared types for every tether crate.
//!
//! - [`config`]: the TOML configuration tree and its validation
//! - [`error`]: the shared error taxonomy
//! - [`trace`]: structured trace events emitted across crates

pub mod config;
pub mod error;
pub mod trace;
