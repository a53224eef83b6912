//! # Engine facade
//!
//! The only surface the queue and UI layers talk to. An [`Engine`] runs
//! one command at a time on a background task and reports everything
//! through its notification stream.
//!
//! - `facade` command validation, notifications, async replies, cache lookups
//! - `runner` the background task that picks a protocol driver per connection

pub mod facade;
pub mod runner;

pub use facade::Engine;

/// `log` target for everything in this crate.
pub(crate) const LOG_TARGET: &str = "xfer::engine";
