//! # SFTP control socket
//!
//! SFTP is spoken by an external helper process. The engine writes one
//! request line per command to its stdin and reads typed events from its
//! stdout; see [`event`] for the framing.
//!
//! Architecture:
//! - `event` the helper's output framing and the typed events
//! - `request` request lines, quoting and wildcard escaping
//! - `effect` events fed into the state machine and effects it asks the driver to perform
//! - `ops` the operation frames pushed onto the stack
//! - `control` the sans-IO state machine core (request/Done pairing, reset funnel)
//! - `connect`, `cwd`, `list`, `file_transfer`, `directory`
//!   per-command `impl SftpControlSocket` blocks
//! - `driver` the tokio loop that owns the helper process

pub mod event;
pub mod request;
pub mod effect;
pub mod ops;
pub mod control;
pub mod connect;
pub mod cwd;
pub mod list;
pub mod file_transfer;
pub mod directory;
pub mod driver;

pub use control::SftpControlSocket;
pub use effect::{SftpEffect, SftpEvent};
pub use event::{EventDecoder, HelperEvent};

/// `log` target for everything in this crate.
pub(crate) const LOG_TARGET: &str = "xfer::sftp";
