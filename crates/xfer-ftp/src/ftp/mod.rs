//! # FTP/FTPS control socket
//!
//! RFC 959 plus the extensions the engine consumes:
//! - **RFC 2228 / 4217**: AUTH TLS / AUTH SSL, PBSZ, PROT (explicit and implicit FTPS)
//! - **RFC 3659**: MLSD/MLST, SIZE, MDTM, REST STREAM, TVFS
//! - **RFC 2389**: FEAT / OPTS
//! - **RFC 2428**: EPSV / EPRT
//!
//! Architecture:
//! - `reply` assembles CR/LF/NUL-terminated lines into single or multi-line replies
//! - `codec` UTF-8 / Latin-1 framing of commands and reply lines
//! - `login` builds the login command sequence (plain, proxy variants, custom template)
//! - `features` FEAT reply parsing into capabilities
//! - `pasv` PASV/EPSV reply parsing, routable-address fallback, PORT/EPRT formatting
//! - `effect` events fed into the state machine and effects it asks the driver to perform
//! - `ops` the operation frames pushed onto the stack
//! - `control` the sans-IO state machine core (reply pairing, keep-alive, reset funnel)
//! - `connect`, `cwd`, `list`, `file_transfer`, `raw_transfer`, `mkdir`, `directory`
//!   per-command `impl FtpControlSocket` blocks
//! - `backend` plain / TLS stream and the rate-limited copy loops
//! - `tls` rustls configuration, certificate recording, session reuse
//! - `transfer` the data channel task (list, download, upload, resume test)
//! - `driver` the tokio loop that owns the sockets and runs the state machine

pub mod reply;
pub mod codec;
pub mod login;
pub mod features;
pub mod pasv;
pub mod effect;
pub mod ops;
pub mod control;
pub mod connect;
pub mod cwd;
pub mod list;
pub mod file_transfer;
pub mod raw_transfer;
pub mod mkdir;
pub mod directory;
pub mod backend;
pub mod tls;
pub mod transfer;
pub mod driver;

pub use control::FtpControlSocket;
pub use effect::{FtpEffect, FtpEvent, TransferMode, TransferSetup};
pub use reply::FtpReply;

/// `log` target for everything in this crate.
pub(crate) const LOG_TARGET: &str = "xfer::ftp";
