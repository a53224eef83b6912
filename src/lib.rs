//! # xfer: FTP/FTPS/SFTP transfer engine
//!
//! - [`model`] server model, paths, listings, caches, locks, notifications
//! - [`ftp`] FTP/FTPS control socket and driver
//! - [`sftp`] SFTP control socket driving the helper process
//! - [`engine`] the facade callers talk to

pub use xfer_core as model;
pub use xfer_engine as engine;
pub use xfer_ftp as ftp;
pub use xfer_sftp as sftp;

pub use xfer_core::{
    AsyncReply, AsyncRequest, Command, DirectoryListing, EngineContext, EngineError, EngineOptions,
    FileExistsAction, Notification, Protocol, ReplyCode, Server, ServerPath,
};
pub use xfer_engine::Engine;
