//! # xfer-core: shared model of the transfer engine
//!
//! Architecture:
//! - `error` / `reply`: categorised errors and the reply-code bitmask
//! - `server` / `path`: server descriptor, dialect-aware remote paths
//! - `listing` / `listing_parser`: directory listings and the streaming parser
//! - `cache` / `path_cache`: process-wide directory and canonical-path caches
//! - `lock`: cross-engine cache locks
//! - `capabilities`: per-server tri-state protocol facts
//! - `rate_limit`: shared inbound/outbound speed limits
//! - `proxy`: HTTP CONNECT / SOCKS handshakes
//! - `command` / `notification`: engine input and output
//! - `options` / `logging` / `context`: configuration, log routing, shared state
//! - `operation` / `driver`: operation stack, timers, driver contract

pub mod error;
pub mod reply;
pub mod server;
pub mod path;
pub mod listing;
pub mod listing_parser;
pub mod cache;
pub mod path_cache;
pub mod lock;
pub mod capabilities;
pub mod rate_limit;
pub mod proxy;
pub mod command;
pub mod notification;
pub mod options;
pub mod logging;
pub mod context;
pub mod operation;
pub mod driver;

pub use error::{EngineError, EngineResult, ErrorKind};
pub use reply::ReplyCode;
pub use server::{Encoding, LogonType, PasvMode, Protocol, Server, ServerKey, ServerType};
pub use path::ServerPath;
pub use listing::{DirEntry, DirectoryListing, EntryFlags};
pub use lock::EngineId;
pub use command::{Command, CommandId, FileTransferCommand, ListFlags, TransferSettings};
pub use notification::{AsyncReply, AsyncReplyEnvelope, AsyncRequest, FileExistsAction, MessageType, Notification};
pub use options::EngineOptions;
pub use context::EngineContext;
pub use logging::Logger;
