//! Inputs to and outputs of the SFTP state machine.

use crate::sftp::event::HelperEvent;
use crate::sftp::request::Request;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Instant;
use xfer_core::error::EngineError;
use xfer_core::notification::{AsyncReplyEnvelope, Notification};
use xfer_core::rate_limit::Direction;
use xfer_core::reply::ReplyCode;

#[derive(Debug, Clone)]
pub enum SftpEffect {
    /// Start the helper process.
    Spawn,
    /// Write one request line to the helper.
    Send(Request),
    /// Ask the rate limiter for the next chunk and answer with a `quota` line.
    GrantQuota(Direction),
    Notify(Notification),
    Complete(ReplyCode),
    DiscardEmptyLocalFile(PathBuf),
    SetLocalMtime { path: PathBuf, time: DateTime<Utc> },
    /// Kill the helper; the connection is over.
    Close,
}

#[derive(Debug, Clone)]
pub enum SftpEvent {
    /// Helper process is running.
    Started,
    SpawnFailed(EngineError),
    Helper(HelperEvent),
    /// Helper exited or its output could not be decoded.
    Terminated(EngineError),
    LockGranted,
    AsyncReply(AsyncReplyEnvelope),
    Timer(Instant),
    Cancel,
}
