//! Operation frames of the SFTP state machine.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use xfer_core::command::{FileTransferCommand, ListFlags};
use xfer_core::listing::DirEntry;
use xfer_core::lock::LockKey;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;

#[derive(Debug)]
pub enum Step {
    Wait,
    Continue,
    Push(SftpOp),
    Done(ReplyCode),
}

#[derive(Debug)]
pub enum SftpOp {
    Connect(ConnectOp),
    ChangeDir(CwdOp),
    List(ListOp),
    FileTransfer(TransferOp),
    Mkdir(MkdirOp),
    Delete(DeleteOp),
    RemoveDir(SingleOp),
    Rename(RenameOp),
    Chmod(ChmodOp),
    Raw(SingleOp),
}

impl SftpOp {
    pub fn name(&self) -> &'static str {
        match self {
            SftpOp::Connect(_) => "connect",
            SftpOp::ChangeDir(_) => "cwd",
            SftpOp::List(_) => "list",
            SftpOp::FileTransfer(_) => "transfer",
            SftpOp::Mkdir(_) => "mkdir",
            SftpOp::Delete(_) => "delete",
            SftpOp::RemoveDir(_) => "removedir",
            SftpOp::Rename(_) => "rename",
            SftpOp::Chmod(_) => "chmod",
            SftpOp::Raw(_) => "raw",
        }
    }
}

// ─── Connect ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Init,
    /// Helper spawned, waiting for its banner.
    Banner,
    Proxy,
    Keyfile,
    Open,
}

#[derive(Debug)]
pub struct ConnectOp {
    pub state: ConnectState,
    pub key_files: VecDeque<String>,
    /// A request is out and its `Done` has not arrived.
    pub sent: bool,
}

// ─── ChangeDir ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwdState {
    Init,
    Pwd,
    Cd,
}

#[derive(Debug)]
pub struct CwdOp {
    pub path: ServerPath,
    pub subdir: String,
    pub target: Option<ServerPath>,
    pub state: CwdState,
    /// Path from the helper's reply, applied once `Done` confirms it.
    pub reported: Option<ServerPath>,
    pub link_discovery: bool,
}

impl CwdOp {
    pub fn new(path: ServerPath, subdir: impl Into<String>) -> Self {
        Self {
            path,
            subdir: subdir.into(),
            target: None,
            state: CwdState::Init,
            reported: None,
            link_discovery: false,
        }
    }
}

// ─── List ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListState {
    Init,
    WaitCwd,
    WaitLock,
    Ls,
}

#[derive(Debug)]
pub struct ListOp {
    pub path: ServerPath,
    pub subdir: String,
    pub flags: ListFlags,
    pub state: ListState,
    pub lock: Option<LockKey>,
    pub entries: Vec<DirEntry>,
}

// ─── FileTransfer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    WaitCwd,
    Mtime,
    FileExists,
    Transfer,
    Chmtime,
}

#[derive(Debug)]
pub struct TransferOp {
    pub command: FileTransferCommand,
    pub state: TransferState,
    pub remote_size: i64,
    pub remote_time: Option<DateTime<Utc>>,
    pub local_size: i64,
    pub local_time: Option<DateTime<Utc>>,
    pub resume: bool,
    pub fresh_local: bool,
    pub transferred: i64,
    pub sent: bool,
}

impl TransferOp {
    pub fn new(command: FileTransferCommand) -> Self {
        Self {
            command,
            state: TransferState::Init,
            remote_size: -1,
            remote_time: None,
            local_size: -1,
            local_time: None,
            resume: false,
            fresh_local: false,
            transferred: 0,
            sent: false,
        }
    }
}

// ─── Mkdir ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirState {
    Init,
    WaitLock,
    FindParent,
    Mkdir,
}

#[derive(Debug)]
pub struct MkdirOp {
    pub path: ServerPath,
    pub current: ServerPath,
    pub segments: VecDeque<String>,
    pub state: MkdirState,
    pub lock: Option<LockKey>,
}

// ─── Single-request operations ───────────────────────────────────────

#[derive(Debug)]
pub struct DeleteOp {
    pub path: ServerPath,
    pub files: VecDeque<String>,
    pub current: Option<String>,
    pub failed: bool,
}

/// RemoveDir (`path` + `name`) and raw commands (`name` is the line).
#[derive(Debug)]
pub struct SingleOp {
    pub path: ServerPath,
    pub name: String,
    pub sent: bool,
}

#[derive(Debug)]
pub struct RenameOp {
    pub from_path: ServerPath,
    pub from_file: String,
    pub to_path: ServerPath,
    pub to_file: String,
    pub sent: bool,
}

#[derive(Debug)]
pub struct ChmodOp {
    pub path: ServerPath,
    pub file: String,
    pub permission: String,
    pub sent: bool,
}
