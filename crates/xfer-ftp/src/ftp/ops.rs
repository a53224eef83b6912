//! Operation frames. One variant per command plus the sub-operations
//! (`ChangeDir`, `RawTransfer`) that commands push on top of themselves.

use crate::ftp::effect::TransferSetup;
use crate::ftp::login::LoginSequence;
use crate::ftp::reply::FtpReply;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::net::SocketAddr;
use xfer_core::command::{FileTransferCommand, ListFlags};
use xfer_core::error::EngineError;
use xfer_core::listing::{DirEntry, DirectoryListing};
use xfer_core::lock::LockKey;
use xfer_core::notification::CertificateInfo;
use xfer_core::operation::TransferEndReason;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;

/// What the state machine does after handling an input.
#[derive(Debug)]
pub enum Step {
    /// Something was sent or requested; wait for the next event.
    Wait,
    /// Run the top operation's next step.
    Continue,
    /// Push a sub-operation and start it.
    Push(FtpOp),
    /// The top operation finished with this code.
    Done(ReplyCode),
}

#[derive(Debug)]
pub enum FtpOp {
    Logon(LogonOp),
    ChangeDir(CwdOp),
    List(ListOp),
    FileTransfer(TransferOp),
    RawTransfer(RawTransferOp),
    Mkdir(MkdirOp),
    Delete(DeleteOp),
    RemoveDir(RemoveDirOp),
    Rename(RenameOp),
    Chmod(ChmodOp),
    Raw(RawCommandOp),
}

impl FtpOp {
    pub fn name(&self) -> &'static str {
        match self {
            FtpOp::Logon(_) => "connect",
            FtpOp::ChangeDir(_) => "cwd",
            FtpOp::List(_) => "list",
            FtpOp::FileTransfer(_) => "transfer",
            FtpOp::RawTransfer(_) => "rawtransfer",
            FtpOp::Mkdir(_) => "mkdir",
            FtpOp::Delete(_) => "delete",
            FtpOp::RemoveDir(_) => "removedir",
            FtpOp::Rename(_) => "rename",
            FtpOp::Chmod(_) => "chmod",
            FtpOp::Raw(_) => "raw",
        }
    }
}

// ─── Logon ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogonState {
    Connecting,
    /// Implicit TLS handshake before the greeting.
    Handshake,
    Welcome,
    AuthTls,
    AuthSsl,
    /// Explicit TLS handshake after AUTH.
    AuthHandshake,
    /// Waiting for the user to accept a certificate.
    Certificate,
    /// Waiting for the user to allow plain FTP.
    Insecure,
    Login,
    /// Waiting for an interactively entered password.
    Password,
    Syst,
    Feat,
    Clnt,
    OptsUtf8,
    Pbsz,
    Prot,
    OptsMlst,
    Custom,
}

#[derive(Debug)]
pub struct LogonOp {
    pub state: LogonState,
    pub sequence: LoginSequence,
    /// Post-login commands still to send.
    pub custom: VecDeque<String>,
    /// Text of the last login reply, shown as the password prompt.
    pub last_reply: String,
    /// Certificate awaiting the user's decision.
    pub certificate: Option<CertificateInfo>,
    /// Greeting that arrived while the certificate prompt was open.
    pub early_reply: Option<FtpReply>,
}

// ─── ChangeDir ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwdState {
    Init,
    Pwd,
    Cwd,
    /// Auto-MKD sub-operation running before the CWD is retried.
    Mkdir,
    CwdSubdir,
    PwdSubdir,
    Cdup,
    CwdDotDot,
}

#[derive(Debug)]
pub struct CwdOp {
    pub path: ServerPath,
    pub subdir: String,
    /// Expected result, when it can be computed locally.
    pub target: Option<ServerPath>,
    pub state: CwdState,
    pub try_mkdir: bool,
    pub tried_mkdir: bool,
    /// Entering a link: a failing CWD means "not a directory".
    pub link_discovery: bool,
}

impl CwdOp {
    pub fn new(path: ServerPath, subdir: impl Into<String>) -> Self {
        Self {
            path,
            subdir: subdir.into(),
            target: None,
            state: CwdState::Init,
            try_mkdir: false,
            tried_mkdir: false,
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
    WaitTransfer,
    /// Plain LIST issued to check whether `LIST -a` was understood.
    WaitPlainTransfer,
    Mdtm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListCommand {
    Mlsd,
    ListHidden,
    List,
}

impl ListCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ListCommand::Mlsd => "MLSD",
            ListCommand::ListHidden => "LIST -a",
            ListCommand::List => "LIST",
        }
    }
}

#[derive(Debug)]
pub struct ListOp {
    pub path: ServerPath,
    pub subdir: String,
    pub flags: ListFlags,
    pub state: ListState,
    pub lock: Option<LockKey>,
    pub command: ListCommand,
    /// Result of `LIST -a` kept while the plain LIST runs.
    pub hidden_entries: Option<Vec<DirEntry>>,
    pub listing: Option<DirectoryListing>,
    /// Entry whose MDTM calibrates the timezone offset.
    pub mdtm_entry: Option<DirEntry>,
    /// Already listing the current directory after a failed CWD.
    pub fell_back: bool,
}

impl ListOp {
    pub fn new(path: ServerPath, subdir: String, flags: ListFlags) -> Self {
        Self {
            path,
            subdir,
            flags,
            state: ListState::Init,
            lock: None,
            command: ListCommand::List,
            hidden_entries: None,
            listing: None,
            mdtm_entry: None,
            fell_back: false,
        }
    }
}

// ─── FileTransfer ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    WaitCwd,
    Size,
    Mdtm,
    /// Listing the directory because SIZE is unavailable.
    WaitList,
    FileExists,
    ResumeTest,
    Transfer,
    Mfmt,
}

#[derive(Debug)]
pub struct TransferOp {
    pub command: FileTransferCommand,
    pub state: TransferState,
    /// -1 when unknown.
    pub remote_size: i64,
    pub remote_time: Option<DateTime<Utc>>,
    /// -1 when the local file does not exist.
    pub local_size: i64,
    pub local_time: Option<DateTime<Utc>>,
    pub resume: bool,
    /// The download creates the local file (it did not exist or is truncated).
    pub fresh_local: bool,
    /// At least one byte was written locally.
    pub transfer_started: bool,
    pub end_reason: TransferEndReason,
    /// Working directory is the remote directory, so bare names work.
    pub in_dir: bool,
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
            transfer_started: false,
            end_reason: TransferEndReason::None,
            in_dir: false,
        }
    }
}

// ─── RawTransfer ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawState {
    Type,
    PortPasv,
    Pasv,
    /// Waiting for the data connection (passive) or the listener (active).
    WaitData,
    Port,
    Rest,
    Transfer,
    WaitFinish,
}

#[derive(Debug)]
pub struct RawTransferOp {
    /// RETR/STOR/APPE/LIST/MLSD line.
    pub command: String,
    pub setup: TransferSetup,
    pub rest_offset: i64,
    pub state: RawState,
    pub passive: bool,
    pub tried_passive: bool,
    pub tried_active: bool,
    /// Passive retry against the control peer already attempted.
    pub tried_peer: bool,
    /// Connect the next passive connection to the control peer.
    pub force_peer: bool,
    /// Address from the last PASV/EPSV reply.
    pub announced: Option<SocketAddr>,
    pub target: Option<SocketAddr>,
    /// EPSV was refused; use PASV.
    pub epsv_failed: bool,
    pub got_preliminary: bool,
    pub final_reply: Option<ReplyCode>,
    pub ended: Option<(TransferEndReason, Option<EngineError>)>,
    pub listing: Option<Vec<DirEntry>>,
    pub data_open: bool,
}

impl RawTransferOp {
    pub fn new(command: impl Into<String>, setup: TransferSetup, rest_offset: i64, passive: bool) -> Self {
        Self {
            command: command.into(),
            setup,
            rest_offset,
            state: RawState::Type,
            passive,
            tried_passive: false,
            tried_active: false,
            tried_peer: false,
            force_peer: false,
            announced: None,
            target: None,
            epsv_failed: false,
            got_preliminary: false,
            final_reply: None,
            ended: None,
            listing: None,
            data_open: false,
        }
    }
}

// ─── Mkdir ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkdirState {
    Init,
    WaitLock,
    FindParent,
    Mkd,
    CwdSegment,
    FullMkd,
}

#[derive(Debug)]
pub struct MkdirOp {
    pub path: ServerPath,
    /// Directory currently probed or entered.
    pub current: ServerPath,
    /// Segments still to create below `current`.
    pub segments: VecDeque<String>,
    pub state: MkdirState,
    pub lock: Option<LockKey>,
}

// ─── Single-command operations ───────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimpleState {
    Init,
    WaitCwd,
    Sent,
    /// Second command of a pair (RNTO).
    SentSecond,
}

#[derive(Debug)]
pub struct DeleteOp {
    pub path: ServerPath,
    pub files: VecDeque<String>,
    pub current: Option<String>,
    pub state: SimpleState,
    pub in_dir: bool,
    pub failed: bool,
}

#[derive(Debug)]
pub struct RemoveDirOp {
    pub path: ServerPath,
    pub subdir: String,
    pub state: SimpleState,
    pub in_dir: bool,
}

#[derive(Debug)]
pub struct RenameOp {
    pub from_path: ServerPath,
    pub from_file: String,
    pub to_path: ServerPath,
    pub to_file: String,
    pub state: SimpleState,
    pub in_dir: bool,
}

#[derive(Debug)]
pub struct ChmodOp {
    pub path: ServerPath,
    pub file: String,
    pub permission: String,
    pub state: SimpleState,
    pub in_dir: bool,
}

#[derive(Debug)]
pub struct RawCommandOp {
    pub command: String,
    pub state: SimpleState,
}
