//! Inputs to and outputs of the FTP state machine.
//!
//! The state machine never touches a socket. The driver turns every
//! [`FtpEffect`] into I/O and reports what happened as an [`FtpEvent`].

use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Instant;
use xfer_core::error::EngineError;
use xfer_core::listing::DirEntry;
use xfer_core::notification::{AsyncReplyEnvelope, CertificateInfo, Notification};
use xfer_core::operation::TransferEndReason;
use xfer_core::reply::ReplyCode;
use xfer_core::server::ServerType;

/// Payload handled by one data connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    /// Directory listing, parsed as it arrives.
    List { server_type: ServerType, latin1: bool },
    Download {
        local_file: PathBuf,
        /// Append from this offset; 0 truncates.
        offset: i64,
        total_size: i64,
    },
    Upload { local_file: PathBuf, offset: i64 },
    /// Read at most one byte to see whether REST was honoured.
    ResumeTest,
}

impl TransferMode {
    pub fn is_list(&self) -> bool {
        matches!(self, TransferMode::List { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSetup {
    pub mode: TransferMode,
    /// PROT P is in effect: wrap the data connection in TLS.
    pub protect: bool,
    pub binary: bool,
}

#[derive(Debug, Clone)]
pub enum FtpEffect {
    /// Open the control connection, running any generic proxy handshake first.
    Connect { host: String, port: u16 },
    /// Run a TLS handshake on the control connection (implicit FTPS or
    /// after AUTH).
    StartTls,
    /// Write bytes to the control connection.
    Send(Vec<u8>),
    /// Connect a passive data connection.
    OpenPassive { addr: SocketAddr, setup: TransferSetup },
    /// Bind a listener for an active data connection.
    ListenActive { setup: TransferSetup },
    /// Tear down the data connection without waiting for it.
    AbortTransfer,
    Notify(Notification),
    Complete(ReplyCode),
    /// Remove the file if it is still empty.
    DiscardEmptyLocalFile(PathBuf),
    SetLocalMtime { path: PathBuf, time: DateTime<Utc> },
    /// Close everything; the connection is over.
    Close,
}

#[derive(Debug, Clone)]
pub enum FtpEvent {
    Connected { local: SocketAddr, peer: SocketAddr },
    ConnectFailed(EngineError),
    /// TLS is up on the control connection.
    TlsEstablished { certificate: CertificateInfo, verified: bool },
    TlsFailed(EngineError),
    Received(Vec<u8>),
    ConnectionLost(EngineError),
    /// Passive connection established.
    DataConnected,
    /// Active listener bound.
    DataListening(SocketAddr),
    /// The data connection could not be set up at all.
    DataFailed(EngineError),
    /// Bytes moved on the data connection.
    DataActivity,
    TransferEnded {
        reason: TransferEndReason,
        error: Option<EngineError>,
        listing: Option<Vec<DirEntry>>,
        /// Payload bytes moved, not counting any resume offset.
        transferred: i64,
        /// TLS session of the data connection resumed the control session.
        tls_resumed: Option<bool>,
    },
    LockGranted,
    AsyncReply(AsyncReplyEnvelope),
    Timer(Instant),
    Cancel,
}
