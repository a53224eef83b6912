//! Notifications posted from a control socket to whoever drives the engine,
//! and the asynchronous requests that need an answer.

use crate::path::ServerPath;
use crate::rate_limit::Direction;
use crate::reply::ReplyCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Status,
    Error,
    Command,
    Response,
    DebugWarning,
    DebugInfo,
    DebugVerbose,
    DebugDebug,
    RawList,
}

impl MessageType {
    /// Minimum debug level at which this message is shown.
    pub fn debug_level(self) -> u8 {
        match self {
            MessageType::DebugWarning => 1,
            MessageType::DebugInfo => 2,
            MessageType::DebugVerbose => 3,
            MessageType::DebugDebug => 4,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferStatus {
    /// -1 when unknown.
    pub total_size: i64,
    pub start_offset: i64,
    pub current_offset: i64,
    pub started: DateTime<Utc>,
    pub list: bool,
}

impl TransferStatus {
    pub fn new(total_size: i64, start_offset: i64, list: bool) -> Self {
        Self {
            total_size,
            start_offset,
            current_offset: start_offset,
            started: Utc::now(),
            list,
        }
    }

    pub fn transferred(&self) -> i64 {
        self.current_offset - self.start_offset
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FileExistsAction {
    Overwrite,
    OverwriteNewer,
    OverwriteSizeDiffers,
    Resume,
    Rename(String),
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileExistsRequest {
    pub download: bool,
    pub local_file: PathBuf,
    pub local_size: i64,
    pub local_time: Option<DateTime<Utc>>,
    pub remote_path: ServerPath,
    pub remote_file: String,
    pub remote_size: i64,
    pub remote_time: Option<DateTime<Utc>>,
    pub binary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    pub host: String,
    pub port: u16,
    pub fingerprint_sha256: String,
    /// Leaf first, DER encoded.
    pub chain_der: Vec<Vec<u8>>,
    /// Why the normal verifier rejected it, if it did.
    pub verify_error: Option<String>,
    pub protocol: String,
    pub cipher: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AsyncRequest {
    FileExists(FileExistsRequest),
    InteractiveLogin {
        challenge: String,
        /// True for a plain password prompt, false for keyboard-interactive.
        password_only: bool,
    },
    HostKey {
        host: String,
        port: u16,
        fingerprint: String,
        /// A different key was previously trusted for this host.
        changed: bool,
    },
    Certificate(CertificateInfo),
    /// The server cannot do TLS; may we continue in plain text?
    InsecureConnection { host: String, port: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AsyncReply {
    FileExists(FileExistsAction),
    /// `None` cancels the login.
    InteractiveLogin(Option<String>),
    HostKey { trust: bool, always: bool },
    Certificate { trust: bool, always: bool },
    InsecureConnection { allow: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AsyncReplyEnvelope {
    pub request_id: Uuid,
    pub reply: AsyncReply,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Notification {
    Log {
        kind: MessageType,
        message: String,
    },
    OperationComplete {
        reply: ReplyCode,
    },
    Listing {
        path: ServerPath,
        /// The engine's own listing request, not a side effect.
        primary: bool,
        failed: bool,
    },
    TransferStatus(Option<TransferStatus>),
    AsyncRequest {
        request_id: Uuid,
        request: AsyncRequest,
    },
    /// Data moved in the given direction.
    Active(Direction),
    LocalDirCreated(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_serialise_to_json() {
        let n = Notification::OperationComplete {
            reply: ReplyCode::ERROR | ReplyCode::DISCONNECTED,
        };
        let json = serde_json::to_string(&n).unwrap();
        let back: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, n);

        let a = Notification::Active(Direction::Outbound);
        assert_eq!(serde_json::to_string(&a).unwrap(), r#"{"active":"outbound"}"#);
    }

    #[test]
    fn debug_levels_gate_messages() {
        assert_eq!(MessageType::Status.debug_level(), 0);
        assert!(MessageType::DebugDebug.debug_level() > MessageType::DebugWarning.debug_level());
    }
}
