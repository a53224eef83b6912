//! Engine-wide error type.

use crate::reply::ReplyCode;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineError {
    pub kind: ErrorKind,
    pub message: String,
    /// Protocol reply code that triggered the error, if any.
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    /// TCP connect / DNS resolution failure.
    ConnectionFailed,
    /// TLS handshake or certificate failure.
    TlsFailed,
    /// Proxy handshake rejected or malformed.
    ProxyFailed,
    /// Credentials rejected.
    AuthFailed,
    /// Server sent something that does not follow the protocol.
    ProtocolError,
    /// Data channel could not be established.
    DataChannelFailed,
    /// Local file I/O failure.
    IoError,
    /// Local disk is full or the write was refused.
    WriteFailed,
    /// No activity within the configured window.
    Timeout,
    /// The connection went away.
    Disconnected,
    /// User cancelled the operation.
    Cancelled,
    /// Invalid option or argument.
    InvalidConfig,
    /// Helper process could not be started or spoke the wrong protocol.
    HelperFailed,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionFailed, msg)
    }

    pub fn tls_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::TlsFailed, msg)
    }

    pub fn proxy_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProxyFailed, msg)
    }

    pub fn protocol_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolError, msg)
    }

    pub fn data_channel(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::DataChannelFailed, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::IoError, msg)
    }

    pub fn write_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::WriteFailed, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, msg)
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Disconnected, msg)
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfig, msg)
    }

    pub fn helper_failed(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::HelperFailed, msg)
    }

    /// Map the error onto the reply bitmask reported to the caller.
    pub fn reply_code(&self) -> ReplyCode {
        match self.kind {
            ErrorKind::Cancelled => ReplyCode::CANCELED,
            ErrorKind::Timeout => ReplyCode::TIMEOUT | ReplyCode::DISCONNECTED,
            ErrorKind::WriteFailed => ReplyCode::WRITEFAILED | ReplyCode::CRITICALERROR,
            ErrorKind::InvalidConfig => ReplyCode::SYNTAXERROR,
            ErrorKind::AuthFailed => {
                ReplyCode::ERROR | ReplyCode::CRITICALERROR | ReplyCode::PASSWORDFAILED
            }
            ErrorKind::IoError | ErrorKind::DataChannelFailed => ReplyCode::ERROR,
            ErrorKind::ConnectionFailed
            | ErrorKind::TlsFailed
            | ErrorKind::ProxyFailed
            | ErrorKind::ProtocolError
            | ErrorKind::Disconnected
            | ErrorKind::HelperFailed => ReplyCode::ERROR | ReplyCode::DISCONNECTED,
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[{:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[{:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => Self::connection_failed(e.to_string()),
            std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
                Self::disconnected(e.to_string())
            }
            _ => Self::io_error(e.to_string()),
        }
    }
}

/// Whether a failed create reports that the directory was already there.
/// Servers and the SFTP helper only say so in the message text.
pub fn reports_already_exists(message: &str) -> bool {
    let text = message.to_lowercase();
    if ["not exist", "doesn't exist", "no such", "not found"]
        .iter()
        .any(|negative| text.contains(negative))
    {
        return false;
    }
    if ["already exist", "file exists", "directory exists"]
        .iter()
        .any(|positive| text.contains(positive))
    {
        return true;
    }
    // `550 "/a" exists`
    text.trim_end_matches(|c: char| c == '.' || c == '!' || c.is_whitespace())
        .ends_with(" exists")
}

impl From<EngineError> for String {
    fn from(e: EngineError) -> String {
        e.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_failure_carries_password_flag() {
        let code = EngineError::new(ErrorKind::AuthFailed, "530").reply_code();
        assert!(code.contains(ReplyCode::PASSWORDFAILED));
        assert!(code.contains(ReplyCode::CRITICALERROR));
    }

    #[test]
    fn already_exists_wording() {
        assert!(reports_already_exists("550 Directory already exists"));
        assert!(reports_already_exists("mkdir /a: File exists"));
        assert!(reports_already_exists("521 \"/a\" EXISTS."));
        assert!(!reports_already_exists("550 Cannot create x: parent directory does not exist"));
        assert!(!reports_already_exists("550 /x: No such file or directory"));
        assert!(!reports_already_exists("550 Permission denied"));
        assert!(!reports_already_exists(""));
    }

    #[test]
    fn io_timeout_maps_to_timeout_kind() {
        let e: EngineError = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(e.kind, ErrorKind::Timeout);
        assert!(e.reply_code().contains(ReplyCode::TIMEOUT));
    }
}
