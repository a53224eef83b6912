//! Server descriptor: everything needed to reach one remote file server.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol spoken on the control connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    /// Plain FTP, upgraded with AUTH TLS when the server offers it.
    #[default]
    Ftp,
    /// Implicit FTPS, TLS from the first byte.
    Ftps,
    /// Explicit FTPS, AUTH TLS is mandatory.
    Ftpes,
    /// Plain FTP, never attempts TLS.
    InsecureFtp,
    Sftp,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftps => 990,
            Protocol::Sftp => 22,
            _ => 21,
        }
    }

    pub fn is_ftp(self) -> bool {
        !matches!(self, Protocol::Sftp)
    }

    pub fn prefix(self) -> &'static str {
        match self {
            Protocol::Ftp | Protocol::InsecureFtp => "ftp",
            Protocol::Ftps => "ftps",
            Protocol::Ftpes => "ftpes",
            Protocol::Sftp => "sftp",
        }
    }
}

/// How credentials are obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum LogonType {
    #[default]
    Anonymous,
    Normal,
    /// Ask for the password once before connecting.
    Ask,
    /// Ask for every prompt the server sends.
    Interactive,
    /// Normal plus an ACCT step.
    Account,
    /// SFTP key file authentication.
    Key,
}

/// Directory-syntax dialect of the remote host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ServerType {
    #[default]
    Unix,
    Dos,
    Vms,
    Mvs,
    VxWorks,
    Zvm,
    HpNonstop,
    DosVirtual,
    Cygwin,
    DosFwdSlashes,
}

impl ServerType {
    pub const ALL: [ServerType; 10] = [
        ServerType::Unix,
        ServerType::Dos,
        ServerType::Vms,
        ServerType::Mvs,
        ServerType::VxWorks,
        ServerType::Zvm,
        ServerType::HpNonstop,
        ServerType::DosVirtual,
        ServerType::Cygwin,
        ServerType::DosFwdSlashes,
    ];

    pub fn code(self) -> u8 {
        match self {
            ServerType::Unix => 0,
            ServerType::Dos => 1,
            ServerType::Vms => 2,
            ServerType::Mvs => 3,
            ServerType::VxWorks => 4,
            ServerType::Zvm => 5,
            ServerType::HpNonstop => 6,
            ServerType::DosVirtual => 7,
            ServerType::Cygwin => 8,
            ServerType::DosFwdSlashes => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == code)
    }
}

/// Passive/active preference for FTP data connections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum PasvMode {
    /// Follow the engine-wide option.
    #[default]
    Default,
    Passive,
    Active,
}

/// Character encoding used on the control connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum Encoding {
    /// UTF-8 if the server announces it, Latin-1 otherwise.
    #[default]
    Auto,
    Utf8,
    /// Single-byte ISO-8859-1.
    Latin1,
}

/// FTP-level proxy login variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum FtpProxyType {
    #[default]
    None,
    UserAtHost,
    Site,
    Open,
    /// One command per line with `%h %u %p %a %s %w` placeholders.
    Custom(String),
}

/// FTP-level proxy (logged into with USER/PASS before the real server).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub struct FtpProxy {
    pub proxy_type: FtpProxyType,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

/// A remote server plus per-server options.
///
/// Immutable for the lifetime of one connection attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    #[serde(default)]
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub logon_type: LogonType,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub account: String,
    /// SFTP private key files.
    #[serde(default)]
    pub key_files: Vec<String>,
    #[serde(default)]
    pub server_type: ServerType,
    /// Manual timezone correction in minutes.
    #[serde(default)]
    pub timezone_offset: i32,
    #[serde(default)]
    pub pasv_mode: PasvMode,
    #[serde(default)]
    pub encoding: Encoding,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_connections: u32,
    #[serde(default)]
    pub post_login_commands: Vec<String>,
    #[serde(default)]
    pub bypass_proxy: bool,
}

impl Server {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            logon_type: LogonType::Anonymous,
            user: String::new(),
            password: String::new(),
            account: String::new(),
            key_files: Vec::new(),
            server_type: ServerType::Unix,
            timezone_offset: 0,
            pasv_mode: PasvMode::Default,
            encoding: Encoding::Auto,
            max_connections: 0,
            post_login_commands: Vec::new(),
            bypass_proxy: false,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.logon_type = LogonType::Normal;
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// User name actually sent; anonymous logons use the conventional name.
    pub fn effective_user(&self) -> &str {
        if self.logon_type == LogonType::Anonymous {
            "anonymous"
        } else {
            &self.user
        }
    }

    pub fn effective_password(&self) -> &str {
        if self.logon_type == LogonType::Anonymous {
            "anonymous@example.com"
        } else {
            &self.password
        }
    }

    /// `host` or `host:port` when the port is not the protocol default.
    pub fn format_host(&self) -> String {
        if self.port == self.protocol.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Identity used as cache key.
    pub fn key(&self) -> ServerKey {
        ServerKey {
            protocol: self.protocol,
            host: self.host.to_lowercase(),
            port: self.port,
            user: self.effective_user().to_string(),
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}", self.protocol.prefix(), self.effective_user(), self.format_host())
    }
}

/// Value-typed server identity used by every process-wide cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerKey {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl PartialOrd for Protocol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Protocol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_case_insensitive_on_host() {
        let a = Server::new(Protocol::Ftp, "Example.COM", 21);
        let b = Server::new(Protocol::Ftp, "example.com", 21);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn anonymous_logon_uses_conventional_user() {
        let s = Server::new(Protocol::Ftp, "h", 21);
        assert_eq!(s.effective_user(), "anonymous");
        let s = s.with_credentials("bob", "pw");
        assert_eq!(s.effective_user(), "bob");
    }

    #[test]
    fn format_host_omits_default_port() {
        assert_eq!(Server::new(Protocol::Ftps, "h", 990).format_host(), "h");
        assert_eq!(Server::new(Protocol::Ftp, "h", 2121).format_host(), "h:2121");
    }

    #[test]
    fn server_type_codes_round_trip() {
        for t in ServerType::ALL {
            assert_eq!(ServerType::from_code(t.code()), Some(t));
        }
    }
}
