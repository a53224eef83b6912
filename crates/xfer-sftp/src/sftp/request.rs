//! Request lines written to the SFTP helper's stdin.
//!
//! Arguments are wrapped in double quotes with embedded quotes doubled.
//! Remote file names additionally get the helper's wildcard characters
//! backslash-escaped, since the helper glob-expands them.

use chrono::{DateTime, Utc};
use std::path::Path;
use xfer_core::path::ServerPath;
use xfer_core::proxy::ProxyConfig;
use xfer_core::rate_limit::Direction;

/// `"a ""b"""` for `a "b"`.
pub fn quote(arg: &str) -> String {
    format!("\"{}\"", arg.replace('"', "\"\""))
}

/// Escape the characters the helper treats as wildcards.
pub fn escape_wildcards(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Quoted full path of `name` inside `path`, wildcards escaped in the name.
pub fn remote_file(path: &ServerPath, name: &str) -> String {
    quote(&path.format_filename(&escape_wildcards(name), false))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Proxy(ProxyConfig),
    Keyfile(String),
    Open { user: String, host: String, port: u16 },
    Cd(ServerPath),
    Pwd,
    Ls,
    /// Download; a non-zero offset resumes.
    Get { remote: String, local: String, offset: i64 },
    Put { local: String, remote: String, offset: i64 },
    Mtime(String),
    Chmtime { remote: String, time: DateTime<Utc> },
    Mkdir(ServerPath),
    Rm(String),
    Rmdir(ServerPath),
    Mv { from: String, to: String },
    Chmod { permission: String, remote: String },
    /// Command typed by the user, passed through untouched.
    Raw(String),
    /// Answer to a password prompt.
    Password(String),
    /// Answer to a host key prompt: trust and store, trust once, or refuse.
    HostKey { trust: bool, always: bool },
    /// Quota for the next chunk; `None` lifts the limit.
    Quota { direction: Direction, bytes: Option<usize> },
}

impl Request {
    /// Wire form without the trailing newline.
    pub fn line(&self) -> String {
        match self {
            Request::Proxy(proxy) => {
                let mut line = format!(
                    "proxy {} {} {}",
                    proxy.proxy_type.keyword(),
                    quote(&proxy.host),
                    proxy.port
                );
                if !proxy.user.is_empty() {
                    line.push(' ');
                    line.push_str(&quote(&proxy.user));
                    if !proxy.password.is_empty() {
                        line.push(' ');
                        line.push_str(&quote(&proxy.password));
                    }
                }
                line
            }
            Request::Keyfile(path) => format!("keyfile {}", quote(path)),
            Request::Open { user, host, port } => format!("open {} {}", quote(&format!("{}@{}", user, host)), port),
            Request::Cd(path) => format!("cd {}", quote(&path.format())),
            Request::Pwd => "pwd".to_string(),
            Request::Ls => "ls".to_string(),
            Request::Get { remote, local, offset } => with_offset(format!("get {} {}", remote, quote(local)), *offset),
            Request::Put { local, remote, offset } => with_offset(format!("put {} {}", quote(local), remote), *offset),
            Request::Mtime(remote) => format!("mtime {}", remote),
            Request::Chmtime { remote, time } => format!("chmtime {} {}", time.timestamp(), remote),
            Request::Mkdir(path) => format!("mkdir {}", quote(&path.format())),
            Request::Rm(remote) => format!("rm {}", remote),
            Request::Rmdir(path) => format!("rmdir {}", quote(&path.format())),
            Request::Mv { from, to } => format!("mv {} {}", from, to),
            Request::Chmod { permission, remote } => format!("chmod {} {}", permission, remote),
            Request::Raw(command) => command.clone(),
            Request::Password(answer) => format!("-{}", answer),
            Request::HostKey { trust: false, .. } => String::new(),
            Request::HostKey { always: true, .. } => "y".to_string(),
            Request::HostKey { .. } => "s".to_string(),
            Request::Quota { direction, bytes } => {
                let dir = match direction {
                    Direction::Inbound => "recv",
                    Direction::Outbound => "send",
                };
                match bytes {
                    Some(n) => format!("quota {} {}", dir, n),
                    None => format!("quota {} -", dir),
                }
            }
        }
    }

    /// Line as it may appear in the log; secrets are masked.
    pub fn display(&self) -> String {
        match self {
            Request::Password(_) => "Pass: ********".to_string(),
            Request::Proxy(proxy) if !proxy.password.is_empty() => {
                let masked = ProxyConfig {
                    password: "****".to_string(),
                    ..proxy.clone()
                };
                Request::Proxy(masked).line()
            }
            other => other.line(),
        }
    }

    /// Answers and quota grants belong to a request already in flight.
    pub fn expects_done(&self) -> bool {
        !matches!(
            self,
            Request::Password(_) | Request::HostKey { .. } | Request::Quota { .. }
        )
    }
}

fn with_offset(line: String, offset: i64) -> String {
    if offset > 0 {
        format!("{} {}", line, offset)
    } else {
        line
    }
}

/// Local paths are passed as-is, quoted.
pub fn local_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use xfer_core::proxy::ProxyType;
    use xfer_core::server::ServerType;

    fn unix(path: &str) -> ServerPath {
        ServerPath::parse(path, ServerType::Unix).unwrap()
    }

    #[test]
    fn quoting_doubles_quotes() {
        assert_eq!(quote("plain"), "\"plain\"");
        assert_eq!(quote("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn wildcards_are_escaped_in_names_only() {
        assert_eq!(escape_wildcards("a*b?[c]\\d"), "a\\*b\\?\\[c\\]\\\\d");
        assert_eq!(remote_file(&unix("/dir*"), "f?.txt"), "\"/dir*/f\\?.txt\"");
    }

    #[test]
    fn command_lines() {
        let dir = unix("/home/u");
        assert_eq!(
            Request::Open {
                user: "u".into(),
                host: "example.com".into(),
                port: 22
            }
            .line(),
            "open \"u@example.com\" 22"
        );
        assert_eq!(Request::Cd(dir.clone()).line(), "cd \"/home/u\"");
        assert_eq!(
            Request::Get {
                remote: remote_file(&dir, "a.txt"),
                local: "/tmp/a.txt".into(),
                offset: 0
            }
            .line(),
            "get \"/home/u/a.txt\" \"/tmp/a.txt\""
        );
        assert_eq!(
            Request::Put {
                local: "/tmp/a.txt".into(),
                remote: remote_file(&dir, "a.txt"),
                offset: 10
            }
            .line(),
            "put \"/tmp/a.txt\" \"/home/u/a.txt\" 10"
        );
        let time = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            Request::Chmtime {
                remote: remote_file(&dir, "a.txt"),
                time
            }
            .line(),
            "chmtime 1577836800 \"/home/u/a.txt\""
        );
        assert_eq!(
            Request::Quota {
                direction: Direction::Inbound,
                bytes: Some(4096)
            }
            .line(),
            "quota recv 4096"
        );
        assert_eq!(
            Request::Quota {
                direction: Direction::Outbound,
                bytes: None
            }
            .line(),
            "quota send -"
        );
    }

    #[test]
    fn secrets_are_masked() {
        let proxy = ProxyConfig {
            proxy_type: ProxyType::Socks5,
            host: "proxy".into(),
            port: 1080,
            user: "pu".into(),
            password: "secret".into(),
        };
        assert_eq!(
            Request::Proxy(proxy.clone()).line(),
            "proxy SOCKS5 \"proxy\" 1080 \"pu\" \"secret\""
        );
        assert!(!Request::Proxy(proxy).display().contains("secret"));
        assert!(!Request::Password("pw".into()).display().contains("pw"));
        assert_eq!(Request::Password("pw".into()).line(), "-pw");
    }
}
