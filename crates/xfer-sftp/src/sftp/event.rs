//! Events written by the SFTP helper on its stdout.
//!
//! Every event starts with one type byte (`'0'` + index) followed by a
//! fixed, type-specific number of LF-terminated lines:
//!
//! ```text
//! 0fzSftp started, protocol_version=11      Reply
//! 9-rw-r--r-- 1 u g 3 Jan 1 2020 a.txt      Listentry: text,
//! 1577836800                                   mtime,
//! a.txt                                        name
//! 11                                        Done: "1" succeeded
//! ```
//!
//! Requests (`8`) carry a kind line first; the kind decides how many lines
//! follow.

use bytes::{Buf, BytesMut};
use xfer_core::rate_limit::Direction;

/// Longest line accepted from the helper.
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("unknown event type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown request kind \"{0}\"")]
    UnknownRequest(String),
    #[error("invalid number \"{0}\" in {1} event")]
    InvalidNumber(String, &'static str),
    #[error("line longer than {} bytes", MAX_LINE_LEN)]
    LineTooLong,
    #[error("unexpected EOF")]
    UnexpectedEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Reply,
    Done,
    Error,
    Verbose,
    Status,
    Recv,
    Send,
    Close,
    Request,
    Listentry,
    Transfer,
    RequestPreamble,
    RequestInstruction,
    UsedQuotaRecv,
    UsedQuotaSend,
    KexAlgorithm,
    KexHash,
    KexCurve,
    CipherClientToServer,
    CipherServerToClient,
    MacClientToServer,
    MacServerToClient,
    Hostkey,
}

const TYPES: [EventType; 23] = [
    EventType::Reply,
    EventType::Done,
    EventType::Error,
    EventType::Verbose,
    EventType::Status,
    EventType::Recv,
    EventType::Send,
    EventType::Close,
    EventType::Request,
    EventType::Listentry,
    EventType::Transfer,
    EventType::RequestPreamble,
    EventType::RequestInstruction,
    EventType::UsedQuotaRecv,
    EventType::UsedQuotaSend,
    EventType::KexAlgorithm,
    EventType::KexHash,
    EventType::KexCurve,
    EventType::CipherClientToServer,
    EventType::CipherServerToClient,
    EventType::MacClientToServer,
    EventType::MacServerToClient,
    EventType::Hostkey,
];

impl EventType {
    pub fn from_byte(b: u8) -> Option<Self> {
        b.checked_sub(b'0').and_then(|i| TYPES.get(i as usize).copied())
    }

    pub fn as_byte(self) -> u8 {
        // TYPES lists every variant in declaration order.
        b'0' + self as u8
    }

    /// Lines that follow the type byte; `None` for requests.
    fn line_count(self) -> Option<usize> {
        match self {
            EventType::Recv | EventType::Send | EventType::Close => Some(0),
            EventType::Listentry => Some(3),
            EventType::Request => None,
            _ => Some(1),
        }
    }
}

/// Session parameters the helper reports after key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionInfo {
    KexAlgorithm,
    KexHash,
    KexCurve,
    CipherClientToServer,
    CipherServerToClient,
    MacClientToServer,
    MacServerToClient,
    Hostkey,
}

impl SessionInfo {
    pub fn label(self) -> &'static str {
        match self {
            SessionInfo::KexAlgorithm => "Key exchange algorithm",
            SessionInfo::KexHash => "Key exchange hash",
            SessionInfo::KexCurve => "Key exchange curve",
            SessionInfo::CipherClientToServer => "Cipher client to server",
            SessionInfo::CipherServerToClient => "Cipher server to client",
            SessionInfo::MacClientToServer => "MAC client to server",
            SessionInfo::MacServerToClient => "MAC server to client",
            SessionInfo::Hostkey => "Host key algorithm",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyKind {
    /// Host not seen before.
    New,
    /// A different key is cached for this host.
    Changed,
    /// Known host offering a key of a stronger algorithm.
    BetterAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperRequest {
    HostKey {
        kind: HostKeyKind,
        host: String,
        port: u16,
        fingerprint: String,
    },
    Password {
        prompt: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperEvent {
    Reply(String),
    /// End of the current request; `true` when it succeeded.
    Done(bool),
    Error(String),
    Verbose(String),
    Status(String),
    /// Bytes moved on the SSH connection.
    Activity(Direction),
    Close,
    Request(HelperRequest),
    ListEntry {
        text: String,
        /// Seconds since the epoch; 0 when unknown.
        mtime: i64,
        name: String,
    },
    Transfer(i64),
    RequestPreamble(String),
    RequestInstruction(String),
    /// Quota used since the last grant; the helper waits for a new one.
    QuotaUsed { direction: Direction, bytes: u64 },
    SessionInfo(SessionInfo, String),
}

/// Incremental decoder over the helper's stdout.
#[derive(Debug, Default)]
pub struct EventDecoder {
    buf: BytesMut,
    /// Type byte already consumed, lines of it still outstanding.
    pending: Option<(EventType, Vec<String>)>,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Nothing buffered and no event half-read.
    pub fn is_clean(&self) -> bool {
        self.buf.is_empty() && self.pending.is_none()
    }

    /// Call at EOF. Leftover bytes or a half-read event are a framing error.
    pub fn finish(&self) -> Result<(), FramingError> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(FramingError::UnexpectedEof)
        }
    }

    fn take_line(&mut self) -> Result<Option<String>, FramingError> {
        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(pos - 1);
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None if self.buf.len() > MAX_LINE_LEN => Err(FramingError::LineTooLong),
            None => Ok(None),
        }
    }

    /// Next complete event, `Ok(None)` when more input is needed.
    pub fn next_event(&mut self) -> Result<Option<HelperEvent>, FramingError> {
        let (kind, mut lines) = match self.pending.take() {
            Some(p) => p,
            None => {
                if !self.buf.has_remaining() {
                    return Ok(None);
                }
                let b = self.buf.get_u8();
                let kind = EventType::from_byte(b).ok_or(FramingError::UnknownType(b))?;
                (kind, Vec::new())
            }
        };
        loop {
            let needed = match kind.line_count() {
                Some(n) => n,
                None => match lines.first() {
                    Some(k) => request_line_count(k)?,
                    None => 1,
                },
            };
            if lines.len() >= needed {
                return build(kind, lines).map(Some);
            }
            match self.take_line()? {
                Some(line) => lines.push(line),
                None => {
                    self.pending = Some((kind, lines));
                    return Ok(None);
                }
            }
        }
    }
}

fn request_line_count(kind: &str) -> Result<usize, FramingError> {
    match kind {
        "0" | "1" | "2" => Ok(3),
        "3" => Ok(2),
        other => Err(FramingError::UnknownRequest(other.to_string())),
    }
}

fn number<T: std::str::FromStr>(text: &str, what: &'static str) -> Result<T, FramingError> {
    text.trim()
        .parse()
        .map_err(|_| FramingError::InvalidNumber(text.to_string(), what))
}

fn build(kind: EventType, lines: Vec<String>) -> Result<HelperEvent, FramingError> {
    let mut it = lines.into_iter();
    let mut next = || it.next().unwrap_or_default();
    Ok(match kind {
        EventType::Reply => HelperEvent::Reply(next()),
        EventType::Done => HelperEvent::Done(next().trim() == "1"),
        EventType::Error => HelperEvent::Error(next()),
        EventType::Verbose => HelperEvent::Verbose(next()),
        EventType::Status => HelperEvent::Status(next()),
        EventType::Recv => HelperEvent::Activity(Direction::Inbound),
        EventType::Send => HelperEvent::Activity(Direction::Outbound),
        EventType::Close => HelperEvent::Close,
        EventType::Request => {
            let request_kind = next();
            if request_kind == "3" {
                HelperEvent::Request(HelperRequest::Password { prompt: next() })
            } else {
                let kind = match request_kind.as_str() {
                    "0" => HostKeyKind::New,
                    "1" => HostKeyKind::Changed,
                    _ => HostKeyKind::BetterAlgorithm,
                };
                let endpoint = next();
                let (host, port) = match endpoint.rsplit_once(' ') {
                    Some((h, p)) => (h.to_string(), number(p, "request")?),
                    None => (endpoint.clone(), 22),
                };
                HelperEvent::Request(HelperRequest::HostKey {
                    kind,
                    host,
                    port,
                    fingerprint: next(),
                })
            }
        }
        EventType::Listentry => {
            let text = next();
            let mtime = number(&next(), "listentry")?;
            HelperEvent::ListEntry {
                text,
                mtime,
                name: next(),
            }
        }
        EventType::Transfer => HelperEvent::Transfer(number(&next(), "transfer")?),
        EventType::RequestPreamble => HelperEvent::RequestPreamble(next()),
        EventType::RequestInstruction => HelperEvent::RequestInstruction(next()),
        EventType::UsedQuotaRecv => HelperEvent::QuotaUsed {
            direction: Direction::Inbound,
            bytes: number(&next(), "quota")?,
        },
        EventType::UsedQuotaSend => HelperEvent::QuotaUsed {
            direction: Direction::Outbound,
            bytes: number(&next(), "quota")?,
        },
        EventType::KexAlgorithm => HelperEvent::SessionInfo(SessionInfo::KexAlgorithm, next()),
        EventType::KexHash => HelperEvent::SessionInfo(SessionInfo::KexHash, next()),
        EventType::KexCurve => HelperEvent::SessionInfo(SessionInfo::KexCurve, next()),
        EventType::CipherClientToServer => HelperEvent::SessionInfo(SessionInfo::CipherClientToServer, next()),
        EventType::CipherServerToClient => HelperEvent::SessionInfo(SessionInfo::CipherServerToClient, next()),
        EventType::MacClientToServer => HelperEvent::SessionInfo(SessionInfo::MacClientToServer, next()),
        EventType::MacServerToClient => HelperEvent::SessionInfo(SessionInfo::MacServerToClient, next()),
        EventType::Hostkey => HelperEvent::SessionInfo(SessionInfo::Hostkey, next()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<HelperEvent> {
        let mut dec = EventDecoder::new();
        dec.push(data);
        let mut out = Vec::new();
        while let Some(ev) = dec.next_event().unwrap() {
            out.push(ev);
        }
        assert!(dec.finish().is_ok());
        out
    }

    #[test]
    fn type_bytes_match_declaration_order() {
        for (i, t) in TYPES.iter().enumerate() {
            assert_eq!(t.as_byte(), b'0' + i as u8);
            assert_eq!(EventType::from_byte(t.as_byte()), Some(*t));
        }
        assert_eq!(EventType::from_byte(b'0' + 23), None);
        assert_eq!(EventType::from_byte(b' '), None);
    }

    #[test]
    fn decodes_mixed_stream() {
        let events = decode_all(
            b"0fzSftp started, protocol_version=11\n5\n9-rw-r--r-- 1 u g 3 Jan  1  2020 a.txt\n1577836800\na.txt\n:4096\n11\n",
        );
        assert_eq!(
            events,
            vec![
                HelperEvent::Reply("fzSftp started, protocol_version=11".into()),
                HelperEvent::Activity(Direction::Inbound),
                HelperEvent::ListEntry {
                    text: "-rw-r--r-- 1 u g 3 Jan  1  2020 a.txt".into(),
                    mtime: 1_577_836_800,
                    name: "a.txt".into(),
                },
                HelperEvent::Transfer(4096),
                HelperEvent::Done(true),
            ]
        );
    }

    #[test]
    fn requests_have_kind_specific_lengths() {
        let events = decode_all(b"80\nexample.com 2222\nSHA256:abc\n83\nPassword:\n");
        assert_eq!(
            events,
            vec![
                HelperEvent::Request(HelperRequest::HostKey {
                    kind: HostKeyKind::New,
                    host: "example.com".into(),
                    port: 2222,
                    fingerprint: "SHA256:abc".into(),
                }),
                HelperEvent::Request(HelperRequest::Password {
                    prompt: "Password:".into()
                }),
            ]
        );
    }

    #[test]
    fn split_input_resumes_mid_event() {
        let mut dec = EventDecoder::new();
        dec.push(b"9text\n12");
        assert_eq!(dec.next_event().unwrap(), None);
        dec.push(b"\nname\r\n");
        assert_eq!(
            dec.next_event().unwrap(),
            Some(HelperEvent::ListEntry {
                text: "text".into(),
                mtime: 12,
                name: "name".into()
            })
        );
        assert!(dec.is_clean());
    }

    #[test]
    fn truncated_event_is_unexpected_eof() {
        let mut dec = EventDecoder::new();
        dec.push(b"9only one line\n");
        assert_eq!(dec.next_event().unwrap(), None);
        assert_eq!(dec.finish(), Err(FramingError::UnexpectedEof));
    }

    #[test]
    fn garbage_is_rejected() {
        let mut dec = EventDecoder::new();
        dec.push(b"zzz\n");
        assert_eq!(dec.next_event(), Err(FramingError::UnknownType(b'z')));

        let mut dec = EventDecoder::new();
        dec.push(b":lots\n");
        assert!(matches!(dec.next_event(), Err(FramingError::InvalidNumber(_, "transfer"))));

        let mut dec = EventDecoder::new();
        dec.push(b"89\n");
        assert_eq!(dec.next_event(), Err(FramingError::UnknownRequest("9".into())));
    }
}
