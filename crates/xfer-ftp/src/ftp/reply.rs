//! Control-channel reply framing (RFC 959 §4.2).
//!
//! Bytes are split into lines on CR, LF or NUL; empty lines are dropped and
//! over-long lines are clamped. Lines are then grouped into replies:
//!
//! ```text
//! 220-Welcome to my FTP server
//! 220-This is line 2
//! 220 End of greeting
//! ```

use bytes::BytesMut;

/// Longest reply line kept; the remainder up to the next terminator is dropped.
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// A complete single- or multi-line reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl FtpReply {
    pub fn new(code: u16, line: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![line.into()],
        }
    }

    /// First digit of the code, the only part the state machine interprets.
    pub fn class(&self) -> u16 {
        self.code / 100
    }

    pub fn is_preliminary(&self) -> bool {
        self.class() == 1
    }

    /// 2xx or 3xx.
    pub fn is_success(&self) -> bool {
        matches!(self.class(), 2 | 3)
    }

    pub fn is_completion(&self) -> bool {
        self.class() == 2
    }

    pub fn is_intermediate(&self) -> bool {
        self.class() == 3
    }

    /// Full reply text, all lines joined.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Last line without its code, e.g. `Directory created`.
    pub fn message(&self) -> &str {
        let last = self.lines.last().map(String::as_str).unwrap_or_default();
        last.get(4..).unwrap_or_default()
    }
}

/// Splits the raw byte stream into lines.
#[derive(Debug)]
pub struct LineSplitter {
    buf: BytesMut,
    max_line: usize,
    /// Dropping the tail of a clamped line until its terminator.
    discarding: bool,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_LEN)
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_line: max_line.max(4),
            discarding: false,
        }
    }

    /// Feed received bytes; returns every line completed by them. The
    /// boolean is true when the line was clamped.
    pub fn push(&mut self, data: &[u8]) -> Vec<(Vec<u8>, bool)> {
        let mut out = Vec::new();
        for &b in data {
            if matches!(b, b'\r' | b'\n' | 0) {
                let clamped = std::mem::take(&mut self.discarding);
                if !self.buf.is_empty() {
                    out.push((self.buf.split().to_vec(), clamped));
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            if self.buf.len() >= self.max_line {
                self.discarding = true;
                continue;
            }
            self.buf.extend_from_slice(&[b]);
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// What one decoded line did to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembled {
    /// The line completed a reply.
    Reply(FtpReply),
    /// The line belongs to an unfinished multi-line reply.
    Partial,
    /// A line outside any reply that does not start with a code.
    Malformed(String),
}

#[derive(Debug, Default)]
pub struct ReplyAssembler {
    multi: Option<(u16, Vec<String>)>,
}

impl ReplyAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_multiline(&self) -> bool {
        self.multi.is_some()
    }

    pub fn push_line(&mut self, line: String) -> Assembled {
        if let Some((code, mut lines)) = self.multi.take() {
            let done = parse_code(&line) == Some(code) && line.as_bytes().get(3).map_or(true, |&b| b == b' ');
            lines.push(line);
            if done {
                return Assembled::Reply(FtpReply { code, lines });
            }
            self.multi = Some((code, lines));
            return Assembled::Partial;
        }

        let Some(code) = parse_code(&line) else {
            return Assembled::Malformed(line);
        };
        if line.as_bytes().get(3) == Some(&b'-') {
            self.multi = Some((code, vec![line]));
            Assembled::Partial
        } else {
            Assembled::Reply(FtpReply { code, lines: vec![line] })
        }
    }

    pub fn reset(&mut self) {
        self.multi = None;
    }
}

/// The 3-digit code at the start of a line, first digit 1-5.
pub fn parse_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) || !(b'1'..=b'5').contains(&digits.as_bytes()[0]) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(s: &mut LineSplitter, data: &[u8]) -> Vec<String> {
        s.push(data)
            .into_iter()
            .map(|(l, _)| String::from_utf8(l).unwrap())
            .collect()
    }

    #[test]
    fn splits_on_cr_lf_and_nul() {
        let mut s = LineSplitter::new();
        assert_eq!(lines(&mut s, b"220 a\r\n230 b\n"), vec!["220 a", "230 b"]);
        assert_eq!(lines(&mut s, b"200 c\0200 d"), vec!["200 c"]);
        assert_eq!(s.pending(), 5);
        assert_eq!(lines(&mut s, b"\r"), vec!["200 d"]);
    }

    #[test]
    fn clamps_long_lines() {
        let mut s = LineSplitter::with_max_line(8);
        let out = s.push(b"200 abcdefghijkl\r\n200 ok\r\n");
        assert_eq!(out[0].0, b"200 abcd".to_vec());
        assert!(out[0].1);
        assert_eq!(out[1].0, b"200 ok".to_vec());
        assert!(!out[1].1);
    }

    #[test]
    fn multiline_waits_for_matching_terminator() {
        let mut a = ReplyAssembler::new();
        assert_eq!(a.push_line("211-Features:".into()), Assembled::Partial);
        assert_eq!(a.push_line(" MDTM".into()), Assembled::Partial);
        // Same code with a dash does not end the reply.
        assert_eq!(a.push_line("211-still going".into()), Assembled::Partial);
        assert_eq!(a.push_line("226 other code".into()), Assembled::Partial);
        match a.push_line("211 End".into()) {
            Assembled::Reply(r) => {
                assert_eq!(r.code, 211);
                assert_eq!(r.lines.len(), 5);
                assert_eq!(r.message(), "End");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!a.in_multiline());
    }

    #[test]
    fn bare_code_terminates() {
        let mut a = ReplyAssembler::new();
        a.push_line("220-hello".into());
        assert!(matches!(a.push_line("220".into()), Assembled::Reply(r) if r.code == 220));
    }

    #[test]
    fn junk_outside_reply_is_malformed() {
        let mut a = ReplyAssembler::new();
        assert_eq!(a.push_line("hello".into()), Assembled::Malformed("hello".into()));
        assert_eq!(a.push_line("999 nope".into()), Assembled::Malformed("999 nope".into()));
    }

    #[test]
    fn reply_classes() {
        let r = FtpReply::new(150, "150 Opening");
        assert!(r.is_preliminary() && !r.is_success());
        assert!(FtpReply::new(350, "350 x").is_success());
        assert!(!FtpReply::new(550, "550 x").is_success());
    }
}
