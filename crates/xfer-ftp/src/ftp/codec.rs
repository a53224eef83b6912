//! Character encoding on the control connection.

/// Encode one command line, CRLF appended.
///
/// Without UTF-8 the line is sent as ISO-8859-1; characters outside it
/// become `?`.
pub fn encode_command(command: &str, utf8: bool) -> Vec<u8> {
    let mut out = if utf8 {
        command.as_bytes().to_vec()
    } else {
        command
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect()
    };
    out.extend_from_slice(b"\r\n");
    out
}

/// Result of decoding one reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub text: String,
    /// The line was not valid UTF-8 although UTF-8 was expected.
    pub invalid_utf8: bool,
}

pub fn decode_line(raw: &[u8], utf8: bool) -> Decoded {
    match std::str::from_utf8(raw) {
        Ok(s) if utf8 => Decoded {
            text: s.to_string(),
            invalid_utf8: false,
        },
        Err(_) if utf8 => Decoded {
            text: latin1(raw),
            invalid_utf8: true,
        },
        _ => Decoded {
            text: latin1(raw),
            invalid_utf8: false,
        },
    }
}

fn latin1(raw: &[u8]) -> String {
    raw.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latin1_commands_replace_wide_chars() {
        assert_eq!(encode_command("CWD é", false), b"CWD \xe9\r\n".to_vec());
        assert_eq!(encode_command("CWD 日", false), b"CWD ?\r\n".to_vec());
        assert_eq!(encode_command("CWD é", true), "CWD é\r\n".as_bytes().to_vec());
    }

    #[test]
    fn invalid_utf8_falls_back_to_latin1() {
        let d = decode_line(b"257 \"/caf\xe9\"", true);
        assert!(d.invalid_utf8);
        assert_eq!(d.text, "257 \"/café\"");
        let d = decode_line("257 \"/café\"".as_bytes(), true);
        assert!(!d.invalid_utf8);
    }
}
