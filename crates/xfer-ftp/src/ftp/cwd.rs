//! ChangeDir: CWD/CDUP with PWD to learn where the server put us.

use crate::ftp::control::FtpControlSocket;
use crate::ftp::ops::{CwdOp, CwdState, FtpOp, MkdirOp, MkdirState, Step};
use crate::ftp::reply::FtpReply;
use std::collections::VecDeque;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;
use xfer_core::server::ServerType;

/// Extract the directory from a `257 "/some ""quoted"" dir" is current` reply.
///
/// Doubled quotes inside the path stand for one quote. Without quotes the
/// first word of the message is used.
pub fn parse_pwd_text(message: &str) -> Option<String> {
    let Some(start) = message.find('"') else {
        let word = message.split_whitespace().next()?;
        return Some(word.to_string());
    };
    let mut out = String::new();
    let mut chars = message[start + 1..].chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
                out.push('"');
                continue;
            }
            return (!out.is_empty()).then_some(out);
        }
        out.push(c);
    }
    None
}

/// Refine a Unix assumption from the shape of a PWD result.
pub fn dialect_from_pwd(path: &str, current: ServerType) -> ServerType {
    if current != ServerType::Unix {
        return current;
    }
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if drive && path.get(2..3) == Some("/") {
        ServerType::DosFwdSlashes
    } else if drive {
        ServerType::Dos
    } else if path.starts_with('\'') {
        ServerType::Mvs
    } else if path.contains('[') && path.ends_with(']') {
        ServerType::Vms
    } else {
        current
    }
}

impl FtpControlSocket {
    /// Parse a PWD reply, adopting the dialect it implies.
    fn parse_pwd(&mut self, reply: &FtpReply) -> Option<ServerPath> {
        let text = parse_pwd_text(reply.message())?;
        let dialect = dialect_from_pwd(&text, self.server_type);
        if dialect != self.server_type {
            self.logger.debug(format!("PWD reply implies {:?} server", dialect));
            self.server_type = dialect;
        }
        let path = ServerPath::parse(&text, self.server_type);
        if path.is_none() {
            self.logger.warning(format!("Failed to parse returned path \"{}\"", text));
        }
        path
    }

    pub(crate) fn cwd_send(&mut self, op: &mut CwdOp) -> Step {
        match op.state {
            CwdState::Init => {
                if op.path.is_empty() && op.subdir.is_empty() {
                    if !self.current_path.is_empty() {
                        return Step::Done(ReplyCode::OK);
                    }
                    op.state = CwdState::Pwd;
                    self.send_command("PWD");
                    return Step::Wait;
                }
                let cached = self.context().path_cache().lookup(&self.key, &op.path, &op.subdir);
                if let Some(target) = cached {
                    if target == self.current_path {
                        return Step::Done(ReplyCode::OK);
                    }
                    op.target = Some(target);
                    op.state = CwdState::Cwd;
                    return Step::Continue;
                }
                if op.subdir.is_empty() {
                    if op.path == self.current_path {
                        return Step::Done(ReplyCode::OK);
                    }
                    op.state = CwdState::Cwd;
                    return Step::Continue;
                }
                if op.path == self.current_path || op.path.is_empty() {
                    op.state = if op.subdir == ".." { CwdState::Cdup } else { CwdState::CwdSubdir };
                    return Step::Continue;
                }
                op.state = CwdState::Cwd;
                Step::Continue
            }
            CwdState::Cwd => {
                let path = op.target.as_ref().unwrap_or(&op.path).format();
                self.current_path = ServerPath::empty();
                self.send_command(&format!("CWD {}", path));
                Step::Wait
            }
            CwdState::CwdSubdir => {
                self.current_path = ServerPath::empty();
                self.send_command(&format!("CWD {}", op.subdir));
                Step::Wait
            }
            CwdState::Cdup => {
                self.current_path = ServerPath::empty();
                self.send_command("CDUP");
                Step::Wait
            }
            CwdState::CwdDotDot => {
                self.send_command("CWD ..");
                Step::Wait
            }
            CwdState::Pwd | CwdState::PwdSubdir => {
                self.send_command("PWD");
                Step::Wait
            }
            CwdState::Mkdir => Step::Wait,
        }
    }

    pub(crate) fn cwd_reply(&mut self, op: &mut CwdOp, reply: &FtpReply) -> Step {
        match op.state {
            CwdState::Cwd => {
                if !reply.is_completion() {
                    return self.cwd_failed(op);
                }
                if let Some(target) = op.target.clone() {
                    self.current_path = target;
                    return Step::Done(ReplyCode::OK);
                }
                op.state = match op.subdir.as_str() {
                    "" => CwdState::Pwd,
                    ".." => CwdState::Cdup,
                    _ => CwdState::CwdSubdir,
                };
                Step::Continue
            }
            CwdState::CwdSubdir => {
                if !reply.is_completion() {
                    return self.cwd_failed(op);
                }
                op.state = CwdState::PwdSubdir;
                Step::Continue
            }
            CwdState::Cdup => {
                op.state = if reply.is_completion() {
                    CwdState::PwdSubdir
                } else {
                    CwdState::CwdDotDot
                };
                Step::Continue
            }
            CwdState::CwdDotDot => {
                if !reply.is_completion() {
                    return self.cwd_failed(op);
                }
                op.state = CwdState::PwdSubdir;
                Step::Continue
            }
            CwdState::Pwd | CwdState::PwdSubdir => {
                let parsed = if reply.is_completion() { self.parse_pwd(reply) } else { None };
                let resolved = parsed.or_else(|| op.target.clone()).or_else(|| {
                    if op.path.is_empty() {
                        None
                    } else {
                        op.path.change_path(&op.subdir)
                    }
                });
                let Some(path) = resolved else {
                    self.logger.error("Could not determine the current directory");
                    return Step::Done(ReplyCode::ERROR);
                };
                self.current_path = path;
                if !op.path.is_empty() {
                    self.context()
                        .path_cache()
                        .store(&self.key, &self.current_path, &op.path, &op.subdir);
                }
                Step::Done(ReplyCode::OK)
            }
            CwdState::Init | CwdState::Mkdir => Step::Wait,
        }
    }

    fn cwd_failed(&mut self, op: &mut CwdOp) -> Step {
        if op.try_mkdir && !op.tried_mkdir {
            op.tried_mkdir = true;
            let target = op.target.clone().or_else(|| op.path.change_path(&op.subdir));
            if let Some(path) = target {
                op.target = Some(path.clone());
                op.state = CwdState::Mkdir;
                return Step::Push(FtpOp::Mkdir(MkdirOp {
                    current: path.clone(),
                    path,
                    segments: VecDeque::new(),
                    state: MkdirState::Init,
                    lock: None,
                }));
            }
        }
        if op.link_discovery {
            self.logger.debug("Link is not a directory");
            return Step::Done(ReplyCode::ERROR | ReplyCode::LINKNOTDIR);
        }
        Step::Done(ReplyCode::ERROR)
    }

    pub(crate) fn cwd_sub_result(&mut self, op: &mut CwdOp, _code: ReplyCode) -> Step {
        // Retry the change whether or not the directory could be created;
        // the second failure ends the operation.
        op.state = CwdState::Cwd;
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_pwd_with_escapes() {
        assert_eq!(parse_pwd_text("\"/home/bob\" is current directory").as_deref(), Some("/home/bob"));
        assert_eq!(parse_pwd_text("\"/a \"\"b\"\"\" ok").as_deref(), Some("/a \"b\""));
        assert_eq!(parse_pwd_text("\"\" nothing"), None);
        assert_eq!(parse_pwd_text("\"/unterminated"), None);
    }

    #[test]
    fn unquoted_pwd_uses_first_word() {
        assert_eq!(parse_pwd_text("/srv/ftp is cwd").as_deref(), Some("/srv/ftp"));
    }

    #[test]
    fn dialect_detection() {
        assert_eq!(dialect_from_pwd("C:/inetpub", ServerType::Unix), ServerType::DosFwdSlashes);
        assert_eq!(dialect_from_pwd("C:\\inetpub", ServerType::Unix), ServerType::Dos);
        assert_eq!(dialect_from_pwd("'USER.DATA'", ServerType::Unix), ServerType::Mvs);
        assert_eq!(dialect_from_pwd("DISK$USER:[BOB]", ServerType::Unix), ServerType::Vms);
        assert_eq!(dialect_from_pwd("/home", ServerType::Unix), ServerType::Unix);
        assert_eq!(dialect_from_pwd("C:/x", ServerType::Vms), ServerType::Vms);
    }
}
