//! Mkdir: find the deepest existing ancestor with CWD, then alternate
//! MKD/CWD for the missing segments. Anything unexpected falls back to a
//! single MKD of the full path.

use crate::ftp::control::FtpControlSocket;
use crate::ftp::ops::{FtpOp, MkdirOp, MkdirState, Step};
use crate::ftp::reply::FtpReply;
use std::collections::VecDeque;
use xfer_core::cache::UpdateKind;
use xfer_core::error::reports_already_exists;
use xfer_core::lock::{LockKey, LockOutcome, LockReason};
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;

/// Servers answer MKD for an existing directory with an error; the text
/// tells it apart from a real failure.
fn already_exists(reply: &FtpReply) -> bool {
    reply.code / 100 == 5 && reports_already_exists(&reply.text())
}

impl FtpControlSocket {
    pub(crate) fn start_mkdir(&mut self, path: ServerPath) -> FtpOp {
        self.logger.status(format!("Creating directory '{}'...", path));
        FtpOp::Mkdir(MkdirOp {
            current: path.clone(),
            path,
            segments: VecDeque::new(),
            state: MkdirState::Init,
            lock: None,
        })
    }

    fn mkdir_plan(&mut self, op: &mut MkdirOp) -> Step {
        if !self.current_path.is_empty()
            && (self.current_path == op.path || self.current_path.is_subdir_of(&op.path, false))
        {
            return Step::Done(ReplyCode::OK);
        }
        match (op.path.parent(), op.path.last_segment()) {
            (Some(parent), Some(last)) => {
                op.segments.push_back(last.to_string());
                op.state = if parent == self.current_path {
                    MkdirState::Mkd
                } else {
                    MkdirState::FindParent
                };
                op.current = parent;
            }
            _ => op.state = MkdirState::FullMkd,
        }
        Step::Continue
    }

    pub(crate) fn mkdir_send(&mut self, op: &mut MkdirOp) -> Step {
        match op.state {
            MkdirState::Init | MkdirState::WaitLock => {
                let key = LockKey::new(self.key.clone(), op.path.clone(), LockReason::Mkdir);
                let outcome = self.context().acquire_lock(self.env.engine, &key);
                op.lock = Some(key);
                if outcome == LockOutcome::Waiting {
                    self.logger.debug("Waiting for another engine to finish with this directory");
                    op.state = MkdirState::WaitLock;
                    return Step::Wait;
                }
                self.mkdir_plan(op)
            }
            MkdirState::FindParent => {
                self.current_path = ServerPath::empty();
                self.send_command(&format!("CWD {}", op.current.format()));
                Step::Wait
            }
            MkdirState::Mkd => {
                let Some(segment) = op.segments.front().cloned() else {
                    return Step::Done(ReplyCode::OK);
                };
                self.send_command(&format!("MKD {}", segment));
                Step::Wait
            }
            MkdirState::CwdSegment => {
                let Some(segment) = op.segments.front().cloned() else {
                    return Step::Done(ReplyCode::OK);
                };
                self.current_path = ServerPath::empty();
                self.send_command(&format!("CWD {}", segment));
                Step::Wait
            }
            MkdirState::FullMkd => {
                self.send_command(&format!("MKD {}", op.path.format()));
                Step::Wait
            }
        }
    }

    pub(crate) fn mkdir_reply(&mut self, op: &mut MkdirOp, reply: &FtpReply) -> Step {
        match op.state {
            MkdirState::FindParent => {
                if reply.is_completion() {
                    self.current_path = op.current.clone();
                    op.state = MkdirState::Mkd;
                    return Step::Continue;
                }
                match (op.current.parent(), op.current.last_segment()) {
                    (Some(parent), Some(last)) => {
                        op.segments.push_front(last.to_string());
                        op.current = parent;
                    }
                    _ => op.state = MkdirState::FullMkd,
                }
                Step::Continue
            }
            MkdirState::Mkd => {
                let created = reply.is_completion() || already_exists(reply);
                if !created {
                    op.state = MkdirState::FullMkd;
                    return Step::Continue;
                }
                if let Some(segment) = op.segments.front() {
                    self.context().directory_cache().update_file(
                        &self.key,
                        &op.current,
                        segment,
                        true,
                        UpdateKind::Dir,
                        -1,
                    );
                }
                op.state = MkdirState::CwdSegment;
                Step::Continue
            }
            MkdirState::CwdSegment => {
                if !reply.is_completion() {
                    op.state = MkdirState::FullMkd;
                    return Step::Continue;
                }
                if let Some(segment) = op.segments.pop_front() {
                    op.current.add_segment(&segment);
                }
                self.current_path = op.current.clone();
                if op.segments.is_empty() {
                    return Step::Done(ReplyCode::OK);
                }
                op.state = MkdirState::Mkd;
                Step::Continue
            }
            MkdirState::FullMkd => {
                if reply.is_completion() || already_exists(reply) {
                    if let (Some(parent), Some(last)) = (op.path.parent(), op.path.last_segment()) {
                        self.context().directory_cache().update_file(
                            &self.key,
                            &parent,
                            last,
                            true,
                            UpdateKind::Dir,
                            -1,
                        );
                    }
                    Step::Done(ReplyCode::OK)
                } else {
                    Step::Done(ReplyCode::ERROR)
                }
            }
            MkdirState::Init | MkdirState::WaitLock => Step::Wait,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exists_detection() {
        assert!(already_exists(&FtpReply::new(550, "550 Directory already exists")));
        assert!(already_exists(&FtpReply::new(521, "521 \"/a\" EXISTS")));
        assert!(!already_exists(&FtpReply::new(550, "550 Permission denied")));
        assert!(!already_exists(&FtpReply::new(
            550,
            "550 Cannot create x: parent directory does not exist"
        )));
    }
}
