//! ChangeDir: `pwd` to learn the start directory, `cd` to move. The helper
//! answers `cd` with the directory it ended up in.

use crate::sftp::control::SftpControlSocket;
use crate::sftp::ops::{CwdOp, CwdState, Step};
use crate::sftp::request::Request;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;

impl SftpControlSocket {
    pub(crate) fn cwd_send(&mut self, op: &mut CwdOp) -> Step {
        if op.state != CwdState::Init {
            return Step::Wait;
        }
        if op.path.is_empty() && op.subdir.is_empty() {
            if !self.current_path.is_empty() {
                return Step::Done(ReplyCode::OK);
            }
            op.state = CwdState::Pwd;
            self.send_request(Request::Pwd);
            return Step::Wait;
        }
        let target = if op.subdir.is_empty() {
            Some(op.path.clone())
        } else {
            self.context()
                .path_cache()
                .lookup(&self.key, &op.path, &op.subdir)
                .or_else(|| op.path.change_path(&op.subdir))
        };
        let Some(target) = target else {
            self.logger.error(format!(
                "Could not build a path from \"{}\" and \"{}\"",
                op.path, op.subdir
            ));
            return Step::Done(ReplyCode::ERROR);
        };
        if target == self.current_path {
            return Step::Done(ReplyCode::OK);
        }
        op.target = Some(target.clone());
        op.state = CwdState::Cd;
        self.current_path = ServerPath::empty();
        self.send_request(Request::Cd(target));
        Step::Wait
    }

    pub(crate) fn cwd_reply(&mut self, op: &mut CwdOp, text: &str) -> Step {
        let parsed = ServerPath::parse(text.trim(), self.server.server_type);
        if parsed.is_none() {
            self.logger
                .warning(format!("Failed to parse returned path \"{}\"", text));
        }
        op.reported = parsed;
        Step::Wait
    }

    pub(crate) fn cwd_done(&mut self, op: &mut CwdOp, ok: bool) -> Step {
        match op.state {
            CwdState::Pwd => match (ok, op.reported.take()) {
                (true, Some(path)) => {
                    self.current_path = path;
                    Step::Done(ReplyCode::OK)
                }
                _ => Step::Done(ReplyCode::ERROR),
            },
            CwdState::Cd if ok => {
                let Some(path) = op.reported.take().or_else(|| op.target.clone()) else {
                    return Step::Done(ReplyCode::ERROR);
                };
                if !op.subdir.is_empty() {
                    self.context()
                        .path_cache()
                        .store(&self.key, &path, &op.path, &op.subdir);
                }
                self.current_path = path;
                Step::Done(ReplyCode::OK)
            }
            CwdState::Cd => {
                if op.link_discovery {
                    self.logger.verbose("Link is not a directory");
                    Step::Done(ReplyCode::ERROR | ReplyCode::LINKNOTDIR)
                } else {
                    Step::Done(ReplyCode::ERROR)
                }
            }
            CwdState::Init => Step::Wait,
        }
    }
}
