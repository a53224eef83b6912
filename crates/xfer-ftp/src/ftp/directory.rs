//! Single-command operations: DELE, RMD, RNFR/RNTO, SITE CHMOD and raw
//! commands.
//!
//! Each enters the target directory first. If that fails the command is
//! sent with a full path instead.

use crate::ftp::control::FtpControlSocket;
use crate::ftp::ops::{
    ChmodOp, CwdOp, DeleteOp, FtpOp, RawCommandOp, RemoveDirOp, RenameOp, SimpleState, Step,
};
use crate::ftp::reply::FtpReply;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;

fn enter(path: &ServerPath) -> Step {
    Step::Push(FtpOp::ChangeDir(CwdOp::new(path.clone(), "")))
}

impl FtpControlSocket {
    fn name_in(&self, path: &ServerPath, name: &str, in_dir: bool) -> String {
        if in_dir {
            name.to_string()
        } else {
            path.format_filename(name, false)
        }
    }

    /// Forget the working directory if it lies inside `dir`.
    fn leave_if_inside(&mut self, dir: &ServerPath) {
        if self.current_path == *dir || self.current_path.is_subdir_of(dir, false) {
            self.current_path = ServerPath::empty();
        }
    }

    // ─── Delete ──────────────────────────────────────────────────────

    pub(crate) fn start_delete(&mut self, path: ServerPath, files: Vec<String>) -> FtpOp {
        if files.len() == 1 {
            self.logger
                .status(format!("Deleting \"{}\"", path.format_filename(&files[0], false)));
        } else {
            self.logger
                .status(format!("Deleting {} files from \"{}\"", files.len(), path));
        }
        FtpOp::Delete(DeleteOp {
            path,
            files: files.into(),
            current: None,
            state: SimpleState::Init,
            in_dir: false,
            failed: false,
        })
    }

    pub(crate) fn delete_send(&mut self, op: &mut DeleteOp) -> Step {
        match op.state {
            SimpleState::Init => {
                op.state = SimpleState::WaitCwd;
                enter(&op.path)
            }
            SimpleState::Sent => {
                let Some(file) = op.files.pop_front() else {
                    return Step::Done(if op.failed { ReplyCode::ERROR } else { ReplyCode::OK });
                };
                let cmd = format!("DELE {}", self.name_in(&op.path, &file, op.in_dir));
                op.current = Some(file);
                self.send_command(&cmd);
                Step::Wait
            }
            SimpleState::WaitCwd | SimpleState::SentSecond => Step::Wait,
        }
    }

    pub(crate) fn delete_reply(&mut self, op: &mut DeleteOp, reply: &FtpReply) -> Step {
        let Some(file) = op.current.take() else {
            return Step::Wait;
        };
        if reply.is_completion() {
            self.context()
                .directory_cache()
                .remove_file(&self.key, &op.path, &file);
        } else {
            op.failed = true;
            self.context()
                .directory_cache()
                .invalidate_file(&self.key, &op.path, &file);
        }
        Step::Continue
    }

    pub(crate) fn delete_sub_result(&mut self, op: &mut DeleteOp, code: ReplyCode) -> Step {
        if code.is_disconnected() {
            return Step::Done(code);
        }
        op.in_dir = code.is_ok();
        op.state = SimpleState::Sent;
        Step::Continue
    }

    // ─── RemoveDir ───────────────────────────────────────────────────

    pub(crate) fn start_rmd(&mut self, path: ServerPath, subdir: String) -> FtpOp {
        self.logger.status(format!(
            "Removing directory \"{}\"",
            path.format_filename(&subdir, false)
        ));
        FtpOp::RemoveDir(RemoveDirOp {
            path,
            subdir,
            state: SimpleState::Init,
            in_dir: false,
        })
    }

    pub(crate) fn rmd_send(&mut self, op: &mut RemoveDirOp) -> Step {
        match op.state {
            SimpleState::Init => {
                op.state = SimpleState::WaitCwd;
                enter(&op.path)
            }
            SimpleState::Sent => {
                let cmd = format!("RMD {}", self.name_in(&op.path, &op.subdir, op.in_dir));
                self.send_command(&cmd);
                Step::Wait
            }
            SimpleState::WaitCwd | SimpleState::SentSecond => Step::Wait,
        }
    }

    pub(crate) fn rmd_reply(&mut self, op: &mut RemoveDirOp, reply: &FtpReply) -> Step {
        if !reply.is_completion() {
            return Step::Done(ReplyCode::ERROR);
        }
        self.context()
            .directory_cache()
            .remove_dir(&self.key, &op.path, &op.subdir);
        self.context()
            .path_cache()
            .invalidate_path(&self.key, &op.path, &op.subdir);
        let removed = op.path.with_segment(&op.subdir);
        self.leave_if_inside(&removed);
        Step::Done(ReplyCode::OK)
    }

    pub(crate) fn rmd_sub_result(&mut self, op: &mut RemoveDirOp, code: ReplyCode) -> Step {
        if code.is_disconnected() {
            return Step::Done(code);
        }
        op.in_dir = code.is_ok();
        op.state = SimpleState::Sent;
        Step::Continue
    }

    // ─── Rename ──────────────────────────────────────────────────────

    pub(crate) fn start_rename(
        &mut self,
        from_path: ServerPath,
        from_file: String,
        to_path: ServerPath,
        to_file: String,
    ) -> FtpOp {
        self.logger.status(format!(
            "Renaming \"{}\" to \"{}\"",
            from_path.format_filename(&from_file, false),
            to_path.format_filename(&to_file, false)
        ));
        FtpOp::Rename(RenameOp {
            from_path,
            from_file,
            to_path,
            to_file,
            state: SimpleState::Init,
            in_dir: false,
        })
    }

    pub(crate) fn rename_send(&mut self, op: &mut RenameOp) -> Step {
        match op.state {
            SimpleState::Init => {
                op.state = SimpleState::WaitCwd;
                enter(&op.from_path)
            }
            SimpleState::Sent => {
                let cmd = format!("RNFR {}", self.name_in(&op.from_path, &op.from_file, op.in_dir));
                self.send_command(&cmd);
                Step::Wait
            }
            SimpleState::SentSecond => {
                let same_dir = op.in_dir && op.from_path == op.to_path;
                let cmd = format!("RNTO {}", self.name_in(&op.to_path, &op.to_file, same_dir));
                self.send_command(&cmd);
                Step::Wait
            }
            SimpleState::WaitCwd => Step::Wait,
        }
    }

    pub(crate) fn rename_reply(&mut self, op: &mut RenameOp, reply: &FtpReply) -> Step {
        match op.state {
            SimpleState::Sent => {
                if !reply.is_intermediate() {
                    return Step::Done(ReplyCode::ERROR);
                }
                op.state = SimpleState::SentSecond;
                Step::Continue
            }
            SimpleState::SentSecond => {
                if !reply.is_completion() {
                    return Step::Done(ReplyCode::ERROR);
                }
                self.context().directory_cache().rename(
                    &self.key,
                    &op.from_path,
                    &op.from_file,
                    &op.to_path,
                    &op.to_file,
                );
                self.context()
                    .path_cache()
                    .invalidate_path(&self.key, &op.from_path, &op.from_file);
                let old = op.from_path.with_segment(&op.from_file);
                self.leave_if_inside(&old);
                Step::Done(ReplyCode::OK)
            }
            SimpleState::Init | SimpleState::WaitCwd => Step::Wait,
        }
    }

    pub(crate) fn rename_sub_result(&mut self, op: &mut RenameOp, code: ReplyCode) -> Step {
        if code.is_disconnected() {
            return Step::Done(code);
        }
        op.in_dir = code.is_ok();
        op.state = SimpleState::Sent;
        Step::Continue
    }

    // ─── Chmod ───────────────────────────────────────────────────────

    pub(crate) fn start_chmod(&mut self, path: ServerPath, file: String, permission: String) -> FtpOp {
        self.logger.status(format!(
            "Setting permissions of \"{}\" to \"{}\"",
            path.format_filename(&file, false),
            permission
        ));
        FtpOp::Chmod(ChmodOp {
            path,
            file,
            permission,
            state: SimpleState::Init,
            in_dir: false,
        })
    }

    pub(crate) fn chmod_send(&mut self, op: &mut ChmodOp) -> Step {
        match op.state {
            SimpleState::Init => {
                op.state = SimpleState::WaitCwd;
                enter(&op.path)
            }
            SimpleState::Sent => {
                let cmd = format!(
                    "SITE CHMOD {} {}",
                    op.permission,
                    self.name_in(&op.path, &op.file, op.in_dir)
                );
                self.send_command(&cmd);
                Step::Wait
            }
            SimpleState::WaitCwd | SimpleState::SentSecond => Step::Wait,
        }
    }

    pub(crate) fn chmod_reply(&mut self, op: &mut ChmodOp, reply: &FtpReply) -> Step {
        if !reply.is_completion() {
            return Step::Done(ReplyCode::ERROR);
        }
        self.context()
            .directory_cache()
            .invalidate_file(&self.key, &op.path, &op.file);
        Step::Done(ReplyCode::OK)
    }

    pub(crate) fn chmod_sub_result(&mut self, op: &mut ChmodOp, code: ReplyCode) -> Step {
        if code.is_disconnected() {
            return Step::Done(code);
        }
        op.in_dir = code.is_ok();
        op.state = SimpleState::Sent;
        Step::Continue
    }

    // ─── Raw ─────────────────────────────────────────────────────────

    pub(crate) fn start_raw_command(&mut self, command: String) -> FtpOp {
        FtpOp::Raw(RawCommandOp {
            command,
            state: SimpleState::Init,
        })
    }

    /// The command may change anything on the server, so nothing cached
    /// about it survives.
    pub(crate) fn raw_command_send(&mut self, op: &mut RawCommandOp) -> Step {
        if op.state != SimpleState::Init {
            return Step::Wait;
        }
        self.current_path = ServerPath::empty();
        self.current_type = None;
        self.context().directory_cache().invalidate_server(&self.key);
        self.context().path_cache().invalidate_server(&self.key);
        op.state = SimpleState::Sent;
        let cmd = op.command.clone();
        self.send_command(&cmd);
        Step::Wait
    }

    pub(crate) fn raw_command_reply(&mut self, _op: &mut RawCommandOp, reply: &FtpReply) -> Step {
        if reply.is_success() {
            Step::Done(ReplyCode::OK)
        } else {
            Step::Done(ReplyCode::ERROR)
        }
    }
}
