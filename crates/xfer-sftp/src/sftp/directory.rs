//! Mkdir, Delete, RemoveDir, Rename, Chmod and raw commands.
//!
//! Everything but Mkdir is a single request with full paths; the helper
//! does not need to be in the affected directory.

use crate::sftp::control::SftpControlSocket;
use crate::sftp::ops::{ChmodOp, DeleteOp, MkdirOp, MkdirState, RenameOp, SftpOp, SingleOp, Step};
use crate::sftp::request::{quote, remote_file, Request};
use std::collections::VecDeque;
use xfer_core::cache::UpdateKind;
use xfer_core::error::reports_already_exists;
use xfer_core::lock::{LockKey, LockOutcome, LockReason};
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;

/// The helper reports an existing directory as a failed mkdir; only the
/// error text tells it apart.
fn already_exists(error: Option<&str>) -> bool {
    error.is_some_and(reports_already_exists)
}

impl SftpControlSocket {
    /// Forget the working directory if it lies inside `dir`.
    fn leave_if_inside(&mut self, dir: &ServerPath) {
        if self.current_path == *dir || self.current_path.is_subdir_of(dir, false) {
            self.current_path = ServerPath::empty();
        }
    }

    // ─── Mkdir ───────────────────────────────────────────────────────

    pub(crate) fn start_mkdir(&mut self, path: ServerPath) -> SftpOp {
        self.logger.status(format!("Creating directory '{}'...", path));
        SftpOp::Mkdir(MkdirOp {
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
                    MkdirState::Mkdir
                } else {
                    MkdirState::FindParent
                };
                op.current = parent;
                Step::Continue
            }
            _ => Step::Done(ReplyCode::OK),
        }
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
                self.send_request(Request::Cd(op.current.clone()));
                Step::Wait
            }
            MkdirState::Mkdir => {
                let Some(segment) = op.segments.front() else {
                    return Step::Done(ReplyCode::OK);
                };
                let target = op.current.with_segment(segment);
                self.send_request(Request::Mkdir(target));
                Step::Wait
            }
        }
    }

    pub(crate) fn mkdir_done(&mut self, op: &mut MkdirOp, ok: bool) -> Step {
        match op.state {
            MkdirState::FindParent => {
                if ok {
                    self.current_path = op.current.clone();
                    op.state = MkdirState::Mkdir;
                    return Step::Continue;
                }
                match (op.current.parent(), op.current.last_segment()) {
                    (Some(parent), Some(last)) => {
                        op.segments.push_front(last.to_string());
                        op.current = parent;
                    }
                    // Not even the root could be entered; try creating from it anyway.
                    _ => op.state = MkdirState::Mkdir,
                }
                Step::Continue
            }
            MkdirState::Mkdir => {
                if !ok && !already_exists(self.last_error.as_deref()) {
                    return Step::Done(ReplyCode::ERROR);
                }
                if let Some(segment) = op.segments.pop_front() {
                    self.context().directory_cache().update_file(
                        &self.key,
                        &op.current,
                        &segment,
                        true,
                        UpdateKind::Dir,
                        -1,
                    );
                    op.current.add_segment(&segment);
                }
                if op.segments.is_empty() {
                    return Step::Done(ReplyCode::OK);
                }
                Step::Continue
            }
            MkdirState::Init | MkdirState::WaitLock => Step::Wait,
        }
    }

    // ─── Delete ──────────────────────────────────────────────────────

    pub(crate) fn start_delete(&mut self, path: ServerPath, files: Vec<String>) -> SftpOp {
        if files.len() == 1 {
            self.logger
                .status(format!("Deleting \"{}\"", path.format_filename(&files[0], false)));
        } else {
            self.logger
                .status(format!("Deleting {} files from \"{}\"", files.len(), path));
        }
        SftpOp::Delete(DeleteOp {
            path,
            files: files.into(),
            current: None,
            failed: false,
        })
    }

    pub(crate) fn delete_send(&mut self, op: &mut DeleteOp) -> Step {
        if op.current.is_some() {
            return Step::Wait;
        }
        let Some(file) = op.files.pop_front() else {
            return Step::Done(if op.failed { ReplyCode::ERROR } else { ReplyCode::OK });
        };
        self.send_request(Request::Rm(remote_file(&op.path, &file)));
        op.current = Some(file);
        Step::Wait
    }

    pub(crate) fn delete_done(&mut self, op: &mut DeleteOp, ok: bool) -> Step {
        let Some(file) = op.current.take() else {
            return Step::Wait;
        };
        if ok {
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

    // ─── RemoveDir ───────────────────────────────────────────────────

    pub(crate) fn start_rmdir(&mut self, path: ServerPath, subdir: String) -> SftpOp {
        self.logger.status(format!(
            "Removing directory \"{}\"",
            path.format_filename(&subdir, false)
        ));
        SftpOp::RemoveDir(SingleOp {
            path,
            name: subdir,
            sent: false,
        })
    }

    pub(crate) fn rmdir_send(&mut self, op: &mut SingleOp) -> Step {
        if op.sent {
            return Step::Wait;
        }
        let Some(target) = op.path.change_path(&op.name) else {
            self.logger.error(format!(
                "Could not build a path from \"{}\" and \"{}\"",
                op.path, op.name
            ));
            return Step::Done(ReplyCode::SYNTAXERROR);
        };
        op.sent = true;
        self.send_request(Request::Rmdir(target));
        Step::Wait
    }

    pub(crate) fn rmdir_done(&mut self, op: &mut SingleOp, ok: bool) -> Step {
        if !ok {
            return Step::Done(ReplyCode::ERROR);
        }
        self.context()
            .directory_cache()
            .remove_dir(&self.key, &op.path, &op.name);
        self.context()
            .path_cache()
            .invalidate_path(&self.key, &op.path, &op.name);
        let removed = op.path.with_segment(&op.name);
        self.leave_if_inside(&removed);
        Step::Done(ReplyCode::OK)
    }

    // ─── Rename ──────────────────────────────────────────────────────

    pub(crate) fn start_rename(
        &mut self,
        from_path: ServerPath,
        from_file: String,
        to_path: ServerPath,
        to_file: String,
    ) -> SftpOp {
        self.logger.status(format!(
            "Renaming \"{}\" to \"{}\"",
            from_path.format_filename(&from_file, false),
            to_path.format_filename(&to_file, false)
        ));
        SftpOp::Rename(RenameOp {
            from_path,
            from_file,
            to_path,
            to_file,
            sent: false,
        })
    }

    pub(crate) fn rename_send(&mut self, op: &mut RenameOp) -> Step {
        if op.sent {
            return Step::Wait;
        }
        op.sent = true;
        // The target is not glob-expanded, so only quoting applies.
        let request = Request::Mv {
            from: remote_file(&op.from_path, &op.from_file),
            to: quote(&op.to_path.format_filename(&op.to_file, false)),
        };
        self.send_request(request);
        Step::Wait
    }

    pub(crate) fn rename_done(&mut self, op: &mut RenameOp, ok: bool) -> Step {
        if !ok {
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

    // ─── Chmod ───────────────────────────────────────────────────────

    pub(crate) fn start_chmod(&mut self, path: ServerPath, file: String, permission: String) -> SftpOp {
        self.logger.status(format!(
            "Setting permissions of \"{}\" to \"{}\"",
            path.format_filename(&file, false),
            permission
        ));
        SftpOp::Chmod(ChmodOp {
            path,
            file,
            permission,
            sent: false,
        })
    }

    pub(crate) fn chmod_send(&mut self, op: &mut ChmodOp) -> Step {
        if op.sent {
            return Step::Wait;
        }
        op.sent = true;
        let request = Request::Chmod {
            permission: op.permission.clone(),
            remote: remote_file(&op.path, &op.file),
        };
        self.send_request(request);
        Step::Wait
    }

    pub(crate) fn chmod_done(&mut self, op: &mut ChmodOp, ok: bool) -> Step {
        if !ok {
            return Step::Done(ReplyCode::ERROR);
        }
        self.context()
            .directory_cache()
            .invalidate_file(&self.key, &op.path, &op.file);
        Step::Done(ReplyCode::OK)
    }

    // ─── Raw ─────────────────────────────────────────────────────────

    pub(crate) fn start_raw(&mut self, command: String) -> SftpOp {
        SftpOp::Raw(SingleOp {
            path: ServerPath::empty(),
            name: command,
            sent: false,
        })
    }

    /// A raw command may change anything, so nothing cached survives it.
    pub(crate) fn raw_send(&mut self, op: &mut SingleOp) -> Step {
        if op.sent {
            return Step::Wait;
        }
        op.sent = true;
        self.current_path = ServerPath::empty();
        self.context().directory_cache().invalidate_server(&self.key);
        self.context().path_cache().invalidate_server(&self.key);
        self.send_request(Request::Raw(op.name.clone()));
        Step::Wait
    }
}
