//! FileTransfer: enter the remote directory, `mtime` for downloads whose
//! time is not cached, the file-exists prompt, `get`/`put` and `chmtime`.
//!
//! The helper resumes natively when given an offset. Sizes come from the
//! directory cache only; there is no separate size request.

use crate::sftp::control::SftpControlSocket;
use crate::sftp::effect::SftpEffect;
use crate::sftp::ops::{CwdOp, SftpOp, Step, TransferOp, TransferState};
use crate::sftp::request::{local_arg, remote_file, Request};
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use xfer_core::cache::UpdateKind;
use xfer_core::command::FileTransferCommand;
use xfer_core::notification::{AsyncReply, AsyncRequest, FileExistsAction, FileExistsRequest, TransferStatus};
use xfer_core::reply::ReplyCode;

/// `mtime` replies with seconds since the epoch.
pub fn parse_mtime(text: &str) -> Option<DateTime<Utc>> {
    let secs: i64 = text.trim().parse().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn local_info(path: &Path) -> (i64, Option<DateTime<Utc>>) {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => (meta.len() as i64, meta.modified().ok().map(DateTime::<Utc>::from)),
        _ => (-1, None),
    }
}

/// Offset to resume from, or `None` when the target is already complete.
///
/// Only binary transfers compare sizes; an ASCII transfer's size on the
/// other side says nothing about how much of it arrived.
pub fn resume_offset(download: bool, binary: bool, local_size: i64, remote_size: i64) -> Option<i64> {
    let (source, target) = if download {
        (remote_size, local_size)
    } else {
        (local_size, remote_size)
    };
    if target <= 0 {
        return Some(0);
    }
    if binary && source >= 0 && source == target {
        return None;
    }
    Some(target)
}

impl SftpControlSocket {
    pub(crate) fn start_transfer(&mut self, command: FileTransferCommand) -> SftpOp {
        if command.download {
            self.logger.status(format!(
                "Starting download of {}",
                command.remote_path.format_filename(&command.remote_file, false)
            ));
        } else {
            self.logger
                .status(format!("Starting upload of {}", command.local_file.display()));
        }
        SftpOp::FileTransfer(TransferOp::new(command))
    }

    fn remote_arg(&self, op: &TransferOp) -> String {
        remote_file(&op.command.remote_path, &op.command.remote_file)
    }

    fn remote_info_from_cache(&mut self, op: &mut TransferOp) {
        let found = self.context().directory_cache().lookup_file(
            &self.key,
            &op.command.remote_path,
            &op.command.remote_file,
            false,
        );
        if let Some(entry) = found.entry.filter(|e| !e.is_dir() && !e.is_unsure()) {
            op.remote_size = entry.size;
            op.remote_time = entry.time.map(|t| t.time);
        }
    }

    pub(crate) fn transfer_send(&mut self, op: &mut TransferOp) -> Step {
        if op.sent {
            return Step::Wait;
        }
        match op.state {
            TransferState::Init => {
                let (size, time) = local_info(&op.command.local_file);
                op.local_size = size;
                op.local_time = time;
                if !op.command.download && size < 0 {
                    self.logger.error(format!(
                        "Failed to open \"{}\" for reading",
                        op.command.local_file.display()
                    ));
                    return Step::Done(ReplyCode::CRITICALERROR);
                }
                op.fresh_local = op.command.download && size < 0;
                op.resume = op.command.settings.resume;
                self.remote_info_from_cache(op);
                op.state = TransferState::WaitCwd;
                Step::Push(SftpOp::ChangeDir(CwdOp::new(op.command.remote_path.clone(), "")))
            }
            TransferState::WaitCwd => Step::Wait,
            TransferState::Mtime => {
                if !op.command.download || op.remote_time.is_some() {
                    op.state = TransferState::FileExists;
                    return Step::Continue;
                }
                op.sent = true;
                let remote = self.remote_arg(op);
                self.send_request(Request::Mtime(remote));
                Step::Wait
            }
            TransferState::FileExists => {
                let exists = if op.command.download {
                    op.local_size >= 0
                } else {
                    op.remote_size >= 0
                };
                if !exists || op.resume {
                    op.state = TransferState::Transfer;
                    return Step::Continue;
                }
                self.request(AsyncRequest::FileExists(FileExistsRequest {
                    download: op.command.download,
                    local_file: op.command.local_file.clone(),
                    local_size: op.local_size,
                    local_time: op.local_time,
                    remote_path: op.command.remote_path.clone(),
                    remote_file: op.command.remote_file.clone(),
                    remote_size: op.remote_size,
                    remote_time: op.remote_time,
                    binary: op.command.settings.binary,
                }));
                Step::Wait
            }
            TransferState::Transfer => self.begin_transfer(op),
            TransferState::Chmtime => {
                let Some(time) = op.local_time else {
                    return Step::Done(ReplyCode::OK);
                };
                op.sent = true;
                let remote = self.remote_arg(op);
                self.send_request(Request::Chmtime { remote, time });
                Step::Wait
            }
        }
    }

    fn begin_transfer(&mut self, op: &mut TransferOp) -> Step {
        let download = op.command.download;
        let offset = if op.resume {
            match resume_offset(download, op.command.settings.binary, op.local_size, op.remote_size) {
                Some(offset) => offset,
                None => {
                    self.logger.status("Target file is already complete, nothing to resume");
                    return Step::Done(ReplyCode::OK);
                }
            }
        } else {
            0
        };
        op.fresh_local |= download && offset == 0 && op.local_size < 0;
        let total = if download { op.remote_size } else { op.local_size };
        self.start_transfer_status(TransferStatus::new(total, offset, false));
        op.sent = true;
        let remote = self.remote_arg(op);
        let local = local_arg(&op.command.local_file);
        let request = if download {
            Request::Get { remote, local, offset }
        } else {
            Request::Put { local, remote, offset }
        };
        self.send_request(request);
        Step::Wait
    }

    pub(crate) fn transfer_reply(&mut self, op: &mut TransferOp, text: &str) -> Step {
        if op.state == TransferState::Mtime {
            op.remote_time = parse_mtime(text);
        }
        Step::Wait
    }

    pub(crate) fn transfer_done(&mut self, op: &mut TransferOp, ok: bool) -> Step {
        op.sent = false;
        match op.state {
            TransferState::Mtime => {
                op.state = TransferState::FileExists;
                Step::Continue
            }
            TransferState::Transfer if ok => self.transfer_finished(op),
            TransferState::Transfer => Step::Done(ReplyCode::ERROR),
            TransferState::Chmtime => {
                if !ok {
                    self.logger.warning("Could not set the modification time of the remote file");
                }
                Step::Done(ReplyCode::OK)
            }
            TransferState::Init | TransferState::WaitCwd | TransferState::FileExists => Step::Wait,
        }
    }

    fn transfer_finished(&mut self, op: &mut TransferOp) -> Step {
        let preserve = self.options.preserve_timestamps;
        if op.command.download {
            if let (true, Some(time)) = (preserve, op.remote_time) {
                self.emit(SftpEffect::SetLocalMtime {
                    path: op.command.local_file.clone(),
                    time,
                });
            }
            return Step::Done(ReplyCode::OK);
        }
        let (size, _) = local_info(&op.command.local_file);
        self.context().directory_cache().update_file(
            &self.key,
            &op.command.remote_path,
            &op.command.remote_file,
            true,
            UpdateKind::File,
            size,
        );
        if preserve && op.local_time.is_some() {
            op.state = TransferState::Chmtime;
            return Step::Continue;
        }
        Step::Done(ReplyCode::OK)
    }

    /// Entering the directory is only a probe; `get`/`put` use full paths.
    pub(crate) fn transfer_sub_result(&mut self, op: &mut TransferOp, code: ReplyCode) -> Step {
        if code.is_disconnected() {
            return Step::Done(code);
        }
        op.state = TransferState::Mtime;
        Step::Continue
    }

    pub(crate) fn transfer_async_reply(&mut self, op: &mut TransferOp, reply: AsyncReply) -> Step {
        let AsyncReply::FileExists(action) = reply else {
            return Step::Wait;
        };
        if op.state != TransferState::FileExists {
            return Step::Wait;
        }
        let download = op.command.download;
        let overwrite = match action {
            FileExistsAction::Overwrite => true,
            FileExistsAction::OverwriteNewer => {
                let (source, target) = if download {
                    (op.remote_time, op.local_time)
                } else {
                    (op.local_time, op.remote_time)
                };
                match (source, target) {
                    (Some(s), Some(t)) => s > t,
                    _ => true,
                }
            }
            FileExistsAction::OverwriteSizeDiffers => op.remote_size < 0 || op.remote_size != op.local_size,
            FileExistsAction::Resume => {
                op.resume = true;
                op.state = TransferState::Transfer;
                return Step::Continue;
            }
            FileExistsAction::Rename(name) => {
                if download {
                    let renamed = op.command.local_file.with_file_name(&name);
                    let (size, time) = local_info(&renamed);
                    op.command.local_file = renamed;
                    op.local_size = size;
                    op.local_time = time;
                    op.fresh_local = size < 0;
                } else {
                    op.command.remote_file = name;
                    op.remote_size = -1;
                    op.remote_time = None;
                    self.remote_info_from_cache(op);
                }
                return Step::Continue;
            }
            FileExistsAction::Skip => false,
        };
        if !overwrite {
            self.logger.status(format!(
                "Skipping {}",
                if download {
                    op.command.local_file.display().to_string()
                } else {
                    op.command.remote_file.clone()
                }
            ));
            return Step::Done(ReplyCode::OK);
        }
        op.resume = false;
        op.state = TransferState::Transfer;
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtime_parsing() {
        assert_eq!(parse_mtime("1577836800").unwrap().timestamp(), 1_577_836_800);
        assert_eq!(parse_mtime(" 0 ").unwrap().timestamp(), 0);
        assert!(parse_mtime("yesterday").is_none());
    }

    #[test]
    fn resume_decisions() {
        assert_eq!(resume_offset(true, true, -1, 100), Some(0));
        assert_eq!(resume_offset(true, true, 40, 100), Some(40));
        assert_eq!(resume_offset(true, true, 100, 100), None);
        // ASCII never short-circuits on equal sizes.
        assert_eq!(resume_offset(true, false, 100, 100), Some(100));
        assert_eq!(resume_offset(false, true, 100, 30), Some(30));
        assert_eq!(resume_offset(false, true, 100, -1), Some(0));
    }

    #[test]
    fn missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(local_info(&dir.path().join("nope")), (-1, None));
        let file = dir.path().join("f");
        std::fs::write(&file, b"abc").unwrap();
        assert_eq!(local_info(&file).0, 3);
    }
}
