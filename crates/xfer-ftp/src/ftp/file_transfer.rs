//! FileTransfer: remote size and time, the file-exists decision, the
//! large-file resume probe, the transfer itself and timestamp preservation.

use crate::ftp::control::FtpControlSocket;
use crate::ftp::effect::{FtpEffect, TransferMode, TransferSetup};
use crate::ftp::ops::{CwdOp, FtpOp, ListOp, RawTransferOp, Step, TransferOp, TransferState};
use crate::ftp::reply::FtpReply;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;
use xfer_core::cache::UpdateKind;
use xfer_core::capabilities::{CapState, Capability};
use xfer_core::command::{FileTransferCommand, ListFlags};
use xfer_core::notification::{AsyncReply, AsyncRequest, FileExistsAction, FileExistsRequest, Notification, TransferStatus};
use xfer_core::operation::TransferEndReason;
use xfer_core::reply::ReplyCode;

/// `YYYYMMDDhhmmss[.sss]` as sent by MDTM, always UTC.
pub fn parse_mdtm(text: &str) -> Option<DateTime<Utc>> {
    let digits = text.trim().split(['.', ' ']).next()?;
    if digits.len() != 14 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(digits, "%Y%m%d%H%M%S").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

pub fn format_mfmt(time: &DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%S").to_string()
}

/// `213 12345` and the like.
fn parse_size(message: &str) -> Option<i64> {
    message.split_whitespace().next()?.parse().ok().filter(|s: &i64| *s >= 0)
}

fn local_info(path: &Path) -> (i64, Option<DateTime<Utc>>) {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            let time = meta.modified().ok().map(DateTime::<Utc>::from);
            (meta.len() as i64, time)
        }
        _ => (-1, None),
    }
}

/// Size thresholds above which some servers mishandle REST.
const RESUME_LIMITS: [(i64, Capability, u8); 2] = [
    (1 << 32, Capability::Resume4GbBug, 4),
    (1 << 31, Capability::Resume2GbBug, 2),
];

impl FtpControlSocket {
    fn reset_transfer_result(&mut self) {
        self.last_end_reason = TransferEndReason::None;
        self.last_transferred = 0;
    }

    pub(crate) fn start_transfer(&mut self, command: FileTransferCommand) -> FtpOp {
        if command.download {
            self.logger.status(format!(
                "Starting download of {}",
                command.remote_path.format_filename(&command.remote_file, false)
            ));
        } else {
            self.logger
                .status(format!("Starting upload of {}", command.local_file.display()));
        }
        FtpOp::FileTransfer(TransferOp::new(command))
    }

    fn remote_name(&self, op: &TransferOp) -> String {
        if op.in_dir {
            op.command.remote_file.clone()
        } else {
            op.command
                .remote_path
                .format_filename(&op.command.remote_file, false)
        }
    }

    /// Fill in remote size and time from the directory cache.
    fn remote_info_from_cache(&mut self, op: &mut TransferOp) -> bool {
        let found = self.context().directory_cache().lookup_file(
            &self.key,
            &op.command.remote_path,
            &op.command.remote_file,
            false,
        );
        match found.entry {
            Some(entry) if !entry.is_dir() && !entry.is_unsure() => {
                op.remote_size = entry.size;
                op.remote_time = entry.time.map(|t| t.time);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn transfer_send(&mut self, op: &mut TransferOp) -> Step {
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
                    return Step::Done(ReplyCode::ERROR | ReplyCode::CRITICALERROR);
                }
                op.fresh_local = op.command.download && size < 0;
                op.resume = op.command.settings.resume;
                self.remote_info_from_cache(op);
                op.state = TransferState::WaitCwd;
                let mut cwd = CwdOp::new(op.command.remote_path.clone(), "");
                cwd.try_mkdir = !op.command.download;
                Step::Push(FtpOp::ChangeDir(cwd))
            }
            TransferState::Size => {
                if op.remote_size >= 0 {
                    op.state = TransferState::Mdtm;
                    return Step::Continue;
                }
                match self.capability(Capability::SizeCommand) {
                    CapState::No => {
                        let cached = self
                            .context()
                            .directory_cache()
                            .does_exist(&self.key, &op.command.remote_path);
                        if cached.is_some() {
                            op.state = TransferState::Mdtm;
                            return Step::Continue;
                        }
                        op.state = TransferState::WaitList;
                        Step::Push(FtpOp::List(ListOp::new(
                            op.command.remote_path.clone(),
                            String::new(),
                            ListFlags::empty(),
                        )))
                    }
                    _ => {
                        let cmd = format!("SIZE {}", self.remote_name(op));
                        self.send_command(&cmd);
                        Step::Wait
                    }
                }
            }
            TransferState::Mdtm => {
                let wanted = op.remote_time.is_none()
                    && (op.command.download || op.remote_size >= 0)
                    && self.capability(Capability::MdtmCommand) != CapState::No;
                if !wanted {
                    op.state = TransferState::FileExists;
                    return Step::Continue;
                }
                let cmd = format!("MDTM {}", self.remote_name(op));
                self.send_command(&cmd);
                Step::Wait
            }
            TransferState::FileExists => {
                let exists = if op.command.download {
                    op.local_size >= 0
                } else {
                    op.remote_size >= 0
                };
                if !exists || op.resume {
                    op.state = TransferState::ResumeTest;
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
            TransferState::ResumeTest => self.check_resume(op),
            TransferState::Transfer => self.begin_transfer(op),
            TransferState::Mfmt => {
                let Some(time) = op.local_time else {
                    return Step::Done(ReplyCode::OK);
                };
                let cmd = format!("MFMT {} {}", format_mfmt(&time), self.remote_name(op));
                self.send_command(&cmd);
                Step::Wait
            }
            TransferState::WaitCwd | TransferState::WaitList => Step::Wait,
        }
    }

    /// Decide whether the transfer can go ahead as a resume, needs the
    /// REST probe first, or has nothing left to do.
    fn check_resume(&mut self, op: &mut TransferOp) -> Step {
        if !op.resume || !op.command.download {
            op.state = TransferState::Transfer;
            return Step::Continue;
        }
        if op.local_size <= 0 {
            op.resume = false;
            op.state = TransferState::Transfer;
            return Step::Continue;
        }
        if op.command.settings.binary && op.remote_size == op.local_size {
            self.logger
                .status("Local file is already complete, nothing to transfer");
            return Step::Done(ReplyCode::OK);
        }
        for (limit, cap, gb) in RESUME_LIMITS {
            if op.local_size < limit {
                continue;
            }
            match self.capability(cap) {
                CapState::Yes => {
                    if op.remote_size == op.local_size {
                        return Step::Done(ReplyCode::OK);
                    }
                    self.logger
                        .error(format!("Server does not support resume of files > {} GB.", gb));
                    op.end_reason = TransferEndReason::FailedResumetest;
                    return Step::Done(ReplyCode::ERROR | ReplyCode::CRITICALERROR);
                }
                CapState::Unknown if op.remote_size > op.local_size => {
                    self.logger.status("Testing resume capabilities of server");
                    let setup = TransferSetup {
                        mode: TransferMode::ResumeTest,
                        protect: self.protect_data,
                        binary: true,
                    };
                    let cmd = format!("RETR {}", self.remote_name(op));
                    let passive = self.data_passive();
                    self.reset_transfer_result();
                    return Step::Push(FtpOp::RawTransfer(RawTransferOp::new(
                        cmd,
                        setup,
                        op.remote_size - 1,
                        passive,
                    )));
                }
                _ => {}
            }
        }
        op.state = TransferState::Transfer;
        Step::Continue
    }

    fn begin_transfer(&mut self, op: &mut TransferOp) -> Step {
        let download = op.command.download;
        let offset = match (op.resume, download) {
            (true, true) if op.local_size > 0 => op.local_size,
            (true, false) if op.remote_size > 0 => op.remote_size,
            _ => 0,
        };
        let name = self.remote_name(op);
        let (command, mode, rest) = if download {
            if offset == 0 {
                op.fresh_local |= op.local_size < 0;
            }
            (
                format!("RETR {}", name),
                TransferMode::Download {
                    local_file: op.command.local_file.clone(),
                    offset,
                    total_size: op.remote_size,
                },
                offset,
            )
        } else {
            let verb = if offset > 0 { "APPE" } else { "STOR" };
            (
                format!("{} {}", verb, name),
                TransferMode::Upload {
                    local_file: op.command.local_file.clone(),
                    offset,
                },
                0,
            )
        };
        let total = if download { op.remote_size } else { op.local_size };
        self.notify(Notification::TransferStatus(Some(TransferStatus::new(total, offset, false))));
        let setup = TransferSetup {
            mode,
            protect: self.protect_data,
            binary: op.command.settings.binary,
        };
        let passive = self.data_passive();
        self.reset_transfer_result();
        op.state = TransferState::Transfer;
        Step::Push(FtpOp::RawTransfer(RawTransferOp::new(command, setup, rest, passive)))
    }

    pub(crate) fn transfer_reply(&mut self, op: &mut TransferOp, reply: &FtpReply) -> Step {
        match op.state {
            TransferState::Size => {
                if reply.is_completion() {
                    self.set_capability(Capability::SizeCommand, CapState::Yes);
                    op.remote_size = parse_size(reply.message()).unwrap_or(-1);
                } else if matches!(reply.code, 500 | 502) {
                    // 550 means the file is missing, not that SIZE is.
                    self.set_capability(Capability::SizeCommand, CapState::No);
                }
                op.state = TransferState::Mdtm;
                Step::Continue
            }
            TransferState::Mdtm => {
                if reply.is_completion() {
                    if let Some(time) = parse_mdtm(reply.message()) {
                        self.set_capability(Capability::MdtmCommand, CapState::Yes);
                        op.remote_time = Some(time);
                    }
                } else if matches!(reply.code, 500 | 502) {
                    self.set_capability(Capability::MdtmCommand, CapState::No);
                }
                op.state = TransferState::FileExists;
                Step::Continue
            }
            TransferState::Mfmt => {
                if !reply.is_completion() {
                    self.logger.debug("MFMT failed, remote timestamp not preserved");
                }
                Step::Done(ReplyCode::OK)
            }
            _ => Step::Wait,
        }
    }

    pub(crate) fn transfer_sub_result(&mut self, op: &mut TransferOp, code: ReplyCode) -> Step {
        match op.state {
            TransferState::WaitCwd => {
                if code.is_disconnected() {
                    return Step::Done(code);
                }
                op.in_dir = code.is_ok();
                op.state = TransferState::Size;
                Step::Continue
            }
            TransferState::WaitList => {
                if code.is_disconnected() {
                    return Step::Done(code);
                }
                self.remote_info_from_cache(op);
                // The listing moved the working directory.
                op.in_dir = self.current_path == op.command.remote_path;
                op.state = TransferState::Mdtm;
                Step::Continue
            }
            TransferState::ResumeTest => {
                let reason = self.last_end_reason;
                let cap = RESUME_LIMITS
                    .iter()
                    .find(|(limit, _, _)| op.local_size >= *limit)
                    .map(|(_, cap, _)| *cap);
                // The data task ends with FailedResumetest unless exactly
                // one byte arrived after the REST offset.
                if code.is_ok() && reason.is_success() {
                    if let Some(cap) = cap {
                        self.set_capability(cap, CapState::No);
                    }
                    op.state = TransferState::Transfer;
                    return Step::Continue;
                }
                if reason != TransferEndReason::FailedResumetest {
                    op.end_reason = reason;
                    return Step::Done(code);
                }
                if let Some(cap) = cap {
                    self.set_capability(cap, CapState::Yes);
                }
                self.logger.error("Server does not support resume of large files.");
                op.end_reason = TransferEndReason::FailedResumetest;
                Step::Done(ReplyCode::ERROR | ReplyCode::CRITICALERROR)
            }
            TransferState::Transfer => {
                op.end_reason = self.last_end_reason;
                op.transfer_started = self.last_transferred > 0;
                if code.is_error() {
                    if !op.command.download {
                        self.context().directory_cache().invalidate_file(
                            &self.key,
                            &op.command.remote_path,
                            &op.command.remote_file,
                        );
                    }
                    return Step::Done(code);
                }
                self.transfer_done(op)
            }
            _ => Step::Done(code),
        }
    }

    fn transfer_done(&mut self, op: &mut TransferOp) -> Step {
        let preserve = self.options.preserve_timestamps;
        if op.command.download {
            if let (true, Some(time)) = (preserve, op.remote_time) {
                self.emit(FtpEffect::SetLocalMtime {
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
        if preserve && op.local_time.is_some() && self.capability(Capability::MfmtCommand) == CapState::Yes {
            op.state = TransferState::Mfmt;
            return Step::Continue;
        }
        Step::Done(ReplyCode::OK)
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
                op.state = TransferState::ResumeTest;
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
                    op.state = TransferState::FileExists;
                } else {
                    op.command.remote_file = name;
                    op.remote_size = -1;
                    op.remote_time = None;
                    self.remote_info_from_cache(op);
                    op.state = TransferState::Size;
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
        op.state = TransferState::ResumeTest;
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mdtm_parsing() {
        let t = parse_mdtm("20240102030405").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        assert!(parse_mdtm("20240102030405.123").is_some());
        assert!(parse_mdtm("2024").is_none());
        assert!(parse_mdtm("not a time").is_none());
    }

    #[test]
    fn mfmt_format() {
        let t = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 58).unwrap();
        assert_eq!(format_mfmt(&t), "20231231235958");
    }

    #[test]
    fn size_parsing() {
        assert_eq!(parse_size("1048576"), Some(1_048_576));
        assert_eq!(parse_size("abc"), None);
    }

    #[test]
    fn missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(local_info(&dir.path().join("nope")).0, -1);
        let file = dir.path().join("f");
        std::fs::write(&file, b"12345").unwrap();
        assert_eq!(local_info(&file).0, 5);
    }
}
