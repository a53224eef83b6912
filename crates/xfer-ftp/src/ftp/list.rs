//! List: cache short-circuit, ChangeDir, cache lock, MLSD or LIST
//! (`LIST -a` when hidden files are wanted) and timezone calibration.

use crate::ftp::control::FtpControlSocket;
use crate::ftp::effect::{TransferMode, TransferSetup};
use crate::ftp::file_transfer::parse_mdtm;
use crate::ftp::ops::{CwdOp, FtpOp, ListCommand, ListOp, ListState, RawTransferOp, Step};
use crate::ftp::reply::FtpReply;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use xfer_core::capabilities::{CapState, Capability};
use xfer_core::command::ListFlags;
use xfer_core::listing::{DirEntry, DirectoryListing};
use xfer_core::lock::{LockKey, LockOutcome, LockReason};
use xfer_core::notification::Notification;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;

/// Replies some servers give for an empty directory instead of an empty
/// listing.
pub fn is_misleading_empty(reply: &FtpReply) -> bool {
    let msg = reply.message().trim().to_lowercase();
    match reply.code {
        550 => matches!(
            msg.as_str(),
            "no members found." | "no data sets found." | "no files found."
        ),
        450 => msg == "no files found" || msg == "no files found.",
        _ => false,
    }
}

/// `LIST -a` was understood if its result contains every name the plain
/// LIST returned.
pub fn hidden_listing_includes(hidden: &[DirEntry], plain: &[DirEntry]) -> bool {
    let names: HashSet<&str> = hidden.iter().map(|e| e.name.as_str()).collect();
    plain.iter().all(|e| names.contains(e.name.as_str()))
}

/// Difference between MDTM and the listed time, rounded to a quarter hour.
/// `None` for offsets no real timezone has.
pub fn timezone_offset_minutes(listed: DateTime<Utc>, mdtm: DateTime<Utc>) -> Option<i64> {
    let diff = (mdtm - listed).num_seconds();
    let quarter = 15 * 60;
    let rounded = (diff as f64 / quarter as f64).round() as i64 * 15;
    (rounded.abs() <= 24 * 60).then_some(rounded)
}

impl FtpControlSocket {
    pub(crate) fn start_list(&mut self, path: ServerPath, subdir: String, flags: ListFlags) -> FtpOp {
        if path.is_empty() {
            self.logger.status("Retrieving directory listing...");
        } else if subdir.is_empty() {
            self.logger.status(format!("Retrieving directory listing of \"{}\"...", path));
        } else {
            self.logger.status(format!(
                "Retrieving directory listing of \"{}\"...",
                path.format_filename(&subdir, false)
            ));
        }
        FtpOp::List(ListOp::new(path, subdir, flags))
    }

    /// Serve the listing from the cache if that is allowed and possible.
    fn list_from_cache(&mut self, path: &ServerPath, flags: ListFlags) -> bool {
        if path.is_empty() || flags.contains(ListFlags::REFRESH) {
            return false;
        }
        let cached = self.context().directory_cache().lookup(&self.key, path);
        match cached {
            Some(c) if c.is_usable() || (flags.contains(ListFlags::AVOID) && !c.listing.failed) => {
                self.logger.debug(format!("Using cached listing of \"{}\"", path));
                self.notify(Notification::Listing {
                    path: path.clone(),
                    primary: true,
                    failed: false,
                });
                true
            }
            _ => false,
        }
    }

    pub(crate) fn data_passive(&self) -> bool {
        match self.server.pasv_mode {
            xfer_core::server::PasvMode::Passive => true,
            xfer_core::server::PasvMode::Active => false,
            xfer_core::server::PasvMode::Default => self.options.use_passive,
        }
    }

    fn list_transfer(&mut self, command: ListCommand) -> Step {
        let setup = TransferSetup {
            mode: TransferMode::List {
                server_type: self.server_type,
                latin1: !self.use_utf8,
            },
            protect: self.protect_data,
            binary: false,
        };
        let passive = self.data_passive();
        Step::Push(FtpOp::RawTransfer(RawTransferOp::new(command.as_str(), setup, 0, passive)))
    }

    pub(crate) fn list_send(&mut self, op: &mut ListOp) -> Step {
        match op.state {
            ListState::Init => {
                let known = if op.subdir.is_empty() {
                    Some(op.path.clone()).filter(|p| !p.is_empty())
                } else {
                    self.context().path_cache().lookup(&self.key, &op.path, &op.subdir)
                };
                if let Some(target) = known {
                    if self.list_from_cache(&target, op.flags) {
                        return Step::Done(ReplyCode::OK);
                    }
                }
                op.state = ListState::WaitCwd;
                let mut cwd = CwdOp::new(op.path.clone(), op.subdir.clone());
                cwd.link_discovery = op.flags.contains(ListFlags::LINK);
                Step::Push(FtpOp::ChangeDir(cwd))
            }
            ListState::WaitLock => {
                let key = LockKey::new(self.key.clone(), self.current_path.clone(), LockReason::List);
                let outcome = self.context().acquire_lock(self.env.engine, &key);
                if op.lock.as_ref() != Some(&key) {
                    if let Some(old) = op.lock.replace(key) {
                        self.context().release_lock(self.env.engine, &old);
                    }
                }
                if outcome == LockOutcome::Waiting {
                    self.logger.debug("Waiting for another engine listing this directory");
                    return Step::Wait;
                }
                // Another engine may have filled the cache while we waited.
                let current = self.current_path.clone();
                if self.list_from_cache(&current, op.flags) {
                    return Step::Done(ReplyCode::OK);
                }
                op.command = if self.capability(Capability::MlsdCommand) == CapState::Yes {
                    ListCommand::Mlsd
                } else if self.options.view_hidden_files && self.capability(Capability::ListHidden) != CapState::No {
                    ListCommand::ListHidden
                } else {
                    ListCommand::List
                };
                self.logger
                    .status(format!("Listing directory {}", self.current_path));
                op.state = ListState::WaitTransfer;
                self.list_transfer(op.command)
            }
            ListState::Mdtm => {
                let Some(entry) = op.mdtm_entry.as_ref() else {
                    return self.list_finish(op);
                };
                let cmd = format!("MDTM {}", entry.name);
                self.send_command(&cmd);
                Step::Wait
            }
            ListState::WaitCwd | ListState::WaitTransfer | ListState::WaitPlainTransfer => Step::Wait,
        }
    }

    pub(crate) fn list_sub_result(&mut self, op: &mut ListOp, code: ReplyCode) -> Step {
        match op.state {
            ListState::WaitCwd => {
                if code.is_ok() {
                    op.state = ListState::WaitLock;
                    return Step::Continue;
                }
                if code.contains(ReplyCode::LINKNOTDIR) {
                    return Step::Done(code);
                }
                if op.flags.contains(ListFlags::FALLBACK_CURRENT) && !op.fell_back {
                    op.fell_back = true;
                    op.state = ListState::WaitCwd;
                    return Step::Push(FtpOp::ChangeDir(CwdOp::new(ServerPath::empty(), String::new())));
                }
                Step::Done(code)
            }
            ListState::WaitTransfer => {
                let entries = self.transfer_listing.take().unwrap_or_default();
                if op.command == ListCommand::ListHidden && self.capability(Capability::ListHidden) == CapState::Unknown {
                    if code.is_ok() {
                        op.hidden_entries = Some(entries);
                        op.command = ListCommand::List;
                        op.state = ListState::WaitPlainTransfer;
                        return self.list_transfer(ListCommand::List);
                    }
                    if !code.is_disconnected() {
                        self.logger.debug("LIST -a failed, retrying without it");
                        self.set_capability(Capability::ListHidden, CapState::No);
                        op.command = ListCommand::List;
                        return self.list_transfer(ListCommand::List);
                    }
                }
                if code.is_error() {
                    return Step::Done(code);
                }
                self.list_parsed(op, entries)
            }
            ListState::WaitPlainTransfer => {
                let hidden = op.hidden_entries.take().unwrap_or_default();
                let plain = self.transfer_listing.take();
                let entries = match plain {
                    Some(plain) if code.is_ok() => {
                        if hidden_listing_includes(&hidden, &plain) {
                            self.set_capability(Capability::ListHidden, CapState::Yes);
                            hidden
                        } else {
                            self.logger.debug("Server ignores LIST -a, using plain LIST");
                            self.set_capability(Capability::ListHidden, CapState::No);
                            plain
                        }
                    }
                    _ if code.is_disconnected() => return Step::Done(code),
                    _ => hidden,
                };
                self.list_parsed(op, entries)
            }
            ListState::Init | ListState::WaitLock | ListState::Mdtm => Step::Done(ReplyCode::INTERNALERROR),
        }
    }

    fn list_parsed(&mut self, op: &mut ListOp, entries: Vec<DirEntry>) -> Step {
        let mut listing = DirectoryListing::new(self.current_path.clone(), entries);
        let manual = i64::from(self.server.timezone_offset);
        let detected = match self.capability(Capability::TimezoneOffset) {
            CapState::Yes => self
                .context()
                .capabilities()
                .get_number(&self.key, Capability::TimezoneOffset)
                .unwrap_or(0),
            _ => 0,
        };
        listing.shift_times(manual + detected);

        let calibrate = self.capability(Capability::TimezoneOffset) == CapState::Unknown
            && self.capability(Capability::MdtmCommand) == CapState::Yes;
        if calibrate {
            if let Some(entry) = listing.first_timed_file().cloned() {
                op.mdtm_entry = Some(entry);
                op.listing = Some(listing);
                op.state = ListState::Mdtm;
                return Step::Continue;
            }
        }
        op.listing = Some(listing);
        self.list_finish(op)
    }

    fn list_finish(&mut self, op: &mut ListOp) -> Step {
        let Some(listing) = op.listing.as_ref() else {
            return Step::Done(ReplyCode::INTERNALERROR);
        };
        let path = listing.path.clone();
        self.context().directory_cache().store(&self.key, listing.clone());
        self.notify(Notification::Listing {
            path,
            primary: true,
            failed: false,
        });
        Step::Done(ReplyCode::OK)
    }

    pub(crate) fn list_reply(&mut self, op: &mut ListOp, reply: &FtpReply) -> Step {
        if op.state != ListState::Mdtm {
            return Step::Wait;
        }
        let listed = op.mdtm_entry.take().and_then(|e| e.time).map(|t| t.time);
        let mdtm = if reply.is_completion() { parse_mdtm(reply.message()) } else { None };
        match (listed, mdtm) {
            (Some(listed), Some(mdtm)) => match timezone_offset_minutes(listed, mdtm) {
                Some(offset) => {
                    self.logger
                        .debug(format!("Server timezone offset is {} minutes", offset));
                    self.context()
                        .capabilities()
                        .set_number(&self.key, Capability::TimezoneOffset, offset);
                    if let Some(listing) = op.listing.as_mut() {
                        listing.shift_times(offset);
                    }
                }
                None => self.set_capability(Capability::TimezoneOffset, CapState::No),
            },
            _ => self.set_capability(Capability::TimezoneOffset, CapState::No),
        }
        self.list_finish(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn misleading_empty_replies() {
        assert!(is_misleading_empty(&FtpReply::new(550, "550 No members found.")));
        assert!(is_misleading_empty(&FtpReply::new(550, "550 No data sets found.")));
        assert!(is_misleading_empty(&FtpReply::new(450, "450 No files found")));
        assert!(!is_misleading_empty(&FtpReply::new(550, "550 Permission denied")));
        assert!(!is_misleading_empty(&FtpReply::new(226, "226 No files found.")));
    }

    #[test]
    fn hidden_inclusion_check() {
        let hidden = vec![DirEntry::file(".profile", 1), DirEntry::file("a", 2)];
        let plain = vec![DirEntry::file("a", 2)];
        assert!(hidden_listing_includes(&hidden, &plain));
        // A server treating "-a" as a file name returns nothing useful.
        assert!(!hidden_listing_includes(&[], &plain));
    }

    #[test]
    fn timezone_rounding() {
        let listed = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mdtm = Utc.with_ymd_and_hms(2024, 5, 1, 12, 1, 30).unwrap();
        assert_eq!(timezone_offset_minutes(listed, mdtm), Some(120));
        let far = Utc.with_ymd_and_hms(2024, 5, 3, 12, 0, 0).unwrap();
        assert_eq!(timezone_offset_minutes(listed, far), None);
    }
}
