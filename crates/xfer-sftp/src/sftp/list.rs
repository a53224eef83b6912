//! List: cache short-circuit, ChangeDir, cache lock, then `ls`. The helper
//! sends one listentry per file: the `ls -l` text, the mtime and the name.

use crate::sftp::control::SftpControlSocket;
use crate::sftp::ops::{CwdOp, ListOp, ListState, SftpOp, Step};
use crate::sftp::request::Request;
use chrono::{TimeZone, Utc};
use xfer_core::command::ListFlags;
use xfer_core::listing::{DirEntry, DirectoryListing, EntryTime, TimePrecision};
use xfer_core::listing_parser::parse_listing;
use xfer_core::lock::{LockKey, LockOutcome, LockReason};
use xfer_core::notification::Notification;
use xfer_core::path::ServerPath;
use xfer_core::reply::ReplyCode;
use xfer_core::server::ServerType;

/// Build an entry from one listentry event. The name line wins over
/// whatever the text parses to, and a known mtime over the text's date.
pub fn entry_from_listentry(text: &str, mtime: i64, name: String) -> DirEntry {
    let mut entry = parse_listing(text.as_bytes(), ServerType::Unix)
        .into_iter()
        .next()
        .unwrap_or_else(|| DirEntry::file(name.clone(), -1));
    entry.name = name;
    if mtime > 0 {
        if let Some(time) = Utc.timestamp_opt(mtime, 0).single() {
            entry.time = Some(EntryTime::new(time, TimePrecision::Seconds));
        }
    }
    entry
}

impl SftpControlSocket {
    pub(crate) fn start_list(&mut self, path: ServerPath, subdir: String, flags: ListFlags) -> SftpOp {
        if path.is_empty() {
            self.logger.status("Retrieving directory listing...");
        } else {
            self.logger.status(format!(
                "Retrieving directory listing of \"{}\"...",
                path.format_filename(&subdir, false)
            ));
        }
        SftpOp::List(ListOp {
            path,
            subdir,
            flags,
            state: ListState::Init,
            lock: None,
            entries: Vec::new(),
        })
    }

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
                Step::Push(SftpOp::ChangeDir(cwd))
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
                let current = self.current_path.clone();
                if self.list_from_cache(&current, op.flags) {
                    return Step::Done(ReplyCode::OK);
                }
                op.state = ListState::Ls;
                op.entries.clear();
                self.send_request(Request::Ls);
                Step::Wait
            }
            ListState::WaitCwd | ListState::Ls => Step::Wait,
        }
    }

    pub(crate) fn list_sub_result(&mut self, op: &mut ListOp, code: ReplyCode) -> Step {
        if code.is_ok() {
            op.state = ListState::WaitLock;
            return Step::Continue;
        }
        let fallback = op.flags.contains(ListFlags::FALLBACK_CURRENT)
            && !code.is_disconnected()
            && !code.contains(ReplyCode::LINKNOTDIR);
        if fallback {
            self.logger.debug("Could not enter directory, listing the current one");
            op.flags.remove(ListFlags::FALLBACK_CURRENT);
            op.state = ListState::WaitCwd;
            return Step::Push(SftpOp::ChangeDir(CwdOp::new(ServerPath::empty(), "")));
        }
        Step::Done(code)
    }

    pub(crate) fn list_entry(&mut self, op: &mut ListOp, text: &str, mtime: i64, name: String) -> Step {
        if op.state != ListState::Ls {
            return Step::Wait;
        }
        if self.options.log_raw_listing {
            self.logger.log(xfer_core::notification::MessageType::RawList, text);
        }
        op.entries.push(entry_from_listentry(text, mtime, name));
        Step::Wait
    }

    pub(crate) fn list_done(&mut self, op: &mut ListOp, ok: bool) -> Step {
        if op.state != ListState::Ls {
            return Step::Wait;
        }
        if !ok {
            return Step::Done(ReplyCode::ERROR);
        }
        let path = self.current_path.clone();
        let entries = std::mem::take(&mut op.entries);
        self.context()
            .directory_cache()
            .store(&self.key, DirectoryListing::new(path.clone(), entries));
        self.notify(Notification::Listing {
            path,
            primary: true,
            failed: false,
        });
        Step::Done(ReplyCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listentry_name_and_time_win() {
        let e = entry_from_listentry(
            "-rw-r--r--    1 user     group        1234 Jan 01 12:00 shown name",
            1_577_836_800,
            "real name".into(),
        );
        assert_eq!(e.name, "real name");
        assert_eq!(e.size, 1234);
        assert_eq!(e.time.unwrap().time.timestamp(), 1_577_836_800);
    }

    #[test]
    fn directories_are_recognised() {
        let e = entry_from_listentry("drwxr-xr-x    2 user     group        4096 Jan 01 12:00 sub", 0, "sub".into());
        assert!(e.is_dir());
    }

    #[test]
    fn unparsable_text_still_yields_an_entry() {
        let e = entry_from_listentry("???", 0, "odd".into());
        assert_eq!(e.name, "odd");
        assert_eq!(e.size, -1);
    }
}
