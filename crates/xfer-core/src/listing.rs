//! Directory listing model shared by both protocols and the caches.

use crate::path::ServerPath;
use bitflags::bitflags;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
    pub struct EntryFlags: u8 {
        const DIR = 0x01;
        const LINK = 0x02;
        /// Known to be out of date; the next lookup must hit the server.
        const UNSURE = 0x04;
    }
}

/// How much of a listing timestamp the server actually told us.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum TimePrecision {
    Day,
    Minutes,
    Seconds,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntryTime {
    pub time: DateTime<Utc>,
    pub precision: TimePrecision,
}

impl EntryTime {
    pub fn new(time: DateTime<Utc>, precision: TimePrecision) -> Self {
        Self { time, precision }
    }

    pub fn has_time_of_day(&self) -> bool {
        self.precision >= TimePrecision::Minutes
    }

    pub fn shifted(&self, minutes: i64) -> Self {
        Self {
            time: self.time + Duration::minutes(minutes),
            precision: self.precision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    /// -1 when unknown.
    pub size: i64,
    pub flags: EntryFlags,
    pub time: Option<EntryTime>,
    pub permissions: Option<String>,
    pub owner_group: Option<String>,
    pub target: Option<String>,
}

impl DirEntry {
    pub fn file(name: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            size,
            flags: EntryFlags::empty(),
            time: None,
            permissions: None,
            owner_group: None,
            target: None,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            flags: EntryFlags::DIR,
            ..Self::file(name, -1)
        }
    }

    pub fn is_dir(&self) -> bool {
        self.flags.contains(EntryFlags::DIR)
    }

    pub fn is_link(&self) -> bool {
        self.flags.contains(EntryFlags::LINK)
    }

    pub fn is_unsure(&self) -> bool {
        self.flags.contains(EntryFlags::UNSURE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryListing {
    pub path: ServerPath,
    pub entries: Vec<DirEntry>,
    pub first_list_time: DateTime<Utc>,
    pub failed: bool,
    /// Set when an entry was added or removed without a fresh listing.
    pub unsure: bool,
}

impl DirectoryListing {
    pub fn new(path: ServerPath, entries: Vec<DirEntry>) -> Self {
        Self {
            path,
            entries,
            first_list_time: Utc::now(),
            failed: false,
            unsure: false,
        }
    }

    pub fn failed(path: ServerPath) -> Self {
        Self {
            failed: true,
            ..Self::new(path, Vec::new())
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, name: &str, case_insensitive: bool) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name).or_else(|| {
            if case_insensitive {
                self.entries.iter().position(|e| e.name.eq_ignore_ascii_case(name))
            } else {
                None
            }
        })
    }

    pub fn has_unsure_entries(&self) -> bool {
        self.unsure || self.entries.iter().any(DirEntry::is_unsure)
    }

    pub fn has_dirs(&self) -> bool {
        self.entries.iter().any(DirEntry::is_dir)
    }

    /// First non-directory entry carrying a time of day, used for timezone calibration.
    pub fn first_timed_file(&self) -> Option<&DirEntry> {
        self.entries
            .iter()
            .find(|e| !e.is_dir() && e.time.as_ref().map_or(false, EntryTime::has_time_of_day))
    }

    /// Apply a server timezone correction to every timestamp.
    pub fn shift_times(&mut self, minutes: i64) {
        if minutes == 0 {
            return;
        }
        for entry in &mut self.entries {
            if let Some(t) = entry.time.as_mut() {
                *t = t.shifted(minutes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::ServerType;
    use chrono::TimeZone;

    fn listing() -> DirectoryListing {
        let mut f = DirEntry::file("Readme.TXT", 10);
        f.time = Some(EntryTime::new(
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 0).unwrap(),
            TimePrecision::Minutes,
        ));
        DirectoryListing::new(
            ServerPath::parse("/pub", ServerType::Unix).unwrap(),
            vec![DirEntry::dir("sub"), f],
        )
    }

    #[test]
    fn find_falls_back_to_case_insensitive() {
        let l = listing();
        assert_eq!(l.find("readme.txt", false), None);
        assert_eq!(l.find("readme.txt", true), Some(1));
        assert_eq!(l.find("sub", false), Some(0));
    }

    #[test]
    fn first_timed_file_skips_directories() {
        let l = listing();
        assert_eq!(l.first_timed_file().unwrap().name, "Readme.TXT");
    }

    #[test]
    fn shift_times_moves_every_timestamp() {
        let mut l = listing();
        l.shift_times(-60);
        let t = l.entries[1].time.as_ref().unwrap();
        assert_eq!(t.time, Utc.with_ymd_and_hms(2024, 1, 2, 2, 4, 0).unwrap());
    }

    #[test]
    fn unsure_entries_are_detected() {
        let mut l = listing();
        assert!(!l.has_unsure_entries());
        l.entries[0].flags |= EntryFlags::UNSURE;
        assert!(l.has_unsure_entries());
    }
}
