//! Streaming directory listing parser.
//!
//! Supports three formats:
//! 1. **MLSD facts** (RFC 3659): `type=file;size=1234;modify=20260101120000; file.txt`
//! 2. **Unix-style** (`ls -l`): `-rwxr-xr-x 1 owner group 1234 Jan  1 12:00 file.txt`
//! 3. **DOS/IIS-style**: `01-01-26  12:00AM       1234 file.txt`
//!
//! Lines matching none of them are kept as bare names. Bytes may arrive in
//! arbitrary chunks; a line is parsed once its terminator is seen.

use crate::listing::{DirEntry, EntryFlags, EntryTime, TimePrecision};
use crate::server::ServerType;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNIX_LINE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStTlL-]{9}[+.@]?)\s+   # permissions
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (?:(\S+)\s+)?                        # group
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s         # date
        (.+)$                                # filename (possibly with -> target)
        ",
    )
    .expect("static regex");
    static ref DOS_LINE: Regex = Regex::new(
        r"(?x)
        ^(\d{2}-\d{2}-(?:\d{2}|\d{4}))\s+   # date
        (\d{1,2}:\d{2}\s*(?:AM|PM)?)\s+     # time
        (<DIR>|\d+)\s+                     # size or <DIR>
        (.+)$                              # filename
        ",
    )
    .expect("static regex");
    static ref TOTAL_LINE: Regex = Regex::new(r"^total\s+\d+").expect("static regex");
}

/// Incremental parser fed from the data channel.
#[derive(Debug)]
pub struct ListingParser {
    server_type: ServerType,
    latin1: bool,
    pending: Vec<u8>,
    entries: Vec<DirEntry>,
    now: DateTime<Utc>,
}

impl ListingParser {
    pub fn new(server_type: ServerType) -> Self {
        Self {
            server_type,
            latin1: false,
            pending: Vec::new(),
            entries: Vec::new(),
            now: Utc::now(),
        }
    }

    /// Decode raw lines as ISO-8859-1 instead of UTF-8.
    pub fn with_latin1(mut self, latin1: bool) -> Self {
        self.latin1 = latin1;
        self
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n' || b == 0) {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.add_raw(&line[..line.len() - 1]);
        }
    }

    fn add_raw(&mut self, raw: &[u8]) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = if self.latin1 {
            raw.iter().map(|&b| b as char).collect()
        } else {
            String::from_utf8_lossy(raw).into_owned()
        };
        self.add_line(&line);
    }

    pub fn add_line(&mut self, line: &str) {
        let line = line.trim_end();
        if line.trim().is_empty() || TOTAL_LINE.is_match(line) {
            return;
        }
        if let Some(entry) = self.parse_line(line) {
            if entry.name != "." && entry.name != ".." {
                self.entries.push(entry);
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Flush any unterminated trailing line and return the entries.
    pub fn finish(mut self) -> Vec<DirEntry> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.add_raw(&rest);
        }
        self.entries
    }

    fn parse_line(&self, line: &str) -> Option<DirEntry> {
        if line.contains(';') && line.contains('=') {
            if let Some(e) = parse_mlsd(line) {
                return Some(e);
            }
        }
        if let Some(e) = self.parse_unix(line) {
            return Some(e);
        }
        if let Some(e) = parse_dos(line) {
            return Some(e);
        }
        let name = if self.server_type == ServerType::Vms {
            line.split_whitespace().next()?.to_string()
        } else {
            line.to_string()
        };
        Some(DirEntry::file(name, -1))
    }

    fn parse_unix(&self, line: &str) -> Option<DirEntry> {
        let caps = UNIX_LINE.captures(line)?;
        let perms = caps.get(1)?.as_str();
        let owner = caps.get(3).map(|m| m.as_str());
        let group = caps.get(4).map(|m| m.as_str());
        let size = caps.get(5)?.as_str().parse::<i64>().unwrap_or(-1);
        let date_str = caps.get(6)?.as_str();
        let name_raw = caps.get(7)?.as_str().trim_start();

        let mut flags = EntryFlags::empty();
        match perms.as_bytes().first() {
            Some(b'd') => flags |= EntryFlags::DIR,
            Some(b'l') => flags |= EntryFlags::LINK,
            _ => {}
        }

        let (name, target) = if flags.contains(EntryFlags::LINK) {
            match name_raw.find(" -> ") {
                Some(pos) => (name_raw[..pos].to_string(), Some(name_raw[pos + 4..].to_string())),
                None => (name_raw.to_string(), None),
            }
        } else {
            (name_raw.to_string(), None)
        };

        Some(DirEntry {
            name,
            size,
            flags,
            time: parse_unix_date(date_str, self.now),
            permissions: Some(perms.to_string()),
            owner_group: match (owner, group) {
                (Some(o), Some(g)) => Some(format!("{} {}", o, g)),
                (Some(o), None) => Some(o.to_string()),
                _ => None,
            },
            target,
        })
    }
}

// ─── MLSD ────────────────────────────────────────────────────────────

fn parse_mlsd(line: &str) -> Option<DirEntry> {
    let (facts_str, name) = match line.find("; ") {
        Some(pos) => (&line[..pos + 1], &line[pos + 2..]),
        None => {
            let pos = line.rfind(' ')?;
            (&line[..pos], &line[pos + 1..])
        }
    };
    if name.is_empty() {
        return None;
    }

    let mut entry = DirEntry::file(name, -1);
    let mut saw_type = false;
    for fact in facts_str.split(';') {
        let Some((key, value)) = fact.trim().split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                saw_type = true;
                let lower = value.to_ascii_lowercase();
                if lower == "cdir" || lower == "pdir" {
                    // Dropped by the dot filter.
                    entry.name = ".".to_string();
                }
                if lower == "dir" {
                    entry.flags |= EntryFlags::DIR;
                } else if let Some(rest) = lower.strip_prefix("os.unix=slink") {
                    entry.flags |= EntryFlags::DIR | EntryFlags::LINK;
                    if let Some(target) = rest.strip_prefix(':') {
                        if !target.is_empty() {
                            let offset = value.len() - target.len();
                            entry.target = Some(value[offset..].to_string());
                        }
                    }
                } else if lower.starts_with("os.unix=symlink") {
                    entry.flags |= EntryFlags::DIR | EntryFlags::LINK;
                }
            }
            "size" | "sizd" => entry.size = value.parse().unwrap_or(-1),
            "modify" => {
                entry.time = parse_mlsd_time(value);
            }
            "unix.mode" => entry.permissions = Some(value.to_string()),
            "perm" => {
                if entry.permissions.is_none() {
                    entry.permissions = Some(value.to_string());
                }
            }
            "unix.owner" | "unix.user" => {
                entry.owner_group = Some(match entry.owner_group.take() {
                    Some(g) => format!("{} {}", value, g),
                    None => value.to_string(),
                });
            }
            "unix.group" => {
                entry.owner_group = Some(match entry.owner_group.take() {
                    Some(o) => format!("{} {}", o, value),
                    None => value.to_string(),
                });
            }
            _ => {}
        }
    }
    if !saw_type {
        return None;
    }
    Some(entry)
}

/// `YYYYMMDDHHmmSS[.fraction]`, always UTC.
pub fn parse_mlsd_time(s: &str) -> Option<EntryTime> {
    let base = s.get(..14).unwrap_or(s);
    NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S")
        .ok()
        .map(|dt| EntryTime::new(Utc.from_utc_datetime(&dt), TimePrecision::Seconds))
}

// ─── Unix ────────────────────────────────────────────────────────────

/// `Jan  1 12:00` (year inferred) or `Jan  1  2025`.
fn parse_unix_date(s: &str, now: DateTime<Utc>) -> Option<EntryTime> {
    let normalised = s.split_whitespace().collect::<Vec<_>>().join(" ");

    if let Ok(dt) = NaiveDateTime::parse_from_str(
        &format!("{} {}", now.year(), normalised),
        "%Y %b %d %H:%M",
    ) {
        let mut time = Utc.from_utc_datetime(&dt);
        // Dates without a year more than a day ahead belong to last year.
        if time > now + Duration::days(1) {
            let prev = NaiveDateTime::parse_from_str(
                &format!("{} {}", now.year() - 1, normalised),
                "%Y %b %d %H:%M",
            )
            .ok()?;
            time = Utc.from_utc_datetime(&prev);
        }
        return Some(EntryTime::new(time, TimePrecision::Minutes));
    }

    let date = NaiveDate::parse_from_str(&normalised, "%b %d %Y").ok()?;
    let dt = date.and_time(NaiveTime::from_hms_opt(0, 0, 0)?);
    Some(EntryTime::new(Utc.from_utc_datetime(&dt), TimePrecision::Day))
}

// ─── DOS / IIS ───────────────────────────────────────────────────────

fn parse_dos(line: &str) -> Option<DirEntry> {
    let caps = DOS_LINE.captures(line)?;
    let date_str = caps.get(1)?.as_str();
    let time_str = caps.get(2)?.as_str().replace(' ', "");
    let size_or_dir = caps.get(3)?.as_str();
    let name = caps.get(4)?.as_str();

    let mut entry = if size_or_dir == "<DIR>" {
        DirEntry::dir(name)
    } else {
        DirEntry::file(name, size_or_dir.parse().unwrap_or(-1))
    };
    entry.time = parse_dos_date(date_str, &time_str);
    Some(entry)
}

fn parse_dos_date(date: &str, time: &str) -> Option<EntryTime> {
    let combined = format!("{} {}", date, time);
    let year_fmt = if date.len() == 10 { "%m-%d-%Y" } else { "%m-%d-%y" };
    for time_fmt in ["%I:%M%p", "%H:%M"] {
        let fmt = format!("{} {}", year_fmt, time_fmt);
        if let Ok(dt) = NaiveDateTime::parse_from_str(&combined, &fmt) {
            return Some(EntryTime::new(Utc.from_utc_datetime(&dt), TimePrecision::Minutes));
        }
    }
    None
}

/// Parse a complete listing body in one call.
pub fn parse_listing(raw: &[u8], server_type: ServerType) -> Vec<DirEntry> {
    let mut parser = ListingParser::new(server_type);
    parser.add_data(raw);
    parser.finish()
}
