//! Remote path model.
//!
//! A [`ServerPath`] is a dialect tag, an optional dialect-specific prefix
//! (VMS device, VxWorks device, MVS partitioned-dataset marker) and the
//! ordered directory segments. It never holds a trailing file name.

use crate::server::ServerType;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct PathData {
    prefix: Option<String>,
    segments: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ServerPath {
    server_type: ServerType,
    data: Option<PathData>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SafePathError {
    #[error("unknown server type code {0}")]
    UnknownType(u8),
    #[error("malformed number at byte {0}")]
    BadNumber(usize),
    #[error("field length {0} runs past the end of the input")]
    Truncated(usize),
    #[error("expected a space separator at byte {0}")]
    MissingSeparator(usize),
}

struct Dialect {
    separators: &'static [char],
    has_root: bool,
    has_dots: bool,
}

fn dialect(t: ServerType) -> Dialect {
    match t {
        ServerType::Unix | ServerType::Zvm | ServerType::Cygwin | ServerType::DosFwdSlashes => {
            Dialect { separators: &['/'], has_root: true, has_dots: true }
        }
        ServerType::VxWorks => Dialect { separators: &['/'], has_root: true, has_dots: true },
        ServerType::Dos => Dialect { separators: &['\\', '/'], has_root: false, has_dots: true },
        ServerType::DosVirtual => Dialect { separators: &['\\', '/'], has_root: true, has_dots: true },
        ServerType::Vms => Dialect { separators: &['.'], has_root: false, has_dots: false },
        ServerType::Mvs => Dialect { separators: &['.'], has_root: false, has_dots: false },
        ServerType::HpNonstop => Dialect { separators: &['.'], has_root: true, has_dots: false },
    }
}

/// Apply `parts` onto `segments`. `..` pops (never below `floor`), `.` is ignored.
fn apply_segments<'a>(
    segments: &mut Vec<String>,
    parts: impl Iterator<Item = &'a str>,
    has_dots: bool,
    floor: usize,
) -> bool {
    for part in parts {
        if part.is_empty() {
            continue;
        }
        if has_dots && part == "." {
            continue;
        }
        if has_dots && part == ".." {
            if segments.len() <= floor {
                return false;
            }
            segments.pop();
            continue;
        }
        segments.push(part.to_string());
    }
    true
}

/// Split a VMS directory list on unescaped dots; `^.` is a literal dot.
fn split_vms(inner: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        match c {
            '^' => {
                if let Some(next) = chars.next() {
                    cur.push(next);
                }
            }
            '.' => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    out.push(cur);
    out
}

fn escape_vms(segment: &str) -> String {
    segment.replace('^', "^^").replace('.', "^.")
}

fn is_drive(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

impl ServerPath {
    /// The unknown path.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Root path for dialects that have one.
    pub fn root(server_type: ServerType) -> Self {
        Self {
            server_type,
            data: Some(PathData { prefix: None, segments: Vec::new() }),
        }
    }

    /// Parse an absolute path in the given dialect. Relative paths yield `None`.
    pub fn parse(path: &str, server_type: ServerType) -> Option<Self> {
        let path = path.trim_end_matches(['\r', '\n']);
        if path.is_empty() {
            return None;
        }
        let d = dialect(server_type);
        let mut segments = Vec::new();
        let mut prefix = None;
        let ok = match server_type {
            ServerType::Unix | ServerType::Zvm | ServerType::Cygwin | ServerType::DosFwdSlashes => {
                if !path.starts_with('/') {
                    return None;
                }
                if server_type == ServerType::Cygwin && path.starts_with("//") && !path.starts_with("///") {
                    prefix = Some("//".to_string());
                }
                apply_segments(&mut segments, path.split('/'), d.has_dots, 0)
            }
            ServerType::VxWorks => {
                let rest = if path.starts_with('/') {
                    path
                } else {
                    let colon = path.find(':')?;
                    prefix = Some(path[..=colon].to_string());
                    &path[colon + 1..]
                };
                apply_segments(&mut segments, rest.split('/'), d.has_dots, 0)
            }
            ServerType::Dos => {
                let mut parts = path.split(d.separators);
                let drive = parts.next()?;
                if !is_drive(drive) {
                    return None;
                }
                segments.push(drive.to_string());
                apply_segments(&mut segments, parts, d.has_dots, 1)
            }
            ServerType::DosVirtual => {
                if !path.starts_with(['\\', '/']) {
                    return None;
                }
                apply_segments(&mut segments, path.split(d.separators), d.has_dots, 0)
            }
            ServerType::HpNonstop => {
                let rest = path.strip_prefix('\\')?;
                apply_segments(&mut segments, rest.split('.'), false, 0)
            }
            ServerType::Vms => {
                let open = path.find('[')?;
                let inner = path[open + 1..].strip_suffix(']')?;
                if open > 0 {
                    prefix = Some(path[..open].to_string());
                }
                let parts = split_vms(inner);
                if parts.iter().any(|p| p.is_empty()) {
                    return None;
                }
                segments.extend(parts);
                true
            }
            ServerType::Mvs => {
                let inner = path.strip_prefix('\'')?.strip_suffix('\'')?;
                let inner = match inner.strip_suffix('.') {
                    Some(stripped) => {
                        prefix = Some(".".to_string());
                        stripped
                    }
                    None => inner,
                };
                let parts: Vec<&str> = inner.split('.').collect();
                if parts.iter().any(|p| p.is_empty()) {
                    return None;
                }
                segments.extend(parts.into_iter().map(str::to_string));
                true
            }
        };
        if !ok || (!d.has_root && segments.is_empty()) {
            return None;
        }
        Some(Self {
            server_type,
            data: Some(PathData { prefix, segments }),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    pub fn segments(&self) -> &[String] {
        self.data.as_ref().map(|d| d.segments.as_slice()).unwrap_or(&[])
    }

    pub fn prefix(&self) -> Option<&str> {
        self.data.as_ref().and_then(|d| d.prefix.as_deref())
    }

    /// False for the root and for single-segment paths of root-less dialects.
    pub fn has_parent(&self) -> bool {
        let Some(data) = &self.data else {
            return false;
        };
        if dialect(self.server_type).has_root {
            !data.segments.is_empty()
        } else {
            data.segments.len() > 1
        }
    }

    pub fn parent(&self) -> Option<Self> {
        if !self.has_parent() {
            return None;
        }
        let mut out = self.clone();
        if let Some(data) = out.data.as_mut() {
            data.segments.pop();
            if self.server_type == ServerType::Mvs {
                data.prefix = None;
            }
        }
        Some(out)
    }

    pub fn last_segment(&self) -> Option<&str> {
        self.segments().last().map(String::as_str)
    }

    pub fn add_segment(&mut self, segment: &str) {
        if let Some(data) = self.data.as_mut() {
            data.segments.push(segment.to_string());
        }
    }

    pub fn with_segment(&self, segment: &str) -> Self {
        let mut out = self.clone();
        out.add_segment(segment);
        out
    }

    fn is_absolute(&self, path: &str) -> bool {
        match self.server_type {
            ServerType::Unix | ServerType::Zvm | ServerType::Cygwin | ServerType::DosFwdSlashes => {
                path.starts_with('/')
            }
            ServerType::VxWorks => path.starts_with('/') || path.contains(':'),
            ServerType::Dos => path.get(..2).map_or(false, is_drive),
            ServerType::DosVirtual | ServerType::HpNonstop => path.starts_with(['\\', '/']),
            ServerType::Vms => path.contains('['),
            ServerType::Mvs => path.starts_with('\''),
        }
    }

    /// Resolve `subdir` against this path. Absolute inputs replace the path.
    pub fn change_path(&self, subdir: &str) -> Option<Self> {
        if subdir.is_empty() {
            return if self.is_empty() { None } else { Some(self.clone()) };
        }
        if self.is_absolute(subdir) {
            return Self::parse(subdir, self.server_type);
        }
        let data = self.data.as_ref()?;
        let d = dialect(self.server_type);
        let floor = if self.server_type == ServerType::Dos { 1 } else { 0 };
        let mut segments = data.segments.clone();
        let ok = match self.server_type {
            ServerType::Vms => {
                let inner = subdir.trim_start_matches('[').trim_end_matches(']');
                let inner = inner.strip_prefix('.').unwrap_or(inner);
                apply_segments(&mut segments, split_vms(inner).iter().map(String::as_str), false, 0)
            }
            _ => apply_segments(&mut segments, subdir.split(d.separators), d.has_dots, floor),
        };
        if !ok || (!d.has_root && segments.is_empty()) {
            return None;
        }
        Some(Self {
            server_type: self.server_type,
            data: Some(PathData {
                prefix: if self.server_type == ServerType::Mvs { None } else { data.prefix.clone() },
                segments,
            }),
        })
    }

    fn same_root(&self, other: &Self) -> bool {
        self.server_type == other.server_type && self.prefix() == other.prefix()
    }

    fn segments_eq(a: &str, b: &str, no_case: bool) -> bool {
        if no_case {
            a.eq_ignore_ascii_case(b)
        } else {
            a == b
        }
    }

    /// True if `self` lies strictly below `other`.
    pub fn is_subdir_of(&self, other: &Self, no_case: bool) -> bool {
        if self.is_empty() || other.is_empty() || !self.same_root_loose(other) {
            return false;
        }
        let mine = self.segments();
        let theirs = other.segments();
        mine.len() > theirs.len()
            && theirs
                .iter()
                .zip(mine.iter())
                .all(|(a, b)| Self::segments_eq(a, b, no_case))
    }

    /// True if `other` lies strictly below `self`.
    pub fn is_parent_of(&self, other: &Self, no_case: bool) -> bool {
        other.is_subdir_of(self, no_case)
    }

    // The MVS member marker only affects formatting, not ancestry.
    fn same_root_loose(&self, other: &Self) -> bool {
        if self.server_type == ServerType::Mvs {
            self.server_type == other.server_type
        } else {
            self.same_root(other)
        }
    }

    /// Deepest path both share, if any.
    pub fn common_parent(&self, other: &Self) -> Option<Self> {
        if self.is_empty() || other.is_empty() || !self.same_root_loose(other) {
            return None;
        }
        let segments: Vec<String> = self
            .segments()
            .iter()
            .zip(other.segments())
            .take_while(|(a, b)| a == b)
            .map(|(a, _)| a.clone())
            .collect();
        if !dialect(self.server_type).has_root && segments.is_empty() {
            return None;
        }
        Some(Self {
            server_type: self.server_type,
            data: Some(PathData {
                prefix: if self.server_type == ServerType::Mvs { None } else { self.prefix().map(str::to_string) },
                segments,
            }),
        })
    }

    /// Render the path the way the server expects it.
    pub fn format(&self) -> String {
        let Some(data) = &self.data else {
            return String::new();
        };
        let segs = &data.segments;
        let prefix = data.prefix.as_deref().unwrap_or("");
        match self.server_type {
            ServerType::Unix | ServerType::Zvm | ServerType::DosFwdSlashes => {
                format!("/{}", segs.join("/"))
            }
            ServerType::Cygwin => {
                if prefix == "//" {
                    format!("//{}", segs.join("/"))
                } else {
                    format!("/{}", segs.join("/"))
                }
            }
            ServerType::VxWorks => format!("{}/{}", prefix, segs.join("/")),
            ServerType::Dos => {
                if segs.len() == 1 {
                    format!("{}\\", segs[0])
                } else {
                    segs.join("\\")
                }
            }
            ServerType::DosVirtual => format!("\\{}", segs.join("\\")),
            ServerType::HpNonstop => format!("\\{}", segs.join(".")),
            ServerType::Vms => {
                let inner: Vec<String> = segs.iter().map(|s| escape_vms(s)).collect();
                format!("{}[{}]", prefix, inner.join("."))
            }
            ServerType::Mvs => format!("'{}{}'", segs.join("."), prefix),
        }
    }

    /// Full remote name of `filename` inside this directory.
    pub fn format_filename(&self, filename: &str, omit_path: bool) -> String {
        if omit_path && self.server_type != ServerType::Mvs {
            return filename.to_string();
        }
        let Some(data) = &self.data else {
            return filename.to_string();
        };
        match self.server_type {
            ServerType::Unix
            | ServerType::Zvm
            | ServerType::Cygwin
            | ServerType::DosFwdSlashes
            | ServerType::VxWorks => {
                let base = self.format();
                if base.ends_with('/') {
                    format!("{}{}", base, filename)
                } else {
                    format!("{}/{}", base, filename)
                }
            }
            ServerType::Dos | ServerType::DosVirtual => {
                let base = self.format();
                if base.ends_with('\\') {
                    format!("{}{}", base, filename)
                } else {
                    format!("{}\\{}", base, filename)
                }
            }
            ServerType::HpNonstop => {
                if data.segments.is_empty() {
                    format!("\\{}", filename)
                } else {
                    format!("{}.{}", self.format(), filename)
                }
            }
            ServerType::Vms => format!("{}{}", self.format(), filename),
            ServerType::Mvs => {
                let base = data.segments.join(".");
                if data.prefix.as_deref() == Some(".") {
                    if omit_path {
                        format!("({})", filename)
                    } else {
                        format!("'{}({})'", base, filename)
                    }
                } else if omit_path {
                    filename.to_string()
                } else {
                    format!("'{}.{}'", base, filename)
                }
            }
        }
    }

    /// Stable, lossless serialisation used as cache key and for persistence.
    ///
    /// Layout: `<type> <prefix-len>[ <prefix>]( <seg-len> <seg>)*`, lengths in bytes.
    pub fn to_safe_string(&self) -> String {
        let Some(data) = &self.data else {
            return String::new();
        };
        let prefix = data.prefix.as_deref().unwrap_or("");
        let mut out = format!("{} {}", self.server_type.code(), prefix.len());
        if !prefix.is_empty() {
            out.push(' ');
            out.push_str(prefix);
        }
        for seg in &data.segments {
            out.push(' ');
            out.push_str(&seg.len().to_string());
            out.push(' ');
            out.push_str(seg);
        }
        out
    }

    pub fn from_safe_string(s: &str) -> Result<Self, SafePathError> {
        if s.is_empty() {
            return Ok(Self::empty());
        }
        let mut pos = 0usize;
        let code = read_number(s, &mut pos)?;
        let code = u8::try_from(code).map_err(|_| SafePathError::BadNumber(0))?;
        let server_type = ServerType::from_code(code).ok_or(SafePathError::UnknownType(code))?;
        expect_space(s, &mut pos)?;
        let prefix_len = read_number(s, &mut pos)?;
        let prefix = if prefix_len > 0 {
            expect_space(s, &mut pos)?;
            Some(take(s, &mut pos, prefix_len)?.to_string())
        } else {
            None
        };
        let mut segments = Vec::new();
        while pos < s.len() {
            expect_space(s, &mut pos)?;
            let len = read_number(s, &mut pos)?;
            expect_space(s, &mut pos)?;
            segments.push(take(s, &mut pos, len)?.to_string());
        }
        Ok(Self {
            server_type,
            data: Some(PathData { prefix, segments }),
        })
    }
}

fn read_number(s: &str, pos: &mut usize) -> Result<usize, SafePathError> {
    let start = *pos;
    let digits = s[start..].bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return Err(SafePathError::BadNumber(start));
    }
    *pos += digits;
    s[start..*pos].parse().map_err(|_| SafePathError::BadNumber(start))
}

fn expect_space(s: &str, pos: &mut usize) -> Result<(), SafePathError> {
    if s.as_bytes().get(*pos) == Some(&b' ') {
        *pos += 1;
        Ok(())
    } else {
        Err(SafePathError::MissingSeparator(*pos))
    }
}

fn take<'a>(s: &'a str, pos: &mut usize, len: usize) -> Result<&'a str, SafePathError> {
    let end = pos.checked_add(len).ok_or(SafePathError::Truncated(len))?;
    let out = s.get(*pos..end).ok_or(SafePathError::Truncated(len))?;
    *pos = end;
    Ok(out)
}

impl fmt::Display for ServerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unix(p: &str) -> ServerPath {
        ServerPath::parse(p, ServerType::Unix).unwrap()
    }

    #[test]
    fn unix_parse_and_format() {
        let p = unix("/home/user/../alice/./docs/");
        assert_eq!(p.format(), "/home/alice/docs");
        assert_eq!(p.segments().len(), 3);
        assert!(ServerPath::parse("relative/path", ServerType::Unix).is_none());
        assert!(ServerPath::parse("/..", ServerType::Unix).is_none());
    }

    #[test]
    fn root_has_no_parent() {
        let root = unix("/");
        assert!(!root.has_parent());
        assert!(root.parent().is_none());
        assert_eq!(unix("/a").parent().unwrap(), root);
    }

    #[test]
    fn change_path_resolves_relative_and_absolute() {
        let base = unix("/a/b");
        assert_eq!(base.change_path("c/d").unwrap().format(), "/a/b/c/d");
        assert_eq!(base.change_path("..").unwrap().format(), "/a");
        assert_eq!(base.change_path("/x").unwrap().format(), "/x");
        assert!(unix("/").change_path("..").is_none());
    }

    #[test]
    fn subdir_and_common_parent() {
        let a = unix("/a/b/c");
        let b = unix("/a/x");
        assert!(a.is_subdir_of(&unix("/a"), false));
        assert!(unix("/a").is_parent_of(&a, false));
        assert!(!a.is_subdir_of(&a, false));
        assert!(a.is_subdir_of(&unix("/A"), true));
        assert_eq!(a.common_parent(&b).unwrap(), unix("/a"));
    }

    #[test]
    fn dos_paths_keep_the_drive() {
        let p = ServerPath::parse("C:\\Users\\bob", ServerType::Dos).unwrap();
        assert_eq!(p.format(), "C:\\Users\\bob");
        assert_eq!(p.parent().unwrap().parent().unwrap().format(), "C:\\");
        assert!(!p.parent().unwrap().parent().unwrap().has_parent());
        assert!(ServerPath::parse("C:\\..", ServerType::Dos).is_none());
        assert_eq!(p.format_filename("x.txt", false), "C:\\Users\\bob\\x.txt");
    }

    #[test]
    fn vms_paths_with_device_and_escapes() {
        let p = ServerPath::parse("DISK$USER:[DIR.SUB^.X]", ServerType::Vms).unwrap();
        assert_eq!(p.prefix(), Some("DISK$USER:"));
        assert_eq!(p.segments(), &["DIR".to_string(), "SUB.X".to_string()]);
        assert_eq!(p.format(), "DISK$USER:[DIR.SUB^.X]");
        assert_eq!(p.format_filename("FILE.TXT;1", false), "DISK$USER:[DIR.SUB^.X]FILE.TXT;1");
    }

    #[test]
    fn mvs_member_marker() {
        let pds = ServerPath::parse("'USER.LIB.'", ServerType::Mvs).unwrap();
        assert_eq!(pds.prefix(), Some("."));
        assert_eq!(pds.format_filename("MEMBER", false), "'USER.LIB(MEMBER)'");
        let ds = ServerPath::parse("'USER.DATA'", ServerType::Mvs).unwrap();
        assert_eq!(ds.format_filename("X", false), "'USER.DATA.X'");
    }

    #[test]
    fn safe_string_round_trip_all_dialects() {
        let samples = [
            ("/", ServerType::Unix),
            ("/with space/and 12 digits", ServerType::Unix),
            ("C:\\a b\\c", ServerType::Dos),
            ("DEV:[A.B]", ServerType::Vms),
            ("'A.B.'", ServerType::Mvs),
            ("dev:/x/y", ServerType::VxWorks),
            ("\\SYS.$VOL.SUB", ServerType::HpNonstop),
            ("\\share\\dir", ServerType::DosVirtual),
            ("//host/share", ServerType::Cygwin),
            ("/ünï/çødé", ServerType::Zvm),
        ];
        for (raw, ty) in samples {
            let p = ServerPath::parse(raw, ty).unwrap();
            let safe = p.to_safe_string();
            assert_eq!(ServerPath::from_safe_string(&safe).unwrap(), p, "{}", raw);
        }
        assert_eq!(ServerPath::from_safe_string("").unwrap(), ServerPath::empty());
    }

    #[test]
    fn malformed_safe_strings_are_rejected() {
        assert!(ServerPath::from_safe_string("x").is_err());
        assert_eq!(ServerPath::from_safe_string("42 0"), Err(SafePathError::UnknownType(42)));
        assert!(ServerPath::from_safe_string("0 0 10 short").is_err());
        assert!(ServerPath::from_safe_string("0 0 3").is_err());
    }

    #[test]
    fn equality_requires_same_dialect() {
        let a = ServerPath::parse("/a", ServerType::Unix).unwrap();
        let b = ServerPath::parse("/a", ServerType::Zvm).unwrap();
        assert_ne!(a, b);
    }
}
