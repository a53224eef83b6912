//! Process-wide directory listing cache.
//!
//! Keyed by server identity and absolute path. Writes come only from the
//! control socket that currently holds the matching cache lock.

use crate::listing::{DirEntry, DirectoryListing, EntryFlags};
use crate::path::ServerPath;
use crate::server::ServerKey;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

pub const DEFAULT_MAX_ENTRIES: usize = 1000;

#[derive(Debug, Clone)]
struct CacheEntry {
    listing: DirectoryListing,
    stored_at: DateTime<Utc>,
    last_access: u64,
}

/// Result of a listing lookup.
#[derive(Debug, Clone)]
pub struct CachedListing {
    pub listing: DirectoryListing,
    /// Older than the freshness window.
    pub outdated: bool,
}

impl CachedListing {
    /// Usable without a server round trip.
    pub fn is_usable(&self) -> bool {
        !self.outdated && !self.listing.failed && !self.listing.has_unsure_entries()
    }
}

/// Result of a single-file lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLookup {
    /// The containing directory is cached at all.
    pub dir_found: bool,
    pub entry: Option<DirEntry>,
    /// The match only succeeded ignoring case.
    pub case_mismatch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Unknown,
    File,
    Dir,
}

#[derive(Debug)]
pub struct DirectoryCache {
    entries: HashMap<(ServerKey, ServerPath), CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    access_counter: u64,
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new(Duration::minutes(30), DEFAULT_MAX_ENTRIES)
    }
}

impl DirectoryCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
            access_counter: 0,
        }
    }

    pub fn set_ttl(&mut self, ttl: Duration) {
        self.ttl = ttl;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn touch(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }

    pub fn store(&mut self, server: &ServerKey, listing: DirectoryListing) {
        let stamp = self.touch();
        let key = (server.clone(), listing.path.clone());
        self.entries.insert(
            key,
            CacheEntry {
                listing,
                stored_at: Utc::now(),
                last_access: stamp,
            },
        );
        self.prune();
    }

    fn prune(&mut self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn lookup(&mut self, server: &ServerKey, path: &ServerPath) -> Option<CachedListing> {
        let stamp = self.touch();
        let ttl = self.ttl;
        let entry = self.entries.get_mut(&(server.clone(), path.clone()))?;
        entry.last_access = stamp;
        Some(CachedListing {
            listing: entry.listing.clone(),
            outdated: Utc::now() - entry.stored_at > ttl,
        })
    }

    /// `Some(has_unsure)` when the directory is cached.
    pub fn does_exist(&self, server: &ServerKey, path: &ServerPath) -> Option<bool> {
        self.entries
            .get(&(server.clone(), path.clone()))
            .map(|e| e.listing.has_unsure_entries())
    }

    pub fn lookup_file(
        &mut self,
        server: &ServerKey,
        path: &ServerPath,
        filename: &str,
        case_insensitive: bool,
    ) -> FileLookup {
        let stamp = self.touch();
        let Some(entry) = self.entries.get_mut(&(server.clone(), path.clone())) else {
            return FileLookup { dir_found: false, entry: None, case_mismatch: false };
        };
        entry.last_access = stamp;
        let listing = &entry.listing;
        match listing.find(filename, case_insensitive) {
            Some(i) => FileLookup {
                dir_found: true,
                case_mismatch: listing.entries[i].name != filename,
                entry: Some(listing.entries[i].clone()),
            },
            None => FileLookup { dir_found: true, entry: None, case_mismatch: false },
        }
    }

    /// Record a change to `filename` without a fresh listing.
    ///
    /// Returns true if a cached listing was touched.
    pub fn update_file(
        &mut self,
        server: &ServerKey,
        path: &ServerPath,
        filename: &str,
        may_create: bool,
        kind: UpdateKind,
        size: i64,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&(server.clone(), path.clone())) else {
            return false;
        };
        let listing = &mut entry.listing;
        match listing.find(filename, false) {
            Some(i) => {
                let e = &mut listing.entries[i];
                match kind {
                    UpdateKind::Dir if !e.is_dir() => {
                        e.flags = EntryFlags::DIR | EntryFlags::UNSURE;
                        e.size = -1;
                    }
                    UpdateKind::File if e.is_dir() => {
                        e.flags = EntryFlags::UNSURE;
                        e.size = size;
                    }
                    _ => {
                        if size != e.size {
                            e.size = size;
                        }
                        e.flags |= EntryFlags::UNSURE;
                    }
                }
                true
            }
            None if may_create => {
                let mut e = match kind {
                    UpdateKind::Dir => DirEntry::dir(filename),
                    _ => DirEntry::file(filename, size),
                };
                e.flags |= EntryFlags::UNSURE;
                listing.entries.push(e);
                listing.unsure = true;
                true
            }
            None => false,
        }
    }

    pub fn remove_file(&mut self, server: &ServerKey, path: &ServerPath, filename: &str) {
        if let Some(entry) = self.entries.get_mut(&(server.clone(), path.clone())) {
            entry.listing.entries.retain(|e| e.is_dir() || e.name != filename);
        }
    }

    /// Drop `filename` from `path` and every cached listing at or below it.
    pub fn remove_dir(&mut self, server: &ServerKey, path: &ServerPath, filename: &str) {
        let target = path.with_segment(filename);
        self.entries.retain(|(s, p), _| {
            s != server || (p != &target && !p.is_subdir_of(&target, false))
        });
        if let Some(entry) = self.entries.get_mut(&(server.clone(), path.clone())) {
            entry.listing.entries.retain(|e| e.name != filename);
        }
    }

    pub fn rename(
        &mut self,
        server: &ServerKey,
        from_path: &ServerPath,
        from_name: &str,
        to_path: &ServerPath,
        to_name: &str,
    ) {
        let was_dir = self
            .entries
            .get(&(server.clone(), from_path.clone()))
            .and_then(|e| e.listing.find(from_name, false).map(|i| e.listing.entries[i].is_dir()));

        if from_path == to_path {
            if let Some(entry) = self.entries.get_mut(&(server.clone(), from_path.clone())) {
                let listing = &mut entry.listing;
                listing.entries.retain(|e| e.name != to_name || to_name == from_name);
                if let Some(i) = listing.find(from_name, false) {
                    listing.entries[i].name = to_name.to_string();
                }
            }
        } else {
            if let Some(entry) = self.entries.get_mut(&(server.clone(), from_path.clone())) {
                entry.listing.entries.retain(|e| e.name != from_name);
            }
            let kind = match was_dir {
                Some(true) => UpdateKind::Dir,
                Some(false) => UpdateKind::File,
                None => UpdateKind::Unknown,
            };
            self.update_file(server, to_path, to_name, true, kind, -1);
        }

        if was_dir != Some(false) {
            let old = from_path.with_segment(from_name);
            self.entries.retain(|(s, p), _| s != server || (p != &old && !p.is_subdir_of(&old, false)));
        }
    }

    /// Mark `filename` unsure so the next lookup goes to the server.
    pub fn invalidate_file(&mut self, server: &ServerKey, path: &ServerPath, filename: &str) {
        if let Some(entry) = self.entries.get_mut(&(server.clone(), path.clone())) {
            for e in entry.listing.entries.iter_mut().filter(|e| e.name == filename) {
                e.flags |= EntryFlags::UNSURE;
            }
        }
    }

    pub fn invalidate_server(&mut self, server: &ServerKey) {
        self.entries.retain(|(s, _), _| s != server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Protocol, Server, ServerType};

    fn key() -> ServerKey {
        Server::new(Protocol::Ftp, "example.com", 21).key()
    }

    fn p(s: &str) -> ServerPath {
        ServerPath::parse(s, ServerType::Unix).unwrap()
    }

    fn seeded() -> DirectoryCache {
        let mut cache = DirectoryCache::default();
        cache.store(
            &key(),
            DirectoryListing::new(p("/pub"), vec![DirEntry::dir("sub"), DirEntry::file("a.txt", 3)]),
        );
        cache.store(&key(), DirectoryListing::new(p("/pub/sub"), vec![]));
        cache.store(&key(), DirectoryListing::new(p("/pub/sub/deep"), vec![]));
        cache
    }

    #[test]
    fn fresh_listing_is_usable() {
        let mut cache = seeded();
        let hit = cache.lookup(&key(), &p("/pub")).unwrap();
        assert!(hit.is_usable());
        assert!(cache.lookup(&key(), &p("/nope")).is_none());
    }

    #[test]
    fn zero_ttl_marks_outdated() {
        let mut cache = DirectoryCache::new(Duration::seconds(-1), 10);
        cache.store(&key(), DirectoryListing::new(p("/"), vec![]));
        assert!(cache.lookup(&key(), &p("/")).unwrap().outdated);
    }

    #[test]
    fn update_file_marks_unsure() {
        let mut cache = seeded();
        assert!(cache.update_file(&key(), &p("/pub"), "new.bin", true, UpdateKind::File, 10));
        let hit = cache.lookup(&key(), &p("/pub")).unwrap();
        assert!(!hit.is_usable());
        let found = cache.lookup_file(&key(), &p("/pub"), "NEW.BIN", true);
        assert!(found.case_mismatch);
        assert!(found.entry.unwrap().is_unsure());
    }

    #[test]
    fn remove_dir_drops_subtree() {
        let mut cache = seeded();
        cache.remove_dir(&key(), &p("/pub"), "sub");
        assert!(cache.does_exist(&key(), &p("/pub/sub")).is_none());
        assert!(cache.does_exist(&key(), &p("/pub/sub/deep")).is_none());
        assert_eq!(cache.lookup(&key(), &p("/pub")).unwrap().listing.len(), 1);
    }

    #[test]
    fn rename_within_directory() {
        let mut cache = seeded();
        cache.rename(&key(), &p("/pub"), "a.txt", &p("/pub"), "b.txt");
        let l = cache.lookup(&key(), &p("/pub")).unwrap().listing;
        assert!(l.find("b.txt", false).is_some());
        assert!(l.find("a.txt", false).is_none());
    }

    #[test]
    fn rename_across_directories_marks_target_unsure() {
        let mut cache = seeded();
        cache.rename(&key(), &p("/pub"), "a.txt", &p("/pub/sub"), "a.txt");
        assert!(cache.lookup_file(&key(), &p("/pub"), "a.txt", false).entry.is_none());
        assert_eq!(cache.does_exist(&key(), &p("/pub/sub")), Some(true));
    }

    #[test]
    fn lru_cap_evicts_least_recently_used() {
        let mut cache = DirectoryCache::new(Duration::minutes(30), 2);
        cache.store(&key(), DirectoryListing::new(p("/a"), vec![]));
        cache.store(&key(), DirectoryListing::new(p("/b"), vec![]));
        cache.lookup(&key(), &p("/a"));
        cache.store(&key(), DirectoryListing::new(p("/c"), vec![]));
        assert!(cache.does_exist(&key(), &p("/a")).is_some());
        assert!(cache.does_exist(&key(), &p("/b")).is_none());
    }

    #[test]
    fn invalidate_server_clears_only_that_server() {
        let mut cache = seeded();
        let other = Server::new(Protocol::Sftp, "example.com", 22).key();
        cache.store(&other, DirectoryListing::new(p("/"), vec![]));
        cache.invalidate_server(&key());
        assert_eq!(cache.len(), 1);
    }
}
