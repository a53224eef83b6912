//! Canonical path cache: remembers where `CWD source/subdir` actually lands.

use crate::path::ServerPath;
use crate::server::ServerKey;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct PathCache {
    entries: HashMap<ServerKey, HashMap<(ServerPath, String), ServerPath>>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&mut self, server: &ServerKey, target: &ServerPath, source: &ServerPath, subdir: &str) {
        if target.is_empty() || source.is_empty() {
            return;
        }
        self.entries
            .entry(server.clone())
            .or_default()
            .insert((source.clone(), subdir.to_string()), target.clone());
    }

    pub fn lookup(&self, server: &ServerKey, source: &ServerPath, subdir: &str) -> Option<ServerPath> {
        self.entries
            .get(server)?
            .get(&(source.clone(), subdir.to_string()))
            .cloned()
    }

    /// Forget everything that resolves to or from inside `path/subdir`.
    pub fn invalidate_path(&mut self, server: &ServerKey, path: &ServerPath, subdir: &str) {
        let Some(map) = self.entries.get_mut(server) else {
            return;
        };
        let root = if subdir.is_empty() {
            Some(path.clone())
        } else {
            path.change_path(subdir)
        };
        map.retain(|(source, sub), target| {
            if source == path && sub == subdir {
                return false;
            }
            let Some(root) = &root else {
                return true;
            };
            let inside = |p: &ServerPath| p == root || p.is_subdir_of(root, false);
            if inside(target) {
                return false;
            }
            match source.change_path(sub) {
                Some(resolved) => !inside(&resolved) && !inside(source),
                None => !inside(source),
            }
        });
    }

    pub fn invalidate_server(&mut self, server: &ServerKey) {
        self.entries.remove(server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Protocol, Server, ServerType};

    fn key() -> ServerKey {
        Server::new(Protocol::Ftp, "h", 21).key()
    }

    fn p(s: &str) -> ServerPath {
        ServerPath::parse(s, ServerType::Unix).unwrap()
    }

    #[test]
    fn store_and_lookup() {
        let mut cache = PathCache::new();
        cache.store(&key(), &p("/real/target"), &p("/home"), "link");
        assert_eq!(cache.lookup(&key(), &p("/home"), "link"), Some(p("/real/target")));
        assert_eq!(cache.lookup(&key(), &p("/home"), "other"), None);
    }

    #[test]
    fn invalidate_subtree() {
        let mut cache = PathCache::new();
        cache.store(&key(), &p("/a/b"), &p("/a"), "b");
        cache.store(&key(), &p("/a/b/c"), &p("/a/b/c"), "");
        cache.store(&key(), &p("/x"), &p("/x"), "");
        cache.invalidate_path(&key(), &p("/a"), "b");
        assert_eq!(cache.lookup(&key(), &p("/a"), "b"), None);
        assert_eq!(cache.lookup(&key(), &p("/a/b/c"), ""), None);
        assert_eq!(cache.lookup(&key(), &p("/x"), ""), Some(p("/x")));
    }
}
