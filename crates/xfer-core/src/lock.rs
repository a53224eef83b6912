//! Cross-engine cache locks.
//!
//! At most one engine holds the lock for a (server, directory, reason)
//! triple. The holder may re-acquire recursively. Other engines queue up
//! FIFO and are handed the lock on release; the caller is told who to wake.

use crate::path::ServerPath;
use crate::server::ServerKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Value-typed identity of one engine (one control socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EngineId(pub u64);

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockReason {
    List,
    Mkdir,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub server: ServerKey,
    pub path: ServerPath,
    pub reason: LockReason,
}

impl LockKey {
    pub fn new(server: ServerKey, path: ServerPath, reason: LockReason) -> Self {
        Self { server, path, reason }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    /// Queued; the engine is woken once it becomes the holder.
    Waiting,
}

#[derive(Debug)]
struct LockState {
    holder: EngineId,
    depth: u32,
    /// Handed over on release; the next acquire by the holder claims it.
    handed_over: bool,
    waiters: VecDeque<EngineId>,
}

#[derive(Debug, Default)]
pub struct CacheLockManager {
    locks: HashMap<LockKey, LockState>,
}

impl CacheLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, engine: EngineId, key: &LockKey) -> LockOutcome {
        match self.locks.get_mut(key) {
            None => {
                self.locks.insert(
                    key.clone(),
                    LockState {
                        holder: engine,
                        depth: 1,
                        handed_over: false,
                        waiters: VecDeque::new(),
                    },
                );
                LockOutcome::Acquired
            }
            Some(state) if state.holder == engine => {
                if state.handed_over {
                    state.handed_over = false;
                } else {
                    state.depth += 1;
                }
                LockOutcome::Acquired
            }
            Some(state) => {
                if !state.waiters.contains(&engine) {
                    state.waiters.push_back(engine);
                }
                LockOutcome::Waiting
            }
        }
    }

    /// Never fails. Returns the waiter that now holds the lock, if any.
    pub fn release(&mut self, engine: EngineId, key: &LockKey) -> Option<EngineId> {
        let state = self.locks.get_mut(key)?;
        if state.holder != engine {
            state.waiters.retain(|w| *w != engine);
            return None;
        }
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 && !state.handed_over {
            return None;
        }
        match state.waiters.pop_front() {
            Some(next) => {
                state.holder = next;
                state.depth = 1;
                state.handed_over = true;
                Some(next)
            }
            None => {
                self.locks.remove(key);
                None
            }
        }
    }

    /// Drop every lock and wait registration of `engine`.
    pub fn release_all(&mut self, engine: EngineId) -> Vec<EngineId> {
        let held: Vec<LockKey> = self
            .locks
            .iter()
            .filter(|(_, s)| s.holder == engine)
            .map(|(k, _)| k.clone())
            .collect();
        for state in self.locks.values_mut() {
            state.waiters.retain(|w| *w != engine);
        }
        let mut woken = Vec::new();
        for key in held {
            if let Some(state) = self.locks.get_mut(&key) {
                state.depth = 1;
                state.handed_over = false;
            }
            if let Some(next) = self.release(engine, &key) {
                woken.push(next);
            }
        }
        woken
    }

    pub fn holder(&self, key: &LockKey) -> Option<EngineId> {
        self.locks.get(key).map(|s| s.holder)
    }

    pub fn is_waiting(&self, engine: EngineId, key: &LockKey) -> bool {
        self.locks
            .get(key)
            .map_or(false, |s| s.waiters.contains(&engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Protocol, Server, ServerType};

    fn key(dir: &str) -> LockKey {
        LockKey::new(
            Server::new(Protocol::Ftp, "h", 21).key(),
            ServerPath::parse(dir, ServerType::Unix).unwrap(),
            LockReason::List,
        )
    }

    const A: EngineId = EngineId(1);
    const B: EngineId = EngineId(2);
    const C: EngineId = EngineId(3);

    #[test]
    fn single_holder_and_fifo_handover() {
        let mut m = CacheLockManager::new();
        let k = key("/d");
        assert_eq!(m.acquire(A, &k), LockOutcome::Acquired);
        assert_eq!(m.acquire(B, &k), LockOutcome::Waiting);
        assert_eq!(m.acquire(C, &k), LockOutcome::Waiting);
        assert_eq!(m.holder(&k), Some(A));

        assert_eq!(m.release(A, &k), Some(B));
        assert_eq!(m.holder(&k), Some(B));
        assert_eq!(m.acquire(B, &k), LockOutcome::Acquired);
        assert_eq!(m.acquire(C, &k), LockOutcome::Waiting);

        assert_eq!(m.release(B, &k), Some(C));
        assert_eq!(m.acquire(C, &k), LockOutcome::Acquired);
        assert_eq!(m.release(C, &k), None);
        assert_eq!(m.holder(&k), None);
    }

    #[test]
    fn recursive_acquire_needs_matching_releases() {
        let mut m = CacheLockManager::new();
        let k = key("/d");
        m.acquire(A, &k);
        m.acquire(A, &k);
        m.acquire(B, &k);
        assert_eq!(m.release(A, &k), None);
        assert_eq!(m.holder(&k), Some(A));
        assert_eq!(m.release(A, &k), Some(B));
    }

    #[test]
    fn release_without_holding_is_noop() {
        let mut m = CacheLockManager::new();
        let k = key("/d");
        assert_eq!(m.release(A, &k), None);
        m.acquire(A, &k);
        assert_eq!(m.release(B, &k), None);
        assert_eq!(m.holder(&k), Some(A));
    }

    #[test]
    fn different_directories_do_not_contend() {
        let mut m = CacheLockManager::new();
        assert_eq!(m.acquire(A, &key("/x")), LockOutcome::Acquired);
        assert_eq!(m.acquire(B, &key("/y")), LockOutcome::Acquired);
    }

    #[test]
    fn release_all_hands_over_and_forgets_waits() {
        let mut m = CacheLockManager::new();
        m.acquire(A, &key("/x"));
        m.acquire(A, &key("/x"));
        m.acquire(B, &key("/x"));
        m.acquire(B, &key("/y"));
        m.acquire(A, &key("/y"));
        assert_eq!(m.release_all(A), vec![B]);
        assert!(!m.is_waiting(A, &key("/y")));
        assert_eq!(m.holder(&key("/x")), Some(B));
    }
}
