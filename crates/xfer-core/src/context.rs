//! State shared by every engine in the process.
//!
//! Caches, the cache-lock manager, capability facts, trust stores and the
//! rate limiter. Each piece sits behind its own std mutex; none is held
//! across an await.

use crate::cache::DirectoryCache;
use crate::capabilities::CapabilityCache;
use crate::lock::{CacheLockManager, EngineId, LockKey, LockOutcome};
use crate::options::EngineOptions;
use crate::path_cache::PathCache;
use crate::rate_limit::RateLimiter;
use chrono::Duration;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Certificates and host keys the user chose to trust.
#[derive(Debug, Default)]
pub struct TrustStore {
    certificates: HashSet<(String, u16, String)>,
    host_keys: HashMap<(String, u16), String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    Trusted,
    Unknown,
    /// A different key is on record.
    Changed,
}

impl TrustStore {
    pub fn is_certificate_trusted(&self, host: &str, port: u16, fingerprint: &str) -> bool {
        self.certificates
            .contains(&(host.to_lowercase(), port, fingerprint.to_string()))
    }

    pub fn trust_certificate(&mut self, host: &str, port: u16, fingerprint: &str) {
        self.certificates
            .insert((host.to_lowercase(), port, fingerprint.to_string()));
    }

    pub fn host_key_status(&self, host: &str, port: u16, fingerprint: &str) -> HostKeyStatus {
        match self.host_keys.get(&(host.to_lowercase(), port)) {
            Some(known) if known == fingerprint => HostKeyStatus::Trusted,
            Some(_) => HostKeyStatus::Changed,
            None => HostKeyStatus::Unknown,
        }
    }

    pub fn trust_host_key(&mut self, host: &str, port: u16, fingerprint: &str) {
        self.host_keys
            .insert((host.to_lowercase(), port), fingerprint.to_string());
    }
}

#[derive(Debug)]
pub struct EngineContext {
    options: RwLock<Arc<EngineOptions>>,
    directory_cache: Mutex<DirectoryCache>,
    path_cache: Mutex<PathCache>,
    locks: Mutex<CacheLockManager>,
    capabilities: Mutex<CapabilityCache>,
    trust: Mutex<TrustStore>,
    rate_limiter: RateLimiter,
    wakers: Mutex<HashMap<EngineId, UnboundedSender<()>>>,
    next_engine: AtomicU64,
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl EngineContext {
    pub fn new(options: EngineOptions) -> Self {
        let cache = DirectoryCache::new(
            Duration::seconds(options.cache_ttl_secs as i64),
            options.cache_max_entries,
        );
        let limiter = RateLimiter::new(options.speed_limit_inbound, options.speed_limit_outbound);
        Self {
            options: RwLock::new(Arc::new(options)),
            directory_cache: Mutex::new(cache),
            path_cache: Mutex::new(PathCache::new()),
            locks: Mutex::new(CacheLockManager::new()),
            capabilities: Mutex::new(CapabilityCache::new()),
            trust: Mutex::new(TrustStore::default()),
            rate_limiter: limiter,
            wakers: Mutex::new(HashMap::new()),
            next_engine: AtomicU64::new(1),
        }
    }

    pub fn shared(options: EngineOptions) -> Arc<Self> {
        Arc::new(Self::new(options))
    }

    pub fn options(&self) -> Arc<EngineOptions> {
        let guard = self.options.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&*guard)
    }

    pub fn set_options(&self, options: EngineOptions) {
        self.rate_limiter
            .set_limits(options.speed_limit_inbound, options.speed_limit_outbound);
        self.directory_cache()
            .set_ttl(Duration::seconds(options.cache_ttl_secs as i64));
        let mut guard = self.options.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(options);
    }

    pub fn directory_cache(&self) -> MutexGuard<'_, DirectoryCache> {
        lock(&self.directory_cache)
    }

    pub fn path_cache(&self) -> MutexGuard<'_, PathCache> {
        lock(&self.path_cache)
    }

    pub fn capabilities(&self) -> MutexGuard<'_, CapabilityCache> {
        lock(&self.capabilities)
    }

    pub fn trust(&self) -> MutexGuard<'_, TrustStore> {
        lock(&self.trust)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// New engine identity plus the channel its lock grants arrive on.
    pub fn register_engine(&self) -> (EngineId, UnboundedReceiver<()>) {
        let id = EngineId(self.next_engine.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.wakers).insert(id, tx);
        (id, rx)
    }

    pub fn unregister_engine(&self, engine: EngineId) {
        self.release_all_locks(engine);
        lock(&self.wakers).remove(&engine);
    }

    fn wake(&self, engine: EngineId) {
        if let Some(tx) = lock(&self.wakers).get(&engine) {
            let _ = tx.send(());
        }
    }

    pub fn acquire_lock(&self, engine: EngineId, key: &LockKey) -> LockOutcome {
        lock(&self.locks).acquire(engine, key)
    }

    /// Idempotent; wakes whoever inherits the lock.
    pub fn release_lock(&self, engine: EngineId, key: &LockKey) {
        let next = lock(&self.locks).release(engine, key);
        if let Some(next) = next {
            self.wake(next);
        }
    }

    pub fn release_all_locks(&self, engine: EngineId) {
        let woken = lock(&self.locks).release_all(engine);
        for next in woken {
            self.wake(next);
        }
    }

    pub fn lock_holder(&self, key: &LockKey) -> Option<EngineId> {
        lock(&self.locks).holder(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockReason;
    use crate::path::ServerPath;
    use crate::server::{Protocol, Server, ServerType};

    fn key() -> LockKey {
        LockKey::new(
            Server::new(Protocol::Ftp, "h", 21).key(),
            ServerPath::parse("/d", ServerType::Unix).unwrap(),
            LockReason::List,
        )
    }

    #[tokio::test]
    async fn release_wakes_next_waiter() {
        let ctx = EngineContext::default();
        let (a, _wa) = ctx.register_engine();
        let (b, mut wb) = ctx.register_engine();
        assert_eq!(ctx.acquire_lock(a, &key()), LockOutcome::Acquired);
        assert_eq!(ctx.acquire_lock(b, &key()), LockOutcome::Waiting);
        ctx.release_lock(a, &key());
        wb.recv().await.unwrap();
        assert_eq!(ctx.acquire_lock(b, &key()), LockOutcome::Acquired);
        assert_eq!(ctx.lock_holder(&key()), Some(b));
    }

    #[tokio::test]
    async fn unregister_releases_everything() {
        let ctx = EngineContext::default();
        let (a, _wa) = ctx.register_engine();
        let (b, mut wb) = ctx.register_engine();
        ctx.acquire_lock(a, &key());
        ctx.acquire_lock(b, &key());
        ctx.unregister_engine(a);
        wb.recv().await.unwrap();
        assert_eq!(ctx.lock_holder(&key()), Some(b));
    }

    #[test]
    fn trust_store_tracks_changed_keys() {
        let mut t = TrustStore::default();
        assert_eq!(t.host_key_status("H", 22, "aa"), HostKeyStatus::Unknown);
        t.trust_host_key("h", 22, "aa");
        assert_eq!(t.host_key_status("H", 22, "aa"), HostKeyStatus::Trusted);
        assert_eq!(t.host_key_status("h", 22, "bb"), HostKeyStatus::Changed);
        t.trust_certificate("h", 21, "ff");
        assert!(t.is_certificate_trusted("H", 21, "ff"));
    }

    #[test]
    fn options_swap_updates_limits() {
        let ctx = EngineContext::default();
        assert!(!ctx.rate_limiter().is_limited(crate::rate_limit::Direction::Inbound));
        ctx.set_options(EngineOptions { speed_limit_inbound: 1024, ..EngineOptions::default() });
        assert!(ctx.rate_limiter().is_limited(crate::rate_limit::Direction::Inbound));
        assert_eq!(ctx.options().speed_limit_inbound, 1024);
    }
}
