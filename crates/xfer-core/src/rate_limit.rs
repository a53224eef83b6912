//! Shared transfer speed limits.
//!
//! One limiter per direction, shared by every engine. Callers ask for a
//! number of bytes and get back either a grant (possibly smaller than asked)
//! or the time to wait before asking again. The mutex is never held across
//! an await.

use governor::clock::{Clock, QuantaClock};
use governor::{DefaultDirectRateLimiter, Quota};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// May move this many bytes now.
    Granted(usize),
    /// Quota exhausted; retry after this long.
    Wait(Duration),
}

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    bytes_per_second: NonZeroU32,
}

impl Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("bytes_per_second", &self.bytes_per_second)
            .finish()
    }
}

impl Bucket {
    fn new(bytes_per_second: NonZeroU32) -> Self {
        Self {
            limiter: DefaultDirectRateLimiter::direct(Quota::per_second(bytes_per_second)),
            bytes_per_second,
        }
    }

    fn request(&self, bytes: usize) -> Grant {
        let clamped = bytes.min(self.bytes_per_second.get() as usize) as u32;
        let Some(n) = NonZeroU32::new(clamped) else {
            return Grant::Granted(0);
        };
        match self.limiter.check_n(n) {
            Ok(Ok(())) => Grant::Granted(clamped as usize),
            Ok(Err(not_until)) => Grant::Wait(not_until.wait_time_from(QuantaClock::default().now())),
            // Cannot happen with the clamp above; fall back to a short pause.
            Err(_) => Grant::Wait(Duration::from_millis(100)),
        }
    }
}

#[derive(Debug, Default)]
struct Limits {
    inbound: Option<Bucket>,
    outbound: Option<Bucket>,
}

/// Cloneable handle to the process-wide limiter.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    inner: Arc<Mutex<Limits>>,
}

impl RateLimiter {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Limits in bytes per second; `0` disables the limit.
    pub fn new(inbound: u32, outbound: u32) -> Self {
        let limiter = Self::default();
        limiter.set_limits(inbound, outbound);
        limiter
    }

    fn lock(&self) -> MutexGuard<'_, Limits> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_limits(&self, inbound: u32, outbound: u32) {
        let mut limits = self.lock();
        limits.inbound = NonZeroU32::new(inbound).map(Bucket::new);
        limits.outbound = NonZeroU32::new(outbound).map(Bucket::new);
    }

    pub fn is_limited(&self, direction: Direction) -> bool {
        let limits = self.lock();
        match direction {
            Direction::Inbound => limits.inbound.is_some(),
            Direction::Outbound => limits.outbound.is_some(),
        }
    }

    /// Single request/grant exchange.
    pub fn request(&self, direction: Direction, bytes: usize) -> Grant {
        let limits = self.lock();
        let bucket = match direction {
            Direction::Inbound => limits.inbound.as_ref(),
            Direction::Outbound => limits.outbound.as_ref(),
        };
        match bucket {
            Some(b) => b.request(bytes),
            None => Grant::Granted(bytes),
        }
    }

    /// Await until at least one byte is granted; returns the grant size.
    pub async fn acquire(&self, direction: Direction, bytes: usize) -> usize {
        loop {
            match self.request(direction, bytes) {
                Grant::Granted(n) => return n,
                Grant::Wait(d) => tokio::time::sleep(d.max(Duration::from_millis(1))).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_grants_everything() {
        let rl = RateLimiter::unlimited();
        assert_eq!(rl.request(Direction::Inbound, 1 << 20), Grant::Granted(1 << 20));
        assert!(!rl.is_limited(Direction::Outbound));
    }

    #[test]
    fn grants_are_clamped_then_exhausted() {
        let rl = RateLimiter::new(1000, 0);
        assert_eq!(rl.request(Direction::Inbound, 5000), Grant::Granted(1000));
        assert!(matches!(rl.request(Direction::Inbound, 500), Grant::Wait(_)));
        assert_eq!(rl.request(Direction::Outbound, 5000), Grant::Granted(5000));
    }

    #[test]
    fn clones_share_quota() {
        let a = RateLimiter::new(0, 100);
        let b = a.clone();
        assert_eq!(a.request(Direction::Outbound, 100), Grant::Granted(100));
        assert!(matches!(b.request(Direction::Outbound, 100), Grant::Wait(_)));
        b.set_limits(0, 0);
        assert_eq!(a.request(Direction::Outbound, 100), Grant::Granted(100));
    }

    #[tokio::test]
    async fn acquire_returns_grant() {
        let rl = RateLimiter::new(4096, 0);
        assert_eq!(rl.acquire(Direction::Inbound, 10).await, 10);
    }
}
