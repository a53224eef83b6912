//! Building blocks shared by the protocol state machines: the owned stack of
//! in-flight operations, transfer end reasons and the activity timer.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// LIFO chain of operation frames. The top is what runs next; a finished
/// frame is popped and its parent re-entered with the sub-result.
#[derive(Debug)]
pub struct OpStack<T> {
    frames: Vec<T>,
}

impl<T> Default for OpStack<T> {
    fn default() -> Self {
        Self { frames: Vec::new() }
    }
}

impl<T> OpStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: T) {
        self.frames.push(op);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&T> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut T> {
        self.frames.last_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Bottom frame: the top-level command.
    pub fn root(&self) -> Option<&T> {
        self.frames.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.frames.iter().rev()
    }

    /// Remove every frame, innermost first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out: Vec<T> = self.frames.drain(..).collect();
        out.reverse();
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferEndReason {
    #[default]
    None,
    Successful,
    Timeout,
    TransferFailure,
    /// Retrying will not help, e.g. disk full.
    TransferFailureCritical,
    PreTransferCommandFailure,
    TransferCommandFailure,
    TransferCommandFailureImmediate,
    Failure,
    FailedResumetest,
}

impl TransferEndReason {
    pub fn is_success(self) -> bool {
        self == TransferEndReason::Successful
    }

    pub fn is_critical(self) -> bool {
        matches!(
            self,
            TransferEndReason::TransferFailureCritical | TransferEndReason::FailedResumetest
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    Nothing,
    TimedOut,
    KeepAlive,
}

/// Inactivity timeout and keep-alive scheduling, independent of command state.
#[derive(Debug, Clone)]
pub struct ActivityTimer {
    last_activity: Instant,
    timeout: Option<Duration>,
    keepalive: Option<Duration>,
}

impl ActivityTimer {
    pub fn new(timeout: Option<Duration>, keepalive: Option<Duration>) -> Self {
        Self {
            last_activity: Instant::now(),
            timeout,
            keepalive,
        }
    }

    pub fn record_activity(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// `busy`: an operation is waiting on the server.
    pub fn poll(&self, now: Instant, busy: bool) -> TimerAction {
        let idle = now.saturating_duration_since(self.last_activity);
        if busy {
            match self.timeout {
                Some(t) if idle >= t => TimerAction::TimedOut,
                _ => TimerAction::Nothing,
            }
        } else {
            match self.keepalive {
                Some(k) if idle >= k => TimerAction::KeepAlive,
                _ => TimerAction::Nothing,
            }
        }
    }

    pub fn next_deadline(&self, busy: bool) -> Option<Instant> {
        let window = if busy { self.timeout } else { self.keepalive };
        window.map(|w| self.last_activity + w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_lifo() {
        let mut s = OpStack::new();
        s.push("list");
        s.push("cwd");
        assert_eq!(s.top(), Some(&"cwd"));
        assert_eq!(s.root(), Some(&"list"));
        assert_eq!(s.drain(), vec!["cwd", "list"]);
        assert!(s.is_empty());
    }

    #[test]
    fn timer_distinguishes_busy_and_idle() {
        let start = Instant::now();
        let mut t = ActivityTimer::new(Some(Duration::from_secs(20)), Some(Duration::from_secs(30)));
        t.record_activity(start);
        assert_eq!(t.poll(start + Duration::from_secs(25), true), TimerAction::TimedOut);
        assert_eq!(t.poll(start + Duration::from_secs(25), false), TimerAction::Nothing);
        assert_eq!(t.poll(start + Duration::from_secs(31), false), TimerAction::KeepAlive);
        t.record_activity(start + Duration::from_secs(31));
        assert_eq!(t.poll(start + Duration::from_secs(40), true), TimerAction::Nothing);
        assert_eq!(t.next_deadline(false), Some(start + Duration::from_secs(61)));
    }

    #[test]
    fn critical_reasons() {
        assert!(TransferEndReason::TransferFailureCritical.is_critical());
        assert!(!TransferEndReason::TransferFailure.is_critical());
        assert!(TransferEndReason::Successful.is_success());
    }
}
