//! Timer contract
//!
//! The engine never reads a clock. Guard timers are requested from a
//! [`TimerService`] and come back through `Connection::on_timer` with the id
//! the service handed out. A fired id that no longer matches an armed timer
//! is ignored, so services need not guarantee cancellation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use crate::registry::ConnectionHandle;

/// Which guard a timer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Opening handshake deadline
    Handshake,
    /// Close handshake deadline
    Close,
    /// Pong deadline after a ping
    Pong,
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimerKind::Handshake => "handshake",
            TimerKind::Close => "close",
            TimerKind::Pong => "pong",
        })
    }
}

/// Opaque timer id issued by a [`TimerService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Schedules one-shot timers on behalf of connections
pub trait TimerService: Send + Sync {
    /// Arrange for `Connection::on_timer(id)` to be called on `handle` after `after`
    fn schedule(&self, handle: ConnectionHandle, kind: TimerKind, after: Duration) -> TimerId;

    /// Best-effort cancellation
    fn cancel(&self, id: TimerId);
}

/// A timer that came due
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    /// Connection that armed the timer
    pub handle: ConnectionHandle,
    /// Id to pass back to `on_timer`
    pub id: TimerId,
    /// What the timer guards
    pub kind: TimerKind,
}

#[derive(Debug, Default)]
struct Pending {
    now: Duration,
    next_id: u64,
    by_deadline: BTreeMap<(Duration, u64), (ConnectionHandle, TimerKind)>,
    deadlines: HashMap<u64, Duration>,
}

/// Timer service driven by an explicit clock
///
/// Embeddings with their own time source call [`ManualTimers::advance`] and
/// forward the expired timers to the registry.
#[derive(Debug, Default)]
pub struct ManualTimers {
    inner: Mutex<Pending>,
}

impl ManualTimers {
    /// Create a service with its clock at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current clock value
    pub fn now(&self) -> Duration {
        self.inner.lock().now
    }

    /// Number of armed timers
    pub fn pending(&self) -> usize {
        self.inner.lock().deadlines.len()
    }

    /// Deadline of the earliest armed timer
    pub fn next_deadline(&self) -> Option<Duration> {
        self.inner.lock().by_deadline.keys().next().map(|(at, _)| *at)
    }

    /// Move the clock forward and collect every timer that came due, in order
    pub fn advance(&self, by: Duration) -> Vec<Expired> {
        let mut inner = self.inner.lock();
        inner.now += by;
        let now = inner.now;

        let mut expired = Vec::new();
        while let Some(entry) = inner.by_deadline.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), (handle, kind)) = entry.remove_entry();
            inner.deadlines.remove(&id);
            expired.push(Expired {
                handle,
                id: TimerId(id),
                kind,
            });
        }
        expired
    }
}

impl TimerService for ManualTimers {
    fn schedule(&self, handle: ConnectionHandle, kind: TimerKind, after: Duration) -> TimerId {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let at = inner.now + after;
        inner.by_deadline.insert((at, id), (handle, kind));
        inner.deadlines.insert(id, at);
        TimerId(id)
    }

    fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        if let Some(at) = inner.deadlines.remove(&id.0) {
            inner.by_deadline.remove(&(at, id.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_fires_in_deadline_order() {
        let timers = ManualTimers::new();
        let h = ConnectionHandle::from_raw(0, 0);

        let late = timers.schedule(h, TimerKind::Close, Duration::from_secs(5));
        let early = timers.schedule(h, TimerKind::Pong, Duration::from_secs(1));
        assert_eq!(timers.next_deadline(), Some(Duration::from_secs(1)));

        assert!(timers.advance(Duration::from_millis(999)).is_empty());
        let fired = timers.advance(Duration::from_secs(10));
        assert_eq!(
            fired.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![early, late]
        );
        assert_eq!(fired[0].kind, TimerKind::Pong);
        assert_eq!(timers.pending(), 0);
    }

    #[test]
    fn test_cancel() {
        let timers = ManualTimers::new();
        let h = ConnectionHandle::from_raw(1, 0);
        let id = timers.schedule(h, TimerKind::Handshake, Duration::from_secs(1));
        timers.cancel(id);
        timers.cancel(id);
        assert!(timers.advance(Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_timer_kind_display() {
        assert_eq!(TimerKind::Pong.to_string(), "pong");
    }
}
