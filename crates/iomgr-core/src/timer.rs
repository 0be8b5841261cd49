//! Timer vocabulary: handles, cookies, the scheduling trait.
//!
//! Two flavors implement `Timer` in the runtime crate: event-driven
//! (timerfd rearmed on expiry) and polled (piggybacking the polled
//! runtime's timer primitive). The trait is the seam the manager's global
//! timers and the per-reactor thread timers share.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Opaque cookie passed back to the timer callback.
pub type TimerCookie = Option<Arc<dyn Any + Send + Sync>>;

/// Timer callback, invoked with a clone of the cookie.
pub type TimerCallback = Arc<dyn Fn(TimerCookie) + Send + Sync>;

/// Process-unique handle for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub u64);

impl TimerHandle {
    /// Issue a fresh handle.
    #[inline]
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TimerHandle(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// One-shot and recurring timer scheduling.
pub trait Timer: Send + Sync {
    /// Arm a timer `after` from now. Recurring timers re-arm on expiry
    /// until cancelled.
    fn schedule(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        cb: TimerCallback,
    ) -> Result<TimerHandle>;

    /// Best-effort cancel: the timer either fired-and-completed or was
    /// cancelled before firing; returns true in the latter case.
    fn cancel(&self, handle: TimerHandle) -> bool;

    /// Drop all pending timers; further schedules fail.
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_uniqueness() {
        let handles: Vec<_> = (0..1000).map(|_| TimerHandle::next()).collect();
        let unique: std::collections::HashSet<_> = handles.iter().collect();
        assert_eq!(handles.len(), unique.len());
    }
}
