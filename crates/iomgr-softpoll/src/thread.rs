//! Cooperative software thread.
//!
//! `send()` may be called from any OS thread; `poll()` only from the
//! reactor that owns the thread. Closures and timer callbacks execute
//! inside `poll()`, so they run on the reactor's OS thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

use iomgr_core::env::env_get;
use iomgr_core::poll_env::{PollTimerId, PolledThread};

/// How many queued closures a single `poll()` runs before returning to
/// the reactor loop.
const POLL_BATCH: usize = 128;

struct SoftTimer {
    id: PollTimerId,
    deadline: Instant,
    period: Option<Duration>,
    cb: Arc<dyn Fn() + Send + Sync>,
}

pub struct SoftPollThread {
    name: String,
    inbox: ArrayQueue<Box<dyn FnOnce() + Send>>,
    /// Few timers per thread in practice; a scan beats heap bookkeeping.
    timers: Mutex<Vec<SoftTimer>>,
    next_timer_id: AtomicU64,
    down: AtomicBool,
}

impl SoftPollThread {
    pub fn new(name: &str) -> Arc<Self> {
        let depth: usize = env_get(
            "IOMGR_MSGQ_CAPACITY",
            iomgr_core::constants::DEFAULT_MSGQ_CAPACITY,
        );
        Arc::new(Self {
            name: name.to_string(),
            inbox: ArrayQueue::new(depth),
            timers: Mutex::new(Vec::new()),
            next_timer_id: AtomicU64::new(1),
            down: AtomicBool::new(false),
        })
    }

    /// Stop accepting work. Queued closures are dropped unrun.
    pub fn teardown(&self) {
        self.down.store(true, Ordering::Release);
        while self.inbox.pop().is_some() {}
        self.timers.lock().unwrap().clear();
    }

    fn fire_expired(&self) -> usize {
        let now = Instant::now();
        let mut due: Vec<Arc<dyn Fn() + Send + Sync>> = Vec::new();
        {
            let mut timers = self.timers.lock().unwrap();
            let mut i = 0;
            while i < timers.len() {
                if timers[i].deadline <= now {
                    due.push(timers[i].cb.clone());
                    match timers[i].period {
                        Some(period) => {
                            timers[i].deadline = now + period;
                            i += 1;
                        }
                        None => {
                            timers.swap_remove(i);
                        }
                    }
                } else {
                    i += 1;
                }
            }
        }
        // Callbacks run outside the lock; they may schedule new timers.
        for cb in &due {
            cb();
        }
        due.len()
    }
}

impl PolledThread for SoftPollThread {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, f: Box<dyn FnOnce() + Send>) -> bool {
        if self.down.load(Ordering::Acquire) {
            return false;
        }
        self.inbox.push(f).is_ok()
    }

    fn poll(&self) -> usize {
        let mut ran = 0;
        while let Some(f) = self.inbox.pop() {
            f();
            ran += 1;
            if ran >= POLL_BATCH {
                break;
            }
        }
        ran + self.fire_expired()
    }

    fn schedule_timer(
        &self,
        after: Duration,
        recurring: bool,
        cb: Arc<dyn Fn() + Send + Sync>,
    ) -> PollTimerId {
        let id = self.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock().unwrap();
        timers.push(SoftTimer {
            id,
            deadline: Instant::now() + after,
            period: recurring.then_some(after),
            cb,
        });
        id
    }

    fn cancel_timer(&self, id: PollTimerId) -> bool {
        let mut timers = self.timers.lock().unwrap();
        let before = timers.len();
        timers.retain(|t| t.id != id);
        timers.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_send_then_poll_runs_in_order() {
        let t = SoftPollThread::new("soft-0");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            assert!(t.send(Box::new(move || order.lock().unwrap().push(i))));
        }
        assert_eq!(t.poll(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_send_after_teardown_rejected() {
        let t = SoftPollThread::new("soft-0");
        t.teardown();
        assert!(!t.send(Box::new(|| {})));
        assert_eq!(t.poll(), 0);
    }

    #[test]
    fn test_oneshot_timer_fires_once() {
        let t = SoftPollThread::new("soft-0");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        t.schedule_timer(
            Duration::ZERO,
            false,
            Arc::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        );
        t.poll();
        t.poll();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_recurring_timer_rearms_until_cancel() {
        let t = SoftPollThread::new("soft-0");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = t.schedule_timer(
            Duration::ZERO,
            true,
            Arc::new(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        );
        t.poll();
        t.poll();
        assert!(hits.load(Ordering::Relaxed) >= 2);

        assert!(t.cancel_timer(id));
        let seen = hits.load(Ordering::Relaxed);
        t.poll();
        assert_eq!(hits.load(Ordering::Relaxed), seen);
        assert!(!t.cancel_timer(id));
    }
}
