//! Event-driven timer: deadline heap over a one-shot timerfd.
//!
//! Cancellation is lazy: cancelled handles go into a set and are skipped
//! when they surface at the top of the heap. Recurring entries keep their
//! handle across rearms so a single cancel kills all future fires.

use std::collections::{BinaryHeap, HashSet};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::trace;

use iomgr_core::device::{IODevice, IoDevicePtr, IoDeviceScope};
use iomgr_core::error::{IomgrError, Result};
use iomgr_core::interface::IOInterface;
use iomgr_core::thread::ThreadRegex;
use iomgr_core::timer::{Timer, TimerCallback, TimerCookie, TimerHandle};

use crate::fds::TimerFd;
use crate::manager::iomanager;

struct HeapEntry {
    deadline: Instant,
    handle: TimerHandle,
    period: Option<Duration>,
    cookie: TimerCookie,
    cb: TimerCallback,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.handle == other.handle
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse for a min-heap; tie-break by handle for determinism.
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.handle.cmp(&self.handle),
            ord => ord,
        }
    }
}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    /// Handles currently armed (incl. between fires of a recurring one).
    live: HashSet<TimerHandle>,
    cancelled: HashSet<TimerHandle>,
}

/// The timerfd + heap engine. The owner watches `fd()` for readability
/// and calls `collect_due()` when it fires.
pub struct EventTimer {
    tfd: TimerFd,
    inner: Mutex<Inner>,
    stopped: AtomicBool,
}

impl EventTimer {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            tfd: TimerFd::create()?,
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                live: HashSet::new(),
                cancelled: HashSet::new(),
            }),
            stopped: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.tfd.fd()
    }

    pub fn schedule(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        cb: TimerCallback,
    ) -> Result<TimerHandle> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(IomgrError::Configuration("timer is stopped"));
        }
        let handle = TimerHandle::next();
        let mut inner = self.inner.lock().unwrap();
        inner.heap.push(HeapEntry {
            deadline: Instant::now() + after,
            handle,
            period: recurring.then_some(after),
            cookie,
            cb,
        });
        inner.live.insert(handle);
        self.rearm(&mut inner);
        Ok(handle)
    }

    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.live.remove(&handle) {
            inner.cancelled.insert(handle);
            true
        } else {
            false
        }
    }

    /// Pop everything due, reschedule recurring entries, rearm to the next
    /// deadline. Callbacks are returned, not run; the caller invokes them
    /// outside the lock (inline for thread timers, multicast for global
    /// ones).
    pub fn collect_due(&self) -> Vec<(TimerCallback, TimerCookie)> {
        self.tfd.drain();
        let mut due = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        while let Some(top) = inner.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = inner.heap.pop().unwrap();
            if inner.cancelled.remove(&entry.handle) {
                continue;
            }
            due.push((entry.cb.clone(), entry.cookie.clone()));
            match entry.period {
                Some(period) => {
                    // Same handle across rearms: cancel stays effective.
                    inner.heap.push(HeapEntry {
                        deadline: now + period,
                        ..entry
                    });
                }
                None => {
                    inner.live.remove(&entry.handle);
                }
            }
        }
        if inner.heap.is_empty() {
            inner.cancelled.clear();
        }
        self.rearm(&mut inner);
        trace!(fired = due.len(), "timer expiry");
        due
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let mut inner = self.inner.lock().unwrap();
        inner.heap.clear();
        inner.live.clear();
        inner.cancelled.clear();
        let _ = self.tfd.disarm();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().live.len()
    }

    fn rearm(&self, inner: &mut Inner) {
        match inner.heap.peek() {
            Some(top) => {
                let after = top.deadline.saturating_duration_since(Instant::now());
                let _ = self.tfd.arm_oneshot(after);
            }
            None => {
                let _ = self.tfd.disarm();
            }
        }
    }
}

/// Global timer on the event backend: the engine's timerfd rides the
/// generic interface as a global-scope device, so whichever reactor reaps
/// the expiry multicasts the callback to the timer's thread group.
pub struct GlobalEventTimer {
    scope: ThreadRegex,
    engine: EventTimer,
    iodev: RwLock<Option<IoDevicePtr>>,
    stopped: AtomicBool,
}

impl GlobalEventTimer {
    pub fn new(scope: ThreadRegex) -> Result<Arc<Self>> {
        debug_assert!(matches!(
            scope,
            ThreadRegex::AllWorker | ThreadRegex::AllUser
        ));
        let timer = Arc::new(Self {
            scope,
            engine: EventTimer::new()?,
            iodev: RwLock::new(None),
            stopped: AtomicBool::new(false),
        });

        let iface = iomanager().generic_interface()?;
        let dyn_iface: Arc<dyn IOInterface> = iface.clone();
        let weak = Arc::downgrade(&timer);
        let on_readable: iomgr_core::device::DeviceCallback = Arc::new(move |_dev, _events| {
            if let Some(t) = weak.upgrade() {
                t.on_expiry();
            }
        });
        let dev = IODevice::fd_device(
            timer.engine.fd(),
            libc::EPOLLIN as u32,
            IoDeviceScope::Global,
            &dyn_iface,
            Some(on_readable),
        );
        iface.add_io_device(dev.clone(), true);
        *timer.iodev.write().unwrap() = Some(dev);
        Ok(timer)
    }

    fn on_expiry(&self) {
        for (cb, cookie) in self.engine.collect_due() {
            iomanager().run_on(
                self.scope,
                move |_addr| cb(cookie.clone()),
                false,
            );
        }
    }
}

impl Timer for GlobalEventTimer {
    fn schedule(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        cb: TimerCallback,
    ) -> Result<TimerHandle> {
        self.engine.schedule(after, recurring, cookie, cb)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        self.engine.cancel(handle)
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.stop();
        if let Some(dev) = self.iodev.write().unwrap().take() {
            if let Ok(iface) = iomanager().generic_interface() {
                iface.remove_io_device(&dev, true);
            }
        }
    }
}

impl Drop for GlobalEventTimer {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::Acquire) {
            self.engine.stop();
        }
    }
}
