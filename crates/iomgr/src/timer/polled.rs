//! Polled-backend global timer.
//!
//! Piggybacks the polled runtime's timer primitive on one host polled
//! thread; every fire multicasts the callback to the timer's thread
//! group. Used as the global worker timer when the manager runs the
//! polled backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use iomgr_core::error::{IomgrError, Result};
use iomgr_core::poll_env::{PollTimerId, PolledThread};
use iomgr_core::thread::ThreadRegex;
use iomgr_core::timer::{Timer, TimerCallback, TimerCookie, TimerHandle};

use crate::manager::iomanager;

pub struct GlobalPolledTimer {
    scope: ThreadRegex,
    host: Arc<dyn PolledThread>,
    ids: Mutex<HashMap<TimerHandle, PollTimerId>>,
    self_weak: Weak<Self>,
    stopped: AtomicBool,
}

impl GlobalPolledTimer {
    /// `host` is the polled thread whose poller drives the deadlines,
    /// typically the first worker's.
    pub fn new(scope: ThreadRegex, host: Arc<dyn PolledThread>) -> Arc<Self> {
        debug_assert!(matches!(
            scope,
            ThreadRegex::AllWorker | ThreadRegex::AllUser
        ));
        Arc::new_cyclic(|weak| Self {
            scope,
            host,
            ids: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
            stopped: AtomicBool::new(false),
        })
    }
}

impl Timer for GlobalPolledTimer {
    fn schedule(
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
        let scope = self.scope;
        let weak = self.self_weak.clone();
        let wrapped: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            let cb = cb.clone();
            let cookie = cookie.clone();
            iomanager().run_on(scope, move |_addr| cb(cookie.clone()), false);
            if !recurring {
                // One-shot fired; forget its mapping.
                if let Some(t) = weak.upgrade() {
                    t.ids.lock().unwrap().remove(&handle);
                }
            }
        });
        let pid = self.host.schedule_timer(after, recurring, wrapped);
        self.ids.lock().unwrap().insert(handle, pid);
        Ok(handle)
    }

    fn cancel(&self, handle: TimerHandle) -> bool {
        match self.ids.lock().unwrap().remove(&handle) {
            Some(pid) => self.host.cancel_timer(pid),
            None => false,
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<PollTimerId> = self.ids.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pid in drained {
            self.host.cancel_timer(pid);
        }
    }
}
