//! Polled reactor: busy-loops a polled-runtime thread.
//!
//! Messages bypass any reactor-owned queue; they are wrapped into
//! closures and handed to the polled thread's send primitive, which is
//! also the shortcut `send_msg` takes when the destination's backend
//! identity is a polled handle. The loop advances the polled thread and
//! throttles only when a pass did no work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, error};

use iomgr_core::device::IoDevicePtr;
use iomgr_core::env::env_get;
use iomgr_core::error::{IomgrError, Result};
use iomgr_core::msg::{IomgrMsg, MsgKind};
use iomgr_core::poll_env::{PollTimerId, PolledThread};
use iomgr_core::reactor::{IOReactor, ThreadStateNotifier};
use iomgr_core::thread::{IoThreadAddr, IoThreadPtr, ReactorIdx, ThreadBackend};
use iomgr_core::timer::{TimerCallback, TimerCookie, TimerHandle};

use crate::manager::iomanager;
use crate::reactor::dispatch_msg;
use crate::reactors;

/// Hand a message straight to a polled io_thread's queue, no reactor
/// lookup. The per-thread metrics bracket the dispatch.
pub(crate) fn deliver_to_polled(thr: &IoThreadPtr, mut msg: IomgrMsg) -> bool {
    let pt = match &thr.backend {
        ThreadBackend::Polled(pt) => pt.clone(),
        ThreadBackend::Reactor(_) => return false,
    };
    msg.dest_addr = thr.thread_addr;
    thr.incr_pending(1);
    let t = thr.clone();
    let ok = pt.send(Box::new(move || {
        dispatch_msg(msg);
        t.decr_pending(1);
    }));
    if !ok {
        thr.decr_pending(1);
    }
    ok
}

pub struct IOReactorPolled {
    idx: ReactorIdx,
    worker_slot: Option<usize>,
    threads: RwLock<Vec<IoThreadPtr>>,
    polled_threads: RwLock<Vec<Arc<dyn PolledThread>>>,
    devices: Mutex<Vec<IoDevicePtr>>,
    timer_ids: Mutex<HashMap<TimerHandle, PollTimerId>>,
    self_weak: Weak<Self>,
    io_ready: AtomicBool,
    stopping: AtomicBool,
    rr: AtomicUsize,
    addl_notifier: Option<ThreadStateNotifier>,
    idle_sleep: Duration,
}

impl IOReactorPolled {
    pub fn new(
        idx: ReactorIdx,
        worker_slot: Option<usize>,
        addl_notifier: Option<ThreadStateNotifier>,
    ) -> Arc<Self> {
        let idle_us: u64 = env_get("IOMGR_REACTOR_IDLE_US", 50);
        Arc::new_cyclic(|weak| Self {
            idx,
            worker_slot,
            threads: RwLock::new(Vec::new()),
            polled_threads: RwLock::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            timer_ids: Mutex::new(HashMap::new()),
            self_weak: weak.clone(),
            io_ready: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            rr: AtomicUsize::new(0),
            addl_notifier,
            idle_sleep: Duration::from_micros(idle_us),
        })
    }

    /// The loop. The polled thread must not block; the only suspension is
    /// the idle throttle after a pass that did no work.
    pub fn run(self: Arc<Self>) {
        let dyn_self: Arc<dyn IOReactor> = self.clone();
        reactors::attach(self.idx, dyn_self.clone());

        let abort = |why: &IomgrError| {
            error!(idx = self.idx, error = %why, "polled reactor could not start");
            reactors::detach(self.idx);
            iomanager().reactor_start_aborted(self.worker_slot.is_some());
        };

        let env = match iomanager().polled_env() {
            Some(env) => env,
            None => {
                abort(&IomgrError::InitFailure("no polled env installed".into()));
                return;
            }
        };
        let pt = match env.create_thread(&format!("iomgr-poll-{}", self.idx)) {
            Ok(pt) => pt,
            Err(e) => {
                abort(&e);
                return;
            }
        };
        let thr = match iomanager().make_io_thread(&dyn_self, 0, ThreadBackend::Polled(pt.clone()))
        {
            Ok(t) => t,
            Err(e) => {
                abort(&e);
                return;
            }
        };
        self.threads.write().unwrap().push(thr.clone());
        self.polled_threads.write().unwrap().push(pt.clone());

        iomanager().foreach_interface(|iface| iface.on_io_thread_start(&thr));
        self.io_ready.store(true, Ordering::Release);
        iomanager().reactor_started(&dyn_self);
        debug!(idx = self.idx, worker = ?self.worker_slot, "polled reactor loop entered");

        loop {
            let worked = pt.poll();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            if worked == 0 {
                if self.idle_sleep.is_zero() {
                    std::hint::spin_loop();
                } else {
                    std::thread::sleep(self.idle_sleep);
                }
            }
        }

        self.io_ready.store(false, Ordering::Release);
        // One more pass for closures accepted before the flip.
        pt.poll();

        self.notify_thread_state(false);
        iomanager().foreach_interface(|iface| iface.on_io_thread_stop(&thr));
        iomanager().release_io_thread(&thr);
        self.threads.write().unwrap().clear();
        self.polled_threads.write().unwrap().clear();
        self.timer_ids.lock().unwrap().clear();
        reactors::detach(self.idx);
        iomanager().reactor_stopped();
        debug!(idx = self.idx, "polled reactor loop exited");
    }

    fn first_polled_thread(&self) -> Option<Arc<dyn PolledThread>> {
        self.polled_threads.read().unwrap().first().cloned()
    }
}

impl IOReactor for IOReactorPolled {
    fn reactor_idx(&self) -> ReactorIdx {
        self.idx
    }

    fn is_worker(&self) -> bool {
        self.worker_slot.is_some()
    }

    fn worker_slot(&self) -> Option<usize> {
        self.worker_slot
    }

    fn is_io_reactor(&self) -> bool {
        self.io_ready.load(Ordering::Acquire) && !self.stopping.load(Ordering::Acquire)
    }

    fn is_polled(&self) -> bool {
        true
    }

    fn io_threads(&self) -> Vec<IoThreadPtr> {
        self.threads.read().unwrap().clone()
    }

    fn select_thread(&self) -> Option<IoThreadPtr> {
        let threads = self.threads.read().unwrap();
        if threads.is_empty() {
            return None;
        }
        let i = self.rr.fetch_add(1, Ordering::Relaxed) % threads.len();
        threads.get(i).cloned()
    }

    fn iothread_self(&self) -> Option<IoThreadPtr> {
        self.threads.read().unwrap().first().cloned()
    }

    fn addr_to_thread(&self, addr: IoThreadAddr) -> Option<IoThreadPtr> {
        self.threads
            .read()
            .unwrap()
            .iter()
            .find(|t| t.thread_addr == addr)
            .cloned()
    }

    fn deliver_msg(&self, addr: IoThreadAddr, msg: IomgrMsg) -> bool {
        if !self.is_io_reactor() {
            return false;
        }
        match self.addr_to_thread(addr) {
            Some(thr) => deliver_to_polled(&thr, msg),
            None => false,
        }
    }

    fn handle_msg(&self, msg: &IomgrMsg) {
        match msg.kind {
            MsgKind::Generic => {
                if let Some(method) = msg.method() {
                    method(msg.dest_addr);
                }
            }
            MsgKind::Reschedule => {
                if let Some(dev) = &msg.iodev {
                    dev.fire_event(msg.event);
                }
            }
            MsgKind::RelinquishIoThread => {
                debug!(idx = self.idx, "relinquishing io thread");
                self.stopping.store(true, Ordering::Release);
            }
            MsgKind::Custom(_) => {}
        }
    }

    fn add_iodev(&self, dev: &IoDevicePtr) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if !devices.iter().any(|d| Arc::ptr_eq(d, dev)) {
            devices.push(dev.clone());
        }
        Ok(())
    }

    fn remove_iodev(&self, dev: &IoDevicePtr) -> Result<()> {
        self.devices.lock().unwrap().retain(|d| !Arc::ptr_eq(d, dev));
        Ok(())
    }

    fn schedule_thread_timer(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        cb: TimerCallback,
    ) -> Result<TimerHandle> {
        let pt = self
            .first_polled_thread()
            .ok_or(IomgrError::Configuration("reactor has no polled thread"))?;
        let handle = TimerHandle::next();
        let weak = self.self_weak.clone();
        let wrapped: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
            cb(cookie.clone());
            if !recurring {
                if let Some(r) = weak.upgrade() {
                    r.timer_ids.lock().unwrap().remove(&handle);
                }
            }
        });
        let pid = pt.schedule_timer(after, recurring, wrapped);
        self.timer_ids.lock().unwrap().insert(handle, pid);
        Ok(handle)
    }

    fn cancel_thread_timer(&self, handle: TimerHandle) -> bool {
        let pid = match self.timer_ids.lock().unwrap().remove(&handle) {
            Some(pid) => pid,
            None => return false,
        };
        match self.first_polled_thread() {
            Some(pt) => pt.cancel_timer(pid),
            None => false,
        }
    }

    fn notify_thread_state(&self, started: bool) {
        let threads = self.threads.read().unwrap().clone();
        for _thr in threads {
            if let Some(n) = iomanager().thread_state_notifier() {
                n(started);
            }
            if let Some(n) = &self.addl_notifier {
                n(started);
            }
        }
    }
}
