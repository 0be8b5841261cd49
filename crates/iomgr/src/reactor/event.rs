//! Event-driven reactor: epoll + eventfd wake source + timerfd thread
//! timer.
//!
//! One io_thread per reactor at local address 0. The inbound message
//! queue is a bounded MPSC ring; producers push from any thread and bump
//! the eventfd, the loop drains on wake. Device fds are registered with
//! the fd itself as the epoll token.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tracing::{debug, error};

use iomgr_core::device::IoDevicePtr;
use iomgr_core::env::env_get;
use iomgr_core::error::{IomgrError, Result};
use iomgr_core::msg::{IomgrMsg, MsgKind};
use iomgr_core::reactor::{IOReactor, ThreadStateNotifier};
use iomgr_core::thread::{IoThreadAddr, IoThreadPtr, ReactorIdx, ThreadBackend};
use iomgr_core::timer::{TimerCallback, TimerCookie, TimerHandle};

use crate::fds::{Epoll, EventFd};
use crate::manager::iomanager;
use crate::reactor::dispatch_msg;
use crate::reactors;
use crate::timer::EventTimer;

pub struct IOReactorEPoll {
    idx: ReactorIdx,
    worker_slot: Option<usize>,
    epoll: Epoll,
    wake: EventFd,
    inbox: ArrayQueue<IomgrMsg>,
    threads: RwLock<Vec<IoThreadPtr>>,
    devices: Mutex<HashMap<RawFd, IoDevicePtr>>,
    thread_timer: EventTimer,
    io_ready: AtomicBool,
    stopping: AtomicBool,
    addl_notifier: Option<ThreadStateNotifier>,
}

impl IOReactorEPoll {
    /// `worker_slot` is set for manager-spawned reactors; `None` makes a
    /// user reactor.
    pub fn new(
        idx: ReactorIdx,
        worker_slot: Option<usize>,
        addl_notifier: Option<ThreadStateNotifier>,
    ) -> Result<Arc<Self>> {
        let epoll = Epoll::create()?;
        let wake = EventFd::create()?;
        let thread_timer = EventTimer::new()?;
        epoll.add(wake.fd(), libc::EPOLLIN as u32)?;
        epoll.add(thread_timer.fd(), libc::EPOLLIN as u32)?;

        let depth: usize = env_get(
            "IOMGR_MSGQ_CAPACITY",
            iomgr_core::constants::DEFAULT_MSGQ_CAPACITY,
        );
        Ok(Arc::new(Self {
            idx,
            worker_slot,
            epoll,
            wake,
            inbox: ArrayQueue::new(depth),
            threads: RwLock::new(Vec::new()),
            devices: Mutex::new(HashMap::new()),
            thread_timer,
            io_ready: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            addl_notifier,
        }))
    }

    /// The loop. Runs on the calling OS thread until the reactor is told
    /// to relinquish its io_thread.
    pub fn run(self: Arc<Self>) {
        let dyn_self: Arc<dyn IOReactor> = self.clone();
        reactors::attach(self.idx, dyn_self.clone());

        let thr = match iomanager().make_io_thread(&dyn_self, 0, ThreadBackend::Reactor(self.idx))
        {
            Ok(t) => t,
            Err(e) => {
                error!(idx = self.idx, error = %e, "reactor could not create io thread");
                reactors::detach(self.idx);
                iomanager().reactor_start_aborted(self.worker_slot.is_some());
                return;
            }
        };
        self.threads.write().unwrap().push(thr.clone());

        iomanager().foreach_interface(|iface| iface.on_io_thread_start(&thr));
        self.io_ready.store(true, Ordering::Release);
        iomanager().reactor_started(&dyn_self);
        debug!(idx = self.idx, worker = ?self.worker_slot, "event reactor loop entered");

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 64];
        loop {
            let n = match self.epoll.wait(&mut events, -1) {
                Ok(n) => n,
                Err(e) => {
                    error!(idx = self.idx, error = %e, "epoll wait failed, exiting loop");
                    self.stopping.store(true, Ordering::Release);
                    0
                }
            };
            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                if fd == self.wake.fd() {
                    self.wake.drain();
                } else if fd == self.thread_timer.fd() {
                    for (cb, cookie) in self.thread_timer.collect_due() {
                        cb(cookie);
                    }
                } else {
                    let dev = self.devices.lock().unwrap().get(&fd).cloned();
                    if let Some(dev) = dev {
                        dev.fire_event(ev.events);
                    }
                }
            }
            self.drain_inbox(&thr);
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
        }

        // Teardown: reject further deliveries, then run down whatever was
        // accepted before the flip.
        self.io_ready.store(false, Ordering::Release);
        self.drain_inbox(&thr);

        self.notify_thread_state(false);
        iomanager().foreach_interface(|iface| iface.on_io_thread_stop(&thr));
        iomanager().release_io_thread(&thr);
        self.threads.write().unwrap().clear();
        self.thread_timer.stop();
        reactors::detach(self.idx);
        iomanager().reactor_stopped();
        debug!(idx = self.idx, "event reactor loop exited");
    }

    fn drain_inbox(&self, thr: &IoThreadPtr) {
        while let Some(msg) = self.inbox.pop() {
            dispatch_msg(msg);
            thr.decr_pending(1);
        }
    }
}

impl IOReactor for IOReactorEPoll {
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
        false
    }

    fn io_threads(&self) -> Vec<IoThreadPtr> {
        self.threads.read().unwrap().clone()
    }

    fn select_thread(&self) -> Option<IoThreadPtr> {
        self.threads.read().unwrap().first().cloned()
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

    fn deliver_msg(&self, addr: IoThreadAddr, mut msg: IomgrMsg) -> bool {
        if !self.is_io_reactor() {
            return false;
        }
        let thr = match self.addr_to_thread(addr) {
            Some(t) => t,
            None => return false,
        };
        msg.dest_addr = addr;
        thr.incr_pending(1);
        match self.inbox.push(msg) {
            Ok(()) => {
                let _ = self.wake.notify();
                true
            }
            Err(_rejected) => {
                // Queue full; the message drops here, which is the one
                // free the ownership contract requires.
                thr.decr_pending(1);
                false
            }
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
            MsgKind::Custom(_) => {} // custom kinds belong to their module
        }
    }

    fn add_iodev(&self, dev: &IoDevicePtr) -> Result<()> {
        let fd = dev
            .fd()
            .ok_or(IomgrError::Configuration("event reactor takes fd devices"))?;
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&fd) {
            // Startup callback and registration multicast can overlap.
            return Ok(());
        }
        self.epoll.add(fd, dev.events_of_interest)?;
        devices.insert(fd, dev.clone());
        Ok(())
    }

    fn remove_iodev(&self, dev: &IoDevicePtr) -> Result<()> {
        let fd = dev
            .fd()
            .ok_or(IomgrError::Configuration("event reactor takes fd devices"))?;
        if self.devices.lock().unwrap().remove(&fd).is_some() {
            let _ = self.epoll.del(fd);
        }
        Ok(())
    }

    fn schedule_thread_timer(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        cb: TimerCallback,
    ) -> Result<TimerHandle> {
        self.thread_timer.schedule(after, recurring, cookie, cb)
    }

    fn cancel_thread_timer(&self, handle: TimerHandle) -> bool {
        self.thread_timer.cancel(handle)
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
