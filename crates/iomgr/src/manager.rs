//! The process-wide I/O manager.
//!
//! Owns the worker reactor pool, the interface lists, the message-module
//! table, the global timers and the thread-index reserver; drives the
//! start/stop state machine and implements the `send_msg` / `multicast`
//! / `run_on` routing semantics over the thread-regex selectors.
//!
//! One instance per process, reached through `iomanager()`.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use iomgr_core::constants::MAX_IO_THREADS;
use iomgr_core::error::{IomgrError, Result};
use iomgr_core::interface::{DriveInterface, IOInterface};
use iomgr_core::modules::{MsgHandler, MsgModuleId, MsgModuleTable};
use iomgr_core::msg::{IomgrMsg, MsgKind, SyncMsg};
use iomgr_core::poll_env::{PolledEnv, PolledThread};
use iomgr_core::reactor::{IOReactor, ThreadStateNotifier};
use iomgr_core::reserver::ThreadIdxReserver;
use iomgr_core::thread::{
    IoThread, IoThreadAddr, IoThreadPtr, ThreadBackend, ThreadRegex,
};
use iomgr_core::timer::{Timer, TimerCallback, TimerCookie, TimerHandle};
use iomgr_core::device::IoDevicePtr;

use crate::bufalloc::{self, DmaAlignedAllocator};
use crate::iface::{EventDriveInterface, GenericIOInterface, PolledDriveInterface};
use crate::reactor::polled::deliver_to_polled;
use crate::reactor::{IOReactorEPoll, IOReactorPolled};
use crate::reactors;
use crate::timer::{GlobalEventTimer, GlobalPolledTimer};

/// Lifecycle of the manager. Transitions are monotonic within one
/// start/stop cycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IomgrState {
    Uninitialized = 0,
    IfaceInit = 1,
    ReactorInit = 2,
    SysInit = 3,
    Running = 4,
    Stopping = 5,
    Stopped = 6,
}

impl IomgrState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => IomgrState::Uninitialized,
            1 => IomgrState::IfaceInit,
            2 => IomgrState::ReactorInit,
            3 => IomgrState::SysInit,
            4 => IomgrState::Running,
            5 => IomgrState::Stopping,
            _ => IomgrState::Stopped,
        }
    }
}

/// Callback slot for installing interfaces during `start`, in place of
/// the default drive interface.
pub type InterfaceAdder = Box<dyn FnOnce()>;

struct ReactorSlot {
    handle: Option<JoinHandle<()>>,
    reactor: Option<Arc<dyn IOReactor>>,
}

pub struct IOManager {
    state: AtomicU8,
    state_lock: Mutex<()>,
    state_cv: Condvar,

    worker_reactors: Mutex<Vec<ReactorSlot>>,

    iface_list: RwLock<Vec<Arc<dyn IOInterface>>>,
    drive_ifaces: RwLock<Vec<Arc<dyn DriveInterface>>>,
    default_drive_iface: RwLock<Option<Arc<dyn DriveInterface>>>,
    default_general_iface: RwLock<Option<Arc<GenericIOInterface>>>,

    msg_modules: MsgModuleTable,
    internal_module_id: AtomicUsize,

    global_user_timer: RwLock<Option<Arc<dyn Timer>>>,
    global_worker_timer: RwLock<Option<Arc<dyn Timer>>>,

    thread_idx_reserver: ThreadIdxReserver,

    is_polled_backend: AtomicBool,
    polled_env_external: AtomicBool,
    polled_env: RwLock<Option<Arc<dyn PolledEnv>>>,

    yet_to_start_nreactors: AtomicI64,
    yet_to_stop_nreactors: AtomicI64,

    common_notifier: RwLock<Option<ThreadStateNotifier>>,
}

static INSTANCE: OnceLock<IOManager> = OnceLock::new();

/// The process-wide manager instance.
pub fn iomanager() -> &'static IOManager {
    INSTANCE.get_or_init(IOManager::new)
}

impl IOManager {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(IomgrState::Uninitialized as u8),
            state_lock: Mutex::new(()),
            state_cv: Condvar::new(),
            worker_reactors: Mutex::new(Vec::new()),
            iface_list: RwLock::new(Vec::new()),
            drive_ifaces: RwLock::new(Vec::new()),
            default_drive_iface: RwLock::new(None),
            default_general_iface: RwLock::new(None),
            msg_modules: MsgModuleTable::new(),
            internal_module_id: AtomicUsize::new(0),
            global_user_timer: RwLock::new(None),
            global_worker_timer: RwLock::new(None),
            thread_idx_reserver: ThreadIdxReserver::new(MAX_IO_THREADS),
            is_polled_backend: AtomicBool::new(false),
            polled_env_external: AtomicBool::new(false),
            polled_env: RwLock::new(None),
            yet_to_start_nreactors: AtomicI64::new(0),
            yet_to_stop_nreactors: AtomicI64::new(0),
            common_notifier: RwLock::new(None),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Bring the manager up with `num_threads` worker reactors.
    ///
    /// `is_polled` selects the busy-poll backend; a polled environment
    /// must have been installed with `set_polled_env` beforehand, and is
    /// initialized here only if it was not already initialized
    /// externally. Returns without side effects when already running.
    pub fn start(
        &self,
        num_threads: usize,
        is_polled: bool,
        notifier: Option<ThreadStateNotifier>,
        iface_adder: Option<InterfaceAdder>,
    ) -> Result<()> {
        if self.get_state() == IomgrState::Running {
            warn!("start requested but IOManager is already running, ignoring");
            return Ok(());
        }

        info!(num_threads, is_polled, "starting IOManager");
        self.is_polled_backend.store(is_polled, Ordering::Release);
        self.yet_to_start_nreactors
            .store(num_threads as i64, Ordering::Release);
        self.yet_to_stop_nreactors.store(0, Ordering::Release);
        *self.common_notifier.write().unwrap() = notifier;

        // The internal module routes to the receiving reactor itself.
        let internal_id = self.msg_modules.register(Arc::new(|msg| {
            match reactors::this_reactor() {
                Some(r) => r.handle_msg(msg),
                None => warn!("internal message dispatched on a non-reactor thread"),
            }
        }))?;
        self.internal_module_id.store(internal_id, Ordering::Release);

        if is_polled {
            if let Err(e) = self.start_polled_env() {
                error!(error = %e, "polled environment init failed");
                self.set_state(IomgrState::Uninitialized);
                return Err(e);
            }
        }

        self.set_state(IomgrState::IfaceInit);
        let generic = Arc::new(GenericIOInterface::new());
        *self.default_general_iface.write().unwrap() = Some(generic.clone());
        self.add_interface(generic);

        match iface_adder {
            Some(adder) => adder(),
            None => {
                let drive: Arc<dyn DriveInterface> = if is_polled {
                    Arc::new(PolledDriveInterface::new())
                } else {
                    Arc::new(EventDriveInterface::new())
                };
                self.add_drive_interface(drive, true);
            }
        }

        self.set_state(IomgrState::ReactorInit);
        {
            let mut slots = self.worker_reactors.lock().unwrap();
            slots.clear();
            slots.reserve(num_threads);
            for i in 0..num_threads {
                let handle = thread::Builder::new()
                    .name(format!("iomgr-{}", i))
                    .spawn(move || iomanager().run_io_loop(Some(i), is_polled, None))?;
                slots.push(ReactorSlot {
                    handle: Some(handle),
                    reactor: None,
                });
                debug!(slot = i, "spawned worker reactor thread");
            }
        }
        if num_threads == 0 {
            // Nothing will decrement the start counter.
            self.set_state(IomgrState::SysInit);
        }
        self.wait_for_state(IomgrState::SysInit);

        let user_timer: Arc<dyn Timer> = GlobalEventTimer::new(ThreadRegex::AllUser)?;
        let worker_timer: Arc<dyn Timer> = if is_polled {
            match self.first_worker_polled_thread() {
                Some(host) => GlobalPolledTimer::new(ThreadRegex::AllWorker, host),
                None => {
                    warn!("polled backend with no polled worker thread, worker timer is event-driven");
                    GlobalEventTimer::new(ThreadRegex::AllWorker)?
                }
            }
        } else {
            GlobalEventTimer::new(ThreadRegex::AllWorker)?
        };
        *self.global_user_timer.write().unwrap() = Some(user_timer);
        *self.global_worker_timer.write().unwrap() = Some(worker_timer);

        if is_polled && !self.polled_env_external.load(Ordering::Acquire) {
            info!("initializing drive subsystem");
            let env = self.polled_env().expect("polled env vanished during start");
            self.run_on(
                ThreadRegex::LeastBusyWorker,
                move |_addr| {
                    env.init_drive_subsystem(Box::new(|rc| {
                        if rc != 0 {
                            error!(rc, "drive subsystem init failed");
                        }
                        iomanager().set_state(IomgrState::Running);
                    }));
                },
                false,
            );
            self.wait_for_state(IomgrState::Running);
        } else {
            self.set_state(IomgrState::Running);
        }

        // Every io_thread reports itself started.
        self.run_on(
            ThreadRegex::AllIo,
            |_addr| {
                if let Some(r) = reactors::this_reactor() {
                    r.notify_thread_state(true);
                }
            },
            false,
        );

        info!(num_threads, "IOManager running");
        Ok(())
    }

    /// Tear everything down: global timers, reactors, worker threads,
    /// interface lists. A no-op warning unless running.
    pub fn stop(&self) {
        if self.get_state() != IomgrState::Running {
            warn!("stop requested but IOManager is not running, ignoring");
            return;
        }

        info!("stopping IOManager");
        self.set_state(IomgrState::Stopping);

        // The pre-increment keeps a zero-reactor stop from hanging on a
        // counter that never moves.
        self.yet_to_stop_nreactors.fetch_add(1, Ordering::AcqRel);

        if let Some(t) = self.global_user_timer.write().unwrap().take() {
            t.stop();
        }
        if let Some(t) = self.global_worker_timer.write().unwrap().take() {
            t.stop();
        }

        let relinquish =
            IomgrMsg::new(MsgKind::RelinquishIoThread, self.internal_module_id());
        self.multicast_msg(ThreadRegex::AllIo, relinquish);

        if self.yet_to_stop_nreactors.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(IomgrState::Stopped);
        } else {
            self.wait_for_state(IomgrState::Stopped);
        }

        info!("all io threads relinquished, joining reactor threads");
        {
            let mut slots = self.worker_reactors.lock().unwrap();
            for slot in slots.iter_mut() {
                if let Some(handle) = slot.handle.take() {
                    if handle.join().is_err() {
                        error!("reactor thread panicked before join");
                    }
                }
            }
            slots.clear();
        }

        self.yet_to_start_nreactors.store(0, Ordering::Release);
        self.drive_ifaces.write().unwrap().clear();
        *self.default_drive_iface.write().unwrap() = None;
        self.iface_list.write().unwrap().clear();
        *self.default_general_iface.write().unwrap() = None;
        *self.common_notifier.write().unwrap() = None;
        bufalloc::reset_allocator();

        debug_assert_eq!(self.get_state(), IomgrState::Stopped);
        info!("IOManager stopped");
    }

    /// Turn the calling OS thread into a user-scope event-driven reactor
    /// until it is told to relinquish (typically by `stop`). Blocks for
    /// the lifetime of the loop.
    pub fn run_user_io_loop(&self, notifier: Option<ThreadStateNotifier>) -> Result<()> {
        if self.get_state() != IomgrState::Running {
            return Err(IomgrError::Configuration(
                "user io loop needs a running IOManager",
            ));
        }
        let idx = reactors::reserve_idx();
        match IOReactorEPoll::new(idx, None, notifier) {
            Ok(reactor) => {
                reactor.run();
                Ok(())
            }
            Err(e) => {
                reactors::abort_reserved(idx);
                Err(e)
            }
        }
    }

    fn run_io_loop(
        &self,
        worker_slot: Option<usize>,
        is_polled: bool,
        addl_notifier: Option<ThreadStateNotifier>,
    ) {
        let idx = reactors::reserve_idx();
        if is_polled {
            IOReactorPolled::new(idx, worker_slot, addl_notifier).run();
        } else {
            match IOReactorEPoll::new(idx, worker_slot, addl_notifier) {
                Ok(reactor) => reactor.run(),
                Err(e) => {
                    error!(error = %e, "event reactor construction failed");
                    reactors::abort_reserved(idx);
                    self.reactor_start_aborted(worker_slot.is_some());
                }
            }
        }
    }

    fn start_polled_env(&self) -> Result<()> {
        let env = self.polled_env().ok_or_else(|| {
            IomgrError::InitFailure("no polled env installed, call set_polled_env first".into())
        })?;
        let external = env.is_initialized();
        self.polled_env_external.store(external, Ordering::Release);
        if external {
            info!("polled environment initialized externally, not re-initializing");
        } else {
            env.init()?;
        }
        // All aligned allocation routes through the DMA path from here.
        bufalloc::set_allocator(Arc::new(DmaAlignedAllocator::new(env)));
        Ok(())
    }

    // ── Reactor lifecycle callbacks ──────────────────────────────────

    /// Called by a reactor from its own thread once ready to accept
    /// messages.
    pub fn reactor_started(&self, reactor: &Arc<dyn IOReactor>) {
        self.yet_to_stop_nreactors.fetch_add(1, Ordering::AcqRel);
        if let Some(slot) = reactor.worker_slot() {
            {
                let mut slots = self.worker_reactors.lock().unwrap();
                if let Some(s) = slots.get_mut(slot) {
                    s.reactor = Some(reactor.clone());
                }
            }
            if self.yet_to_start_nreactors.fetch_sub(1, Ordering::AcqRel) == 1 {
                info!("all worker reactors started, moving to sys_init");
                self.set_state(IomgrState::SysInit);
            }
        }
    }

    /// Called by a reactor after its loop exited and its io_threads were
    /// released.
    pub fn reactor_stopped(&self) {
        if self.yet_to_stop_nreactors.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(IomgrState::Stopped);
        }
    }

    /// A reactor thread gave up before `reactor_started`. Keeps the
    /// start-phase counter moving so `start` does not hang; the slot
    /// simply stays empty.
    pub fn reactor_start_aborted(&self, was_worker: bool) {
        if was_worker && self.yet_to_start_nreactors.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.set_state(IomgrState::SysInit);
        }
    }

    // ── io_thread management ─────────────────────────────────────────

    /// Mint an endpoint for `reactor`, reserving its dense global index.
    pub fn make_io_thread(
        &self,
        reactor: &Arc<dyn IOReactor>,
        thread_addr: IoThreadAddr,
        backend: ThreadBackend,
    ) -> Result<IoThreadPtr> {
        let thread_idx = self.thread_idx_reserver.reserve()?;
        Ok(IoThread::new(reactor, thread_addr, thread_idx, backend))
    }

    /// Return the endpoint's index; its slot may be reused afterwards.
    pub fn release_io_thread(&self, thr: &IoThreadPtr) {
        self.thread_idx_reserver.release(thr.thread_idx);
    }

    // ── Interfaces ───────────────────────────────────────────────────

    /// Register an interface and run its thread-start callback on every
    /// live io_thread.
    pub fn add_interface(&self, iface: Arc<dyn IOInterface>) {
        let mut list = self.iface_list.write().unwrap();
        let for_threads = iface.clone();
        self.run_on(
            ThreadRegex::AllIo,
            move |addr| {
                if let Some(r) = reactors::this_reactor() {
                    if let Some(thr) = r.addr_to_thread(addr) {
                        for_threads.on_io_thread_start(&thr);
                    }
                }
            },
            true,
        );
        debug!(iface = iface.name(), "interface added");
        list.push(iface);
    }

    pub fn add_drive_interface(&self, iface: Arc<dyn DriveInterface>, is_default: bool) {
        self.add_interface(iface.clone());
        self.drive_ifaces.write().unwrap().push(iface.clone());
        if is_default {
            *self.default_drive_iface.write().unwrap() = Some(iface);
        }
    }

    pub fn foreach_interface(&self, mut cb: impl FnMut(&Arc<dyn IOInterface>)) {
        let list = self.iface_list.read().unwrap();
        for iface in list.iter() {
            cb(iface);
        }
    }

    pub fn num_interfaces(&self) -> usize {
        self.iface_list.read().unwrap().len()
    }

    pub fn default_drive_interface(&self) -> Option<Arc<dyn DriveInterface>> {
        self.default_drive_iface.read().unwrap().clone()
    }

    /// The built-in generic interface; present from `interface_init`
    /// until `stop`.
    pub fn generic_interface(&self) -> Result<Arc<GenericIOInterface>> {
        self.default_general_iface
            .read()
            .unwrap()
            .clone()
            .ok_or(IomgrError::Configuration("generic interface not installed"))
    }

    // ── Message modules ──────────────────────────────────────────────

    /// Register a handler; the returned dense id is never reissued.
    pub fn register_msg_module(&self, handler: MsgHandler) -> Result<MsgModuleId> {
        self.msg_modules.register(handler)
    }

    /// Lock-free handler lookup (modules are never unregistered).
    pub fn msg_module(&self, id: MsgModuleId) -> Option<MsgHandler> {
        self.msg_modules.get(id).cloned()
    }

    pub fn internal_module_id(&self) -> MsgModuleId {
        self.internal_module_id.load(Ordering::Acquire)
    }

    // ── Message delivery ─────────────────────────────────────────────

    /// Deliver to one endpoint. Polled endpoints are reached through
    /// their polled-thread handle directly, without touching the reactor
    /// registry. Takes ownership of `msg`; false means it was dropped.
    pub fn send_msg(&self, thr: &IoThreadPtr, mut msg: IomgrMsg) -> bool {
        msg.dest_addr = thr.thread_addr;
        match &thr.backend {
            ThreadBackend::Polled(_) => deliver_to_polled(thr, msg),
            ThreadBackend::Reactor(ridx) => match reactors::specific_reactor(*ridx) {
                Some(reactor) if reactor.is_io_reactor() => {
                    reactor.deliver_msg(thr.thread_addr, msg)
                }
                _ => false,
            },
        }
    }

    /// Send and wait for the recipient's acknowledgement. Waits only if
    /// the send succeeded.
    pub fn send_msg_and_wait(&self, thr: &IoThreadPtr, smsg: &SyncMsg) -> bool {
        let sent = self.send_msg(thr, smsg.msg());
        if sent {
            smsg.wait_for(1);
        }
        sent
    }

    /// Route a message to every endpoint the selector matches; returns
    /// the number of successful deliveries.
    ///
    /// `all_*` selectors deliver an independent clone per endpoint.
    /// `least_busy_*` deliver the original to the matching endpoint with
    /// the fewest outstanding ops (first seen wins ties). `random_worker`
    /// delivers the original to one worker reactor's pick. Whatever was
    /// not handed off is dropped here, exactly once.
    pub fn multicast_msg(&self, regex: ThreadRegex, msg: IomgrMsg) -> usize {
        let mut sent_to = 0usize;

        if regex == ThreadRegex::RandomWorker {
            let pick = {
                let slots = self.worker_reactors.lock().unwrap();
                let live: Vec<Arc<dyn IOReactor>> =
                    slots.iter().filter_map(|s| s.reactor.clone()).collect();
                if live.is_empty() {
                    None
                } else {
                    Some(live[(next_rand() as usize) % live.len()].clone())
                }
            };
            match pick.and_then(|r| r.select_thread()) {
                Some(thr) => {
                    if self.send_msg(&thr, msg) {
                        sent_to = 1;
                    }
                }
                None => drop(msg),
            }
            return sent_to;
        }

        let mut min: Option<(i64, IoThreadPtr)> = None;
        let mut deliver_min: Option<IoThreadPtr> = None;
        self.pick_reactors(regex, |reactor, is_last| {
            if reactor.is_io_reactor() {
                for thr in reactor.io_threads() {
                    if !regex.matches(&thr) {
                        continue;
                    }
                    if regex.is_least_busy() {
                        let cnt = thr.outstanding_ops();
                        let better = match &min {
                            Some((best, _)) => cnt < *best,
                            None => true,
                        };
                        if better {
                            min = Some((cnt, thr.clone()));
                        }
                    } else {
                        let mut clone = msg.clone();
                        clone.dest_addr = thr.thread_addr;
                        if reactor.deliver_msg(thr.thread_addr, clone) {
                            sent_to += 1;
                        }
                    }
                }
            }
            if is_last {
                deliver_min = min.take().map(|(_, thr)| thr);
            }
        });

        match deliver_min {
            Some(thr) => {
                if self.send_msg(&thr, msg) {
                    sent_to += 1;
                }
            }
            // Clones went out (or nothing matched); the original ends here.
            None => drop(msg),
        }
        sent_to
    }

    /// Multicast and wait for one acknowledgement per delivery.
    pub fn multicast_msg_and_wait(&self, regex: ThreadRegex, smsg: &SyncMsg) -> usize {
        let sent_to = self.multicast_msg(regex, smsg.msg());
        if sent_to > 0 {
            smsg.wait_for(sent_to);
        }
        sent_to
    }

    fn pick_reactors(
        &self,
        regex: ThreadRegex,
        mut cb: impl FnMut(&Arc<dyn IOReactor>, bool),
    ) {
        if matches!(
            regex,
            ThreadRegex::AllWorker | ThreadRegex::LeastBusyWorker
        ) {
            // Worker fast path: iterate the pool slots in order.
            let snapshot: Vec<Arc<dyn IOReactor>> = {
                let slots = self.worker_reactors.lock().unwrap();
                slots.iter().filter_map(|s| s.reactor.clone()).collect()
            };
            let n = snapshot.len();
            for (i, reactor) in snapshot.iter().enumerate() {
                cb(reactor, i + 1 == n);
            }
        } else {
            reactors::all_reactors(cb);
        }
    }

    // ── run_on ───────────────────────────────────────────────────────

    /// Run `f` on every endpoint the selector matches. With `wait`, block
    /// until every recipient ran it. Returns the number of endpoints
    /// reached.
    pub fn run_on<F>(&self, regex: ThreadRegex, f: F, wait: bool) -> usize
    where
        F: Fn(IoThreadAddr) + Send + Sync + 'static,
    {
        let id = self.internal_module_id();
        if wait {
            let smsg = SyncMsg::generic(id, f);
            self.multicast_msg_and_wait(regex, &smsg)
        } else {
            self.multicast_msg(regex, IomgrMsg::generic(id, f))
        }
    }

    /// Run `f` on one endpoint.
    pub fn run_on_thread<F>(&self, thr: &IoThreadPtr, f: F, wait: bool) -> bool
    where
        F: Fn(IoThreadAddr) + Send + Sync + 'static,
    {
        let id = self.internal_module_id();
        if wait {
            let smsg = SyncMsg::generic(id, f);
            self.send_msg_and_wait(thr, &smsg)
        } else {
            self.send_msg(thr, IomgrMsg::generic(id, f))
        }
    }

    /// Shortcut onto a polled endpoint's own queue, bypassing the message
    /// path entirely. The target must be polled.
    pub fn run_on_polled(&self, thr: &IoThreadPtr, f: Box<dyn FnOnce() + Send>) -> bool {
        debug_assert!(
            thr.backend.is_polled(),
            "run_on_polled targets a polled io thread"
        );
        match &thr.backend {
            ThreadBackend::Polled(pt) => pt.send(f),
            ThreadBackend::Reactor(_) => false,
        }
    }

    /// Re-fire a device event on the least busy worker.
    pub fn device_reschedule(&self, iodev: IoDevicePtr, event: u32) {
        let msg = IomgrMsg::with_device(
            MsgKind::Reschedule,
            self.internal_module_id(),
            iodev,
            event,
        );
        self.multicast_msg(ThreadRegex::LeastBusyWorker, msg);
    }

    // ── Timers ───────────────────────────────────────────────────────

    /// Arm a timer on the calling reactor's thread timer. Must run on a
    /// reactor thread.
    pub fn schedule_thread_timer(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        cb: TimerCallback,
    ) -> Result<TimerHandle> {
        let reactor = reactors::this_reactor().ok_or(IomgrError::Configuration(
            "thread timers need a reactor thread",
        ))?;
        reactor.schedule_thread_timer(after, recurring, cookie, cb)
    }

    pub fn cancel_thread_timer(&self, handle: TimerHandle) -> bool {
        match reactors::this_reactor() {
            Some(reactor) => reactor.cancel_thread_timer(handle),
            None => false,
        }
    }

    /// Arm a global timer whose every fire multicasts the callback to
    /// the selected group. Only `all_worker` and `all_user` are valid
    /// groups.
    pub fn schedule_global_timer(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        regex: ThreadRegex,
        cb: TimerCallback,
    ) -> Result<TimerHandle> {
        let timer = match regex {
            ThreadRegex::AllWorker => self.global_worker_timer.read().unwrap().clone(),
            ThreadRegex::AllUser => self.global_user_timer.read().unwrap().clone(),
            _ => {
                warn!(?regex, "global timer scheduled with an invalid selector");
                return Err(IomgrError::Configuration(
                    "global timers take all_worker or all_user",
                ));
            }
        };
        timer
            .ok_or(IomgrError::Configuration("global timers not created"))?
            .schedule(after, recurring, cookie, cb)
    }

    pub fn cancel_global_timer(&self, regex: ThreadRegex, handle: TimerHandle) -> bool {
        let timer = match regex {
            ThreadRegex::AllWorker => self.global_worker_timer.read().unwrap().clone(),
            ThreadRegex::AllUser => self.global_user_timer.read().unwrap().clone(),
            _ => None,
        };
        timer.map(|t| t.cancel(handle)).unwrap_or(false)
    }

    // ── Buffers ──────────────────────────────────────────────────────

    pub fn iobuf_alloc(&self, align: usize, size: usize) -> *mut u8 {
        bufalloc::iobuf_alloc(align, size)
    }

    pub fn iobuf_free(&self, buf: *mut u8) {
        bufalloc::iobuf_free(buf)
    }

    pub fn iobuf_realloc(
        &self,
        buf: *mut u8,
        align: usize,
        new_size: usize,
        old_size: usize,
    ) -> *mut u8 {
        bufalloc::iobuf_realloc(buf, align, new_size, old_size)
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub fn get_state(&self) -> IomgrState {
        IomgrState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.get_state() == IomgrState::Running
    }

    pub fn is_polled_backend(&self) -> bool {
        self.is_polled_backend.load(Ordering::Acquire)
    }

    /// Install the polled environment the polled backend will drive.
    /// Must happen before a polled-backend `start`.
    pub fn set_polled_env(&self, env: Arc<dyn PolledEnv>) {
        *self.polled_env.write().unwrap() = Some(env);
    }

    pub fn polled_env(&self) -> Option<Arc<dyn PolledEnv>> {
        self.polled_env.read().unwrap().clone()
    }

    /// The reactor running on the calling thread, if any.
    pub fn this_reactor(&self) -> Option<Arc<dyn IOReactor>> {
        reactors::this_reactor()
    }

    /// The calling thread's endpoint, if the caller is a reactor thread.
    pub fn iothread_self(&self) -> Option<IoThreadPtr> {
        reactors::this_reactor().and_then(|r| r.iothread_self())
    }

    /// Send to the calling thread's own endpoint. Returns false (and the
    /// message is dropped) off reactor threads.
    pub fn send_to_self(&self, msg: IomgrMsg) -> bool {
        match self.iothread_self() {
            Some(thr) => self.send_msg(&thr, msg),
            None => false,
        }
    }

    pub fn thread_state_notifier(&self) -> Option<ThreadStateNotifier> {
        self.common_notifier.read().unwrap().clone()
    }

    /// Live worker reactors (slots whose reactor attached and has not
    /// stopped).
    pub fn worker_reactor_count(&self) -> usize {
        let slots = self.worker_reactors.lock().unwrap();
        slots.iter().filter(|s| s.reactor.is_some()).count()
    }

    fn first_worker_polled_thread(&self) -> Option<Arc<dyn PolledThread>> {
        let slots = self.worker_reactors.lock().unwrap();
        for slot in slots.iter() {
            if let Some(reactor) = &slot.reactor {
                if let Some(thr) = reactor.select_thread() {
                    if let ThreadBackend::Polled(pt) = &thr.backend {
                        return Some(pt.clone());
                    }
                }
            }
        }
        None
    }

    // ── State machine internals ──────────────────────────────────────

    fn set_state(&self, state: IomgrState) {
        let _guard = self.state_lock.lock().unwrap();
        self.state.store(state as u8, Ordering::Release);
        self.state_cv.notify_all();
        debug!(?state, "state transition");
    }

    /// Block until the state machine reaches (or has passed) `target`.
    fn wait_for_state(&self, target: IomgrState) {
        let mut guard = self.state_lock.lock().unwrap();
        while IomgrState::from_u8(self.state.load(Ordering::Acquire)) < target {
            guard = self.state_cv.wait(guard).unwrap();
        }
    }
}

/// xorshift64 step over a process-wide state word; good enough for the
/// random-worker pick.
fn next_rand() -> u64 {
    static STATE: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);
    let mut x = STATE.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    x
}
