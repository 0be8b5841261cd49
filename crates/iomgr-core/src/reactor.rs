//! The `IOReactor` capability trait.
//!
//! A reactor is a per-thread event loop owning registered devices, a
//! thread timer and a message inbox. Two variants implement this trait in
//! the runtime crate: event-driven (epoll + eventfd wake source) and
//! polled (busy-loops the polled runtime). There is no deeper hierarchy;
//! this is the whole capability set the manager dispatches through.
//!
//! **Threading contract:** `deliver_msg` may be called from any thread and
//! must never block. `handle_msg`, `add_iodev` and `remove_iodev` run only
//! on the reactor's own thread (the manager routes them there as
//! messages).

use std::sync::Arc;
use std::time::Duration;

use crate::device::IoDevicePtr;
use crate::error::Result;
use crate::msg::IomgrMsg;
use crate::thread::{IoThreadAddr, IoThreadPtr, ReactorIdx};
use crate::timer::{TimerCallback, TimerCookie, TimerHandle};

/// Invoked with `true` when an io_thread starts, `false` when it stops.
pub type ThreadStateNotifier = Arc<dyn Fn(bool) + Send + Sync>;

pub trait IOReactor: Send + Sync {
    fn reactor_idx(&self) -> ReactorIdx;

    /// Worker reactors are the manager-spawned pool; everything else is a
    /// user reactor.
    fn is_worker(&self) -> bool;

    /// Slot in the manager's worker vector, if a worker.
    fn worker_slot(&self) -> Option<usize>;

    /// True once the loop is attached, interfaces are initialized and the
    /// inbox accepts messages. False again once stopping.
    fn is_io_reactor(&self) -> bool;

    fn is_polled(&self) -> bool;

    /// Snapshot of the reactor's endpoints.
    fn io_threads(&self) -> Vec<IoThreadPtr>;

    /// Reactor-defined pick for single-delivery multicast (round-robin or
    /// first).
    fn select_thread(&self) -> Option<IoThreadPtr>;

    /// The endpoint messages from this reactor originate from.
    fn iothread_self(&self) -> Option<IoThreadPtr>;

    fn addr_to_thread(&self, addr: IoThreadAddr) -> Option<IoThreadPtr>;

    /// Enqueue a message for `addr`. Takes ownership; returns true iff the
    /// message was accepted (false means it was dropped here).
    fn deliver_msg(&self, addr: IoThreadAddr, msg: IomgrMsg) -> bool;

    /// Internal-module dispatch, on the reactor thread.
    fn handle_msg(&self, msg: &IomgrMsg);

    /// Register / deregister a device. Reactor-thread only.
    fn add_iodev(&self, dev: &IoDevicePtr) -> Result<()>;
    fn remove_iodev(&self, dev: &IoDevicePtr) -> Result<()>;

    /// Per-reactor thread timer.
    fn schedule_thread_timer(
        &self,
        after: Duration,
        recurring: bool,
        cookie: TimerCookie,
        cb: TimerCallback,
    ) -> Result<TimerHandle>;
    fn cancel_thread_timer(&self, handle: TimerHandle) -> bool;

    /// Run the thread-state notifiers for every endpoint.
    fn notify_thread_state(&self, started: bool);
}
