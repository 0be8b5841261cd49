//! Polled-runtime contract.
//!
//! The busy-poll backend is driven through these traits; the runtime never
//! links a concrete polled stack. An implementation supplies:
//!
//! - per-core cooperative threads with a closure-send primitive
//!   (`PolledThread`),
//! - DMA-capable aligned allocation,
//! - block-device subsystem init with a completion callback,
//! - a poller-driven timer primitive.
//!
//! The environment may have been initialized outside the manager; the
//! manager probes `is_initialized()` and never initializes twice.
//!
//! # Implementors
//!
//! - `iomgr-softpoll` (default for in-process use): software threads with
//!   bounded closure inboxes, advanced only when their owning reactor
//!   calls `poll()`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Identifier for a timer registered on a polled thread.
pub type PollTimerId = u64;

/// A cooperative thread owned by the polled runtime.
///
/// **Contract:** `send()` must never block and may be called from any OS
/// thread. `poll()` is only ever called by the reactor that owns the
/// thread; queued closures and timer callbacks run inside it.
pub trait PolledThread: Send + Sync {
    fn name(&self) -> &str;

    /// Enqueue a closure to run at the thread's next `poll()`.
    ///
    /// Returns false if the thread is not accepting work (queue full or
    /// torn down); the closure is dropped in that case.
    fn send(&self, f: Box<dyn FnOnce() + Send>) -> bool;

    /// Advance the thread: run queued closures and fire expired timers.
    /// Returns the number of work items executed.
    fn poll(&self) -> usize;

    /// Register a timer fired by `poll()`. Recurring timers re-arm
    /// themselves until cancelled.
    fn schedule_timer(
        &self,
        after: Duration,
        recurring: bool,
        cb: Arc<dyn Fn() + Send + Sync>,
    ) -> PollTimerId;

    /// Best-effort cancel; returns true if the timer had not fired
    /// (one-shot) or will not fire again (recurring).
    fn cancel_timer(&self, id: PollTimerId) -> bool;
}

/// Opaque descriptor for a polled block device.
pub trait PolledBlockDesc: Send + Sync {
    fn name(&self) -> &str;
}

/// Opaque polled queue pair (device submission/completion queue).
pub trait PolledQueuePair: Send + Sync {}

/// The polled environment itself.
pub trait PolledEnv: Send + Sync {
    /// True if the environment is already up (possibly initialized
    /// externally, before the manager started).
    fn is_initialized(&self) -> bool;

    /// Bring the environment up. Called at most once by the manager, and
    /// only when `is_initialized()` returned false.
    fn init(&self) -> Result<()>;

    /// Create a cooperative thread. One reactor drives each thread.
    fn create_thread(&self, name: &str) -> Result<Arc<dyn PolledThread>>;

    /// DMA-capable aligned allocation. `size` is already a multiple of
    /// `align`.
    fn dma_alloc(&self, align: usize, size: usize) -> *mut u8;

    fn dma_free(&self, buf: *mut u8);

    fn dma_realloc(&self, buf: *mut u8, align: usize, new_size: usize, old_size: usize)
        -> *mut u8;

    /// Kick block-device subsystem init. `on_done` receives 0 on success
    /// or a negative errno; it may run on the calling thread or on a
    /// polled thread.
    fn init_drive_subsystem(&self, on_done: Box<dyn FnOnce(i32) + Send>);
}
