//! I/O interface traits.
//!
//! An `IOInterface` is a family of devices sharing registration behavior.
//! The runtime notifies every interface when an io_thread comes up or goes
//! down so it can install per-thread state (queues, contexts) on the
//! device's context slots. Interfaces are shared between the manager's
//! list and any reactor holding their devices; they live until `stop`.

use crate::thread::IoThreadPtr;

pub trait IOInterface: Send + Sync {
    fn name(&self) -> &'static str;

    /// An io_thread became ready. Called once per interface per io_thread,
    /// on that io_thread's reactor.
    fn on_io_thread_start(&self, thr: &IoThreadPtr);

    /// The io_thread is going away. Called on its reactor, before the
    /// reactor tears down.
    fn on_io_thread_stop(&self, thr: &IoThreadPtr);
}

/// Which execution backend a drive interface drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveBackend {
    Event,
    Polled,
}

/// A drive (storage) interface. Concrete submission paths live outside
/// this crate; the runtime only needs the family identity and the default
/// designation.
pub trait DriveInterface: IOInterface {
    fn backend(&self) -> DriveBackend;
}
