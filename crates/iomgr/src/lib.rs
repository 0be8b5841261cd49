//! # iomgr
//!
//! Process-wide I/O manager: a pool of per-thread reactors behind one of
//! two interchangeable execution backends, event-driven (epoll over
//! descriptors with an eventfd wake source) or polled (busy-looping a
//! cooperative polled runtime), plus a message bus that routes work to a
//! specific io_thread, a thread group, or the least-loaded thread.
//!
//! ```ignore
//! use iomgr::{iomanager, ThreadRegex};
//!
//! iomanager().start(4, false, None, None)?;
//! iomanager().run_on(ThreadRegex::AllWorker, |addr| {
//!     println!("hello from io thread addr {addr}");
//! }, true);
//! iomanager().stop();
//! ```
//!
//! ## Modules
//!
//! - `manager` - the `IOManager` singleton and its state machine
//! - `reactor` - event-driven and polled reactor loops
//! - `reactors` - registry + thread-local current-reactor holder
//! - `iface` - built-in generic and drive interfaces
//! - `timer` - event-driven and polled timer backends
//! - `bufalloc` - aligned buffer allocation (libc / DMA duality)
//! - `fds` - eventfd/timerfd/epoll wrappers

pub mod bufalloc;
pub mod fds;
pub mod iface;
pub mod manager;
pub mod reactor;
pub mod reactors;
pub mod timer;

// Re-exports: the full vocabulary callers need.
pub use manager::{iomanager, IOManager, IomgrState, InterfaceAdder};
pub use reactors::this_reactor;

pub use iomgr_core::constants;
pub use iomgr_core::device::{DeviceCallback, IoDev, IoDevicePtr, IoDeviceScope, IODevice};
pub use iomgr_core::error::{IomgrError, Result};
pub use iomgr_core::interface::{DriveBackend, DriveInterface, IOInterface};
pub use iomgr_core::modules::{MsgHandler, MsgModuleId};
pub use iomgr_core::msg::{IomgrMsg, MsgKind, SyncMsg};
pub use iomgr_core::poll_env::{PolledBlockDesc, PolledEnv, PolledQueuePair, PolledThread};
pub use iomgr_core::reactor::{IOReactor, ThreadStateNotifier};
pub use iomgr_core::thread::{IoThread, IoThreadAddr, IoThreadPtr, ThreadBackend, ThreadRegex};
pub use iomgr_core::timer::{Timer, TimerCallback, TimerCookie, TimerHandle};
