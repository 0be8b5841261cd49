//! # iomgr-core
//!
//! Core types and traits for the iomgr I/O manager runtime.
//!
//! This crate carries no event-loop machinery of its own; it defines the
//! vocabulary the runtime crates speak:
//!
//! - `thread` - io_thread endpoints, reactor indexes, the thread-regex selector
//! - `msg` - work-item messages, clone semantics, the sync-message latch
//! - `modules` - the dense-id message-module handler table
//! - `reactor` - the `IOReactor` capability trait
//! - `device` - tagged I/O device handles with per-thread context slots
//! - `interface` - the `IOInterface` / `DriveInterface` device-family traits
//! - `poll_env` - the contract an external polled runtime must satisfy
//! - `reserver` - dense thread-index reservation
//! - `error` - error types
//! - `env` - environment variable utilities

#![allow(dead_code)]

pub mod device;
pub mod env;
pub mod error;
pub mod interface;
pub mod modules;
pub mod msg;
pub mod poll_env;
pub mod reactor;
pub mod reserver;
pub mod thread;
pub mod timer;

// Re-exports for convenience
pub use device::{DeviceCallback, IoDev, IoDevicePtr, IoDeviceScope, IODevice};
pub use error::{IomgrError, Result};
pub use interface::{DriveBackend, DriveInterface, IOInterface};
pub use modules::{MsgHandler, MsgModuleId, MsgModuleTable, MAX_MSG_MODULES};
pub use msg::{IomgrMsg, MsgKind, MsgLatch, RunMethod, SyncMsg};
pub use poll_env::{PollTimerId, PolledBlockDesc, PolledEnv, PolledQueuePair, PolledThread};
pub use reactor::{IOReactor, ThreadStateNotifier};
pub use reserver::ThreadIdxReserver;
pub use thread::{IoThread, IoThreadAddr, IoThreadPtr, ReactorIdx, ThreadBackend, ThreadRegex};
pub use timer::{Timer, TimerCallback, TimerCookie, TimerHandle};

/// Compile-time limits shared by the reserver, the module table and the
/// per-device context slots.
pub mod constants {
    /// Ceiling for concurrently live io_threads across all reactors.
    pub const MAX_IO_THREADS: usize = 1024;

    /// Message-module table capacity. Modules are never unregistered, so
    /// this bounds registrations over the process lifetime.
    pub const MAX_MSG_MODULES: usize = 64;

    /// Interfaces the manager installs by itself: generic + default drive.
    pub const INBUILT_IFACE_COUNT: usize = 2;

    /// Default depth of a reactor's inbound message queue.
    pub const DEFAULT_MSGQ_CAPACITY: usize = 1024;
}
