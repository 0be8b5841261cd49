//! Tagged I/O device handles.
//!
//! An `IODevice` wraps one of a raw file descriptor, a polled block-device
//! descriptor or a polled queue pair, together with its owning interface,
//! its thread scope (installed on every io_thread, or pinned to exactly
//! one) and per-`thread_idx` context slots the interface fills in from its
//! thread-start callback.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::{Arc, RwLock, Weak};

use crate::interface::IOInterface;
use crate::poll_env::{PolledBlockDesc, PolledQueuePair};
use crate::thread::IoThreadPtr;

/// The device itself.
#[derive(Clone)]
pub enum IoDev {
    Fd(RawFd),
    BlockDesc(Arc<dyn PolledBlockDesc>),
    QueuePair(Arc<dyn PolledQueuePair>),
}

/// Where the device is installed.
#[derive(Clone)]
pub enum IoDeviceScope {
    /// On every io_thread.
    Global,
    /// Pinned to exactly one io_thread.
    Thread(IoThreadPtr),
}

/// Invoked on the reactor thread that reaped an event for this device,
/// with the ready-event mask.
pub type DeviceCallback = Arc<dyn Fn(&IODevice, u32) + Send + Sync>;

pub struct IODevice {
    pub dev: IoDev,
    pub scope: IoDeviceScope,

    /// Ready-events of interest (epoll mask for fd devices).
    pub events_of_interest: u32,

    pub cookie: Option<Arc<dyn Any + Send + Sync>>,

    ev_callback: Option<DeviceCallback>,

    iface: Weak<dyn IOInterface>,

    /// Per-thread_idx context, owned by the interface.
    thread_ctx: RwLock<Vec<Option<Box<dyn Any + Send + Sync>>>>,
}

pub type IoDevicePtr = Arc<IODevice>;

impl IODevice {
    pub fn fd_device(
        fd: RawFd,
        events_of_interest: u32,
        scope: IoDeviceScope,
        iface: &Arc<dyn IOInterface>,
        ev_callback: Option<DeviceCallback>,
    ) -> IoDevicePtr {
        Arc::new(Self {
            dev: IoDev::Fd(fd),
            scope,
            events_of_interest,
            cookie: None,
            ev_callback,
            iface: Arc::downgrade(iface),
            thread_ctx: RwLock::new(Vec::new()),
        })
    }

    pub fn block_device(
        desc: Arc<dyn PolledBlockDesc>,
        scope: IoDeviceScope,
        iface: &Arc<dyn IOInterface>,
    ) -> IoDevicePtr {
        Arc::new(Self {
            dev: IoDev::BlockDesc(desc),
            scope,
            events_of_interest: 0,
            cookie: None,
            ev_callback: None,
            iface: Arc::downgrade(iface),
            thread_ctx: RwLock::new(Vec::new()),
        })
    }

    pub fn queue_pair(
        qp: Arc<dyn PolledQueuePair>,
        scope: IoDeviceScope,
        iface: &Arc<dyn IOInterface>,
    ) -> IoDevicePtr {
        Arc::new(Self {
            dev: IoDev::QueuePair(qp),
            scope,
            events_of_interest: 0,
            cookie: None,
            ev_callback: None,
            iface: Arc::downgrade(iface),
            thread_ctx: RwLock::new(Vec::new()),
        })
    }

    /// The raw descriptor, if this is an fd device.
    #[inline]
    pub fn fd(&self) -> Option<RawFd> {
        match &self.dev {
            IoDev::Fd(fd) => Some(*fd),
            _ => None,
        }
    }

    /// Identity for logs: the fd as a numeric string, the block device
    /// name, or empty for a queue pair.
    pub fn dev_id(&self) -> String {
        match &self.dev {
            IoDev::Fd(fd) => fd.to_string(),
            IoDev::BlockDesc(desc) => desc.name().to_string(),
            IoDev::QueuePair(_) => String::new(),
        }
    }

    #[inline]
    pub fn is_global(&self) -> bool {
        matches!(self.scope, IoDeviceScope::Global)
    }

    /// True if the device is pinned to `thr`.
    pub fn is_thread_scope_of(&self, thr: &IoThreadPtr) -> bool {
        match &self.scope {
            IoDeviceScope::Thread(owner) => Arc::ptr_eq(owner, thr),
            IoDeviceScope::Global => false,
        }
    }

    pub fn interface(&self) -> Option<Arc<dyn IOInterface>> {
        self.iface.upgrade()
    }

    /// Fire the device's event callback with the ready mask.
    pub fn fire_event(&self, events: u32) {
        if let Some(cb) = &self.ev_callback {
            cb(self, events);
        }
    }

    /// Install context for `thread_idx`, replacing any previous value.
    pub fn set_thread_ctx(&self, thread_idx: u32, ctx: Box<dyn Any + Send + Sync>) {
        let mut slots = self.thread_ctx.write().unwrap();
        let idx = thread_idx as usize;
        if slots.len() <= idx {
            slots.resize_with(idx + 1, || None);
        }
        slots[idx] = Some(ctx);
    }

    /// Remove and return the context for `thread_idx`.
    pub fn take_thread_ctx(&self, thread_idx: u32) -> Option<Box<dyn Any + Send + Sync>> {
        let mut slots = self.thread_ctx.write().unwrap();
        slots.get_mut(thread_idx as usize).and_then(|s| s.take())
    }

    /// Borrow the context for `thread_idx` under the read lock.
    pub fn with_thread_ctx<R>(
        &self,
        thread_idx: u32,
        f: impl FnOnce(Option<&(dyn Any + Send + Sync)>) -> R,
    ) -> R {
        let slots = self.thread_ctx.read().unwrap();
        let ctx = slots
            .get(thread_idx as usize)
            .and_then(|s| s.as_deref())
            .map(|b| b as &(dyn Any + Send + Sync));
        f(ctx)
    }
}

impl std::fmt::Debug for IODevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IODevice")
            .field("dev_id", &self.dev_id())
            .field("global", &self.is_global())
            .field("events_of_interest", &self.events_of_interest)
            .finish()
    }
}
