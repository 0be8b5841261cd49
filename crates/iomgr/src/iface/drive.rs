//! Default drive interfaces.
//!
//! One per backend. Concrete submission engines (kernel async block I/O,
//! polled storage queues) plug in outside this crate; what lives here is
//! the per-thread lifecycle each engine needs: a context slot brought up
//! when an io_thread starts and torn down when it stops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use tracing::debug;

use iomgr_core::device::IoDevicePtr;
use iomgr_core::interface::{DriveBackend, DriveInterface, IOInterface};
use iomgr_core::thread::IoThreadPtr;

/// Drive family for the event-driven backend.
pub struct EventDriveInterface {
    devices: RwLock<Vec<IoDevicePtr>>,
    active_threads: AtomicUsize,
}

impl EventDriveInterface {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            active_threads: AtomicUsize::new(0),
        }
    }

    /// Track a device opened by a driver; its per-thread contexts get
    /// reclaimed when io_threads stop.
    pub fn register_device(&self, dev: IoDevicePtr) {
        self.devices.write().unwrap().push(dev);
    }

    /// io_threads currently holding a submission context.
    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Relaxed)
    }
}

impl Default for EventDriveInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl IOInterface for EventDriveInterface {
    fn name(&self) -> &'static str {
        "drive_event"
    }

    fn on_io_thread_start(&self, thr: &IoThreadPtr) {
        // Per-thread submission contexts attach onto device ctx slots at
        // open time; here we only account the thread.
        self.active_threads.fetch_add(1, Ordering::Relaxed);
        debug!(thread_idx = thr.thread_idx, "event drive interface attached");
    }

    fn on_io_thread_stop(&self, thr: &IoThreadPtr) {
        let devices = self.devices.read().unwrap();
        for dev in devices.iter() {
            dev.take_thread_ctx(thr.thread_idx);
        }
        self.active_threads.fetch_sub(1, Ordering::Relaxed);
    }
}

impl DriveInterface for EventDriveInterface {
    fn backend(&self) -> DriveBackend {
        DriveBackend::Event
    }
}

/// Drive family for the polled backend.
pub struct PolledDriveInterface {
    devices: RwLock<Vec<IoDevicePtr>>,
    active_threads: AtomicUsize,
}

impl PolledDriveInterface {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            active_threads: AtomicUsize::new(0),
        }
    }

    pub fn register_device(&self, dev: IoDevicePtr) {
        self.devices.write().unwrap().push(dev);
    }

    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Relaxed)
    }
}

impl Default for PolledDriveInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl IOInterface for PolledDriveInterface {
    fn name(&self) -> &'static str {
        "drive_polled"
    }

    fn on_io_thread_start(&self, thr: &IoThreadPtr) {
        self.active_threads.fetch_add(1, Ordering::Relaxed);
        debug!(thread_idx = thr.thread_idx, "polled drive interface attached");
    }

    fn on_io_thread_stop(&self, thr: &IoThreadPtr) {
        let devices = self.devices.read().unwrap();
        for dev in devices.iter() {
            dev.take_thread_ctx(thr.thread_idx);
        }
        self.active_threads.fetch_sub(1, Ordering::Relaxed);
    }
}

impl DriveInterface for PolledDriveInterface {
    fn backend(&self) -> DriveBackend {
        DriveBackend::Polled
    }
}
