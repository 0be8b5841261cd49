//! The generic device family.
//!
//! Devices land here when no specialized interface claims them: timer
//! fds, wake fds, listening sockets under test. Global-scope devices get
//! installed on every io_thread's reactor (current and future); a
//! per-thread device goes to exactly one.

use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use iomgr_core::device::IoDevicePtr;
use iomgr_core::interface::IOInterface;
use iomgr_core::thread::{IoThreadPtr, ThreadRegex};

use crate::manager::iomanager;
use crate::reactors;

pub struct GenericIOInterface {
    devices: RwLock<Vec<IoDevicePtr>>,
}

impl GenericIOInterface {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
        }
    }

    /// Install a device on its scope's io_threads. Returns the number of
    /// reactors that performed the registration.
    ///
    /// Reactors that start later pick global devices up from the
    /// thread-start callback; `add_iodev` tolerates the overlap.
    pub fn add_io_device(&self, dev: IoDevicePtr, wait: bool) -> usize {
        self.devices.write().unwrap().push(dev.clone());

        match &dev.scope {
            iomgr_core::device::IoDeviceScope::Global => {
                let dev = dev.clone();
                iomanager().run_on(
                    ThreadRegex::AllIo,
                    move |_addr| {
                        if let Some(r) = reactors::this_reactor() {
                            if let Err(e) = r.add_iodev(&dev) {
                                warn!(dev = %dev.dev_id(), error = %e, "device registration failed");
                            }
                        }
                    },
                    wait,
                )
            }
            iomgr_core::device::IoDeviceScope::Thread(thr) => {
                let dev = dev.clone();
                let delivered = iomanager().run_on_thread(
                    thr,
                    move |_addr| {
                        if let Some(r) = reactors::this_reactor() {
                            if let Err(e) = r.add_iodev(&dev) {
                                warn!(dev = %dev.dev_id(), error = %e, "device registration failed");
                            }
                        }
                    },
                    wait,
                );
                usize::from(delivered)
            }
        }
    }

    /// Remove a device from every reactor that holds it.
    pub fn remove_io_device(&self, dev: &IoDevicePtr, wait: bool) -> usize {
        {
            let mut devices = self.devices.write().unwrap();
            devices.retain(|d| !Arc::ptr_eq(d, dev));
        }

        match &dev.scope {
            iomgr_core::device::IoDeviceScope::Global => {
                let dev = dev.clone();
                iomanager().run_on(
                    ThreadRegex::AllIo,
                    move |_addr| {
                        if let Some(r) = reactors::this_reactor() {
                            let _ = r.remove_iodev(&dev);
                        }
                    },
                    wait,
                )
            }
            iomgr_core::device::IoDeviceScope::Thread(thr) => {
                let dev = dev.clone();
                let delivered = iomanager().run_on_thread(
                    thr,
                    move |_addr| {
                        if let Some(r) = reactors::this_reactor() {
                            let _ = r.remove_iodev(&dev);
                        }
                    },
                    wait,
                );
                usize::from(delivered)
            }
        }
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().unwrap().len()
    }
}

impl Default for GenericIOInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl IOInterface for GenericIOInterface {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn on_io_thread_start(&self, thr: &IoThreadPtr) {
        let devices = self.devices.read().unwrap();
        for dev in devices.iter().filter(|d| d.is_global()) {
            if let Some(r) = thr.reactor() {
                if let Err(e) = r.add_iodev(dev) {
                    warn!(dev = %dev.dev_id(), error = %e, "device registration failed");
                }
            }
        }
        debug!(thread_idx = thr.thread_idx, "generic interface attached");
    }

    fn on_io_thread_stop(&self, thr: &IoThreadPtr) {
        let devices = self.devices.read().unwrap();
        for dev in devices.iter() {
            let mine = dev.is_global() || dev.is_thread_scope_of(thr);
            if mine {
                if let Some(r) = thr.reactor() {
                    let _ = r.remove_iodev(dev);
                }
            }
        }
    }
}
