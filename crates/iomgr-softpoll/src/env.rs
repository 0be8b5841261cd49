//! The software polled environment.
//!
//! Tracks initialization state (so the manager's external-init detection
//! can be exercised), vends `SoftPollThread`s, and fronts libc
//! `aligned_alloc` as the DMA allocator.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use iomgr_core::error::{IomgrError, Result};
use iomgr_core::poll_env::{PolledBlockDesc, PolledEnv, PolledThread};

use crate::thread::SoftPollThread;

pub struct SoftPollEnv {
    inited: AtomicBool,
    /// Makes `init()` fail, for exercising the fatal-start path.
    fail_init: bool,
    init_calls: AtomicU32,
    drive_subsystem_up: AtomicBool,
    threads: Mutex<Vec<Arc<SoftPollThread>>>,
}

impl SoftPollEnv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inited: AtomicBool::new(false),
            fail_init: false,
            init_calls: AtomicU32::new(0),
            drive_subsystem_up: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// An environment brought up before the manager saw it, as an external
    /// integration would have done.
    pub fn preinitialized() -> Arc<Self> {
        let env = Self::new();
        env.inited.store(true, Ordering::Release);
        env
    }

    /// An environment whose `init()` always fails.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            inited: AtomicBool::new(false),
            fail_init: true,
            init_calls: AtomicU32::new(0),
            drive_subsystem_up: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// How many times `init()` ran. Zero for a preinitialized env.
    pub fn init_calls(&self) -> u32 {
        self.init_calls.load(Ordering::Relaxed)
    }

    pub fn drive_subsystem_up(&self) -> bool {
        self.drive_subsystem_up.load(Ordering::Acquire)
    }

    /// Tear down every thread this env created.
    pub fn teardown(&self) {
        let threads = self.threads.lock().unwrap();
        for t in threads.iter() {
            t.teardown();
        }
    }
}

impl PolledEnv for SoftPollEnv {
    fn is_initialized(&self) -> bool {
        self.inited.load(Ordering::Acquire)
    }

    fn init(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail_init {
            return Err(IomgrError::InitFailure(
                "softpoll env configured to fail".into(),
            ));
        }
        self.inited.store(true, Ordering::Release);
        debug!("softpoll env initialized");
        Ok(())
    }

    fn create_thread(&self, name: &str) -> Result<Arc<dyn PolledThread>> {
        if !self.is_initialized() {
            return Err(IomgrError::InitFailure(
                "softpoll env not initialized".into(),
            ));
        }
        let t = SoftPollThread::new(name);
        self.threads.lock().unwrap().push(t.clone());
        Ok(t)
    }

    fn dma_alloc(&self, align: usize, size: usize) -> *mut u8 {
        unsafe { libc::aligned_alloc(align, size) as *mut u8 }
    }

    fn dma_free(&self, buf: *mut u8) {
        unsafe { libc::free(buf as *mut libc::c_void) }
    }

    fn dma_realloc(
        &self,
        buf: *mut u8,
        align: usize,
        new_size: usize,
        old_size: usize,
    ) -> *mut u8 {
        let new_buf = self.dma_alloc(align, new_size);
        if new_buf.is_null() {
            return new_buf;
        }
        if !buf.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(buf, new_buf, old_size.min(new_size));
            }
            self.dma_free(buf);
        }
        new_buf
    }

    fn init_drive_subsystem(&self, on_done: Box<dyn FnOnce(i32) + Send>) {
        let rc = if self.is_initialized() {
            self.drive_subsystem_up.store(true, Ordering::Release);
            0
        } else {
            -(libc::ENODEV)
        };
        on_done(rc);
    }
}

/// A named software block device, enough for registration paths and
/// `dev_id()`.
pub struct SoftBlockDesc {
    name: String,
}

impl SoftBlockDesc {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
        })
    }
}

impl PolledBlockDesc for SoftBlockDesc {
    fn name(&self) -> &str {
        &self.name
    }
}
