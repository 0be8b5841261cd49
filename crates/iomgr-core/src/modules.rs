//! Message-module handler table.
//!
//! Modules register a handler and get back the next dense id; the id is
//! embedded in every message the module sends and is never reissued or
//! revoked. Registration appends under a mutex; lookup is lock-free. The
//! table is append-only, so readers need no synchronization beyond the
//! per-slot `OnceLock`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{IomgrError, Result};
use crate::msg::IomgrMsg;

pub use crate::constants::MAX_MSG_MODULES;

/// Dense module id, index into the table.
pub type MsgModuleId = usize;

/// Handler invoked on the reactor thread that dequeued the message.
pub type MsgHandler = Arc<dyn Fn(&IomgrMsg) + Send + Sync>;

pub struct MsgModuleTable {
    slots: [OnceLock<MsgHandler>; MAX_MSG_MODULES],
    count: AtomicUsize,
    register_lock: Mutex<()>,
}

impl MsgModuleTable {
    pub fn new() -> Self {
        Self {
            slots: [const { OnceLock::new() }; MAX_MSG_MODULES],
            count: AtomicUsize::new(0),
            register_lock: Mutex::new(()),
        }
    }

    /// Append a handler, returning its id.
    pub fn register(&self, handler: MsgHandler) -> Result<MsgModuleId> {
        let _guard = self.register_lock.lock().unwrap();
        let id = self.count.load(Ordering::Relaxed);
        if id >= MAX_MSG_MODULES {
            return Err(IomgrError::Configuration("message module table full"));
        }
        // Cannot collide: ids are handed out under the lock.
        let _ = self.slots[id].set(handler);
        self.count.store(id + 1, Ordering::Release);
        Ok(id)
    }

    /// Lock-free lookup.
    #[inline]
    pub fn get(&self, id: MsgModuleId) -> Option<&MsgHandler> {
        self.slots.get(id)?.get()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MsgModuleTable {
    fn default() -> Self {
        Self::new()
    }
}
