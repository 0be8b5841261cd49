//! Work-item messages.
//!
//! An `IomgrMsg` is the unit the message bus routes: a kind, the id of the
//! module whose handler consumes it, the destination thread address, and
//! optionally a device + event pair or a run-method closure. Clones are
//! independent allocations sharing the payload closure and, for sync
//! messages, the latch.
//!
//! Ownership rule: whoever holds the message last frees it, and Rust's
//! drop gives the exactly-once guarantee. `deliver_msg` takes the message
//! by value; a false return means it was already dropped.

use std::sync::{Arc, Condvar, Mutex};

use crate::device::IoDevicePtr;
use crate::modules::MsgModuleId;
use crate::thread::IoThreadAddr;

/// Payload closure of a generic message, executed on the receiving
/// reactor thread with the destination thread address.
pub type RunMethod = Arc<dyn Fn(IoThreadAddr) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    /// Run the attached closure on the receiving thread.
    Generic,

    /// Re-fire a device event on the receiving thread.
    Reschedule,

    /// Receiving reactor gives up io_thread status and exits its loop.
    RelinquishIoThread,

    /// Module-defined; the payload meaning is private to the module.
    Custom(u32),
}

/// The routable work item.
#[derive(Clone)]
pub struct IomgrMsg {
    pub kind: MsgKind,
    pub module_id: MsgModuleId,
    pub dest_addr: IoThreadAddr,
    pub iodev: Option<IoDevicePtr>,
    pub event: u32,
    run_method: Option<RunMethod>,
    latch: Option<Arc<MsgLatch>>,
}

impl IomgrMsg {
    pub fn new(kind: MsgKind, module_id: MsgModuleId) -> Self {
        Self {
            kind,
            module_id,
            dest_addr: 0,
            iodev: None,
            event: 0,
            run_method: None,
            latch: None,
        }
    }

    pub fn with_device(
        kind: MsgKind,
        module_id: MsgModuleId,
        iodev: IoDevicePtr,
        event: u32,
    ) -> Self {
        let mut msg = Self::new(kind, module_id);
        msg.iodev = Some(iodev);
        msg.event = event;
        msg
    }

    /// A generic message carrying a run-method closure.
    pub fn generic<F>(module_id: MsgModuleId, f: F) -> Self
    where
        F: Fn(IoThreadAddr) + Send + Sync + 'static,
    {
        let mut msg = Self::new(MsgKind::Generic, module_id);
        msg.run_method = Some(Arc::new(f));
        msg
    }

    #[inline]
    pub fn method(&self) -> Option<&RunMethod> {
        self.run_method.as_ref()
    }

    pub(crate) fn attach_latch(&mut self, latch: Arc<MsgLatch>) {
        self.latch = Some(latch);
    }

    /// Acknowledge handling. Called by the receiving reactor exactly once
    /// per delivered message, after the module handler returns, whatever
    /// the handler did. A no-op for plain (non-sync) messages.
    pub fn ack(&self) {
        if let Some(latch) = &self.latch {
            latch.count_down();
        }
    }

    /// Consume the message: free it, then acknowledge. The free happens
    /// before the ack, so a sync-message waiter observes every delivered
    /// copy gone by the time its wait returns.
    pub fn finish(mut self) {
        let latch = self.latch.take();
        drop(self);
        if let Some(latch) = latch {
            latch.count_down();
        }
    }
}

impl std::fmt::Debug for IomgrMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IomgrMsg")
            .field("kind", &self.kind)
            .field("module_id", &self.module_id)
            .field("dest_addr", &self.dest_addr)
            .field("event", &self.event)
            .field("has_method", &self.run_method.is_some())
            .field("is_sync", &self.latch.is_some())
            .finish()
    }
}

/// Counting latch for sync messages. Recipients count down, the sender
/// waits for however many deliveries actually happened.
pub struct MsgLatch {
    acked: Mutex<usize>,
    cv: Condvar,
}

impl MsgLatch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            acked: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    pub fn count_down(&self) {
        let mut acked = self.acked.lock().unwrap();
        *acked += 1;
        self.cv.notify_all();
    }

    /// Block until at least `expected` acknowledgements arrived. Safe to
    /// call after acks already happened; the count is absolute.
    pub fn wait_for(&self, expected: usize) {
        let mut acked = self.acked.lock().unwrap();
        while *acked < expected {
            acked = self.cv.wait(acked).unwrap();
        }
    }

    pub fn count(&self) -> usize {
        *self.acked.lock().unwrap()
    }
}

/// A message plus its completion latch.
///
/// `msg()` clones the base message for sending (clones share the latch);
/// the caller then waits for as many acks as deliveries succeeded.
pub struct SyncMsg {
    base: IomgrMsg,
    latch: Arc<MsgLatch>,
}

impl SyncMsg {
    pub fn new(kind: MsgKind, module_id: MsgModuleId) -> Self {
        Self::from_msg(IomgrMsg::new(kind, module_id))
    }

    /// A sync generic message carrying a run-method closure.
    pub fn generic<F>(module_id: MsgModuleId, f: F) -> Self
    where
        F: Fn(IoThreadAddr) + Send + Sync + 'static,
    {
        Self::from_msg(IomgrMsg::generic(module_id, f))
    }

    pub fn from_msg(mut base: IomgrMsg) -> Self {
        let latch = MsgLatch::new();
        base.attach_latch(latch.clone());
        Self { base, latch }
    }

    /// A sendable copy of the base message, sharing this latch.
    pub fn msg(&self) -> IomgrMsg {
        self.base.clone()
    }

    pub fn wait_for(&self, expected: usize) {
        self.latch.wait_for(expected);
    }

    pub fn latch(&self) -> &Arc<MsgLatch> {
        &self.latch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_clone_shares_method() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let msg = IomgrMsg::generic(0, move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        let clone = msg.clone();
        (msg.method().unwrap())(0);
        (clone.method().unwrap())(0);
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_sync_msg_acks_through_clones() {
        let smsg = SyncMsg::new(MsgKind::Generic, 0);
        let a = smsg.msg();
        let b = smsg.msg();

        a.ack();
        b.ack();
        smsg.wait_for(2);
        assert_eq!(smsg.latch().count(), 2);
    }

    #[test]
    fn test_plain_msg_ack_is_noop() {
        let msg = IomgrMsg::new(MsgKind::RelinquishIoThread, 0);
        msg.ack();
    }

    #[test]
    fn test_latch_wait_cross_thread() {
        let latch = MsgLatch::new();
        let l = latch.clone();
        let t = std::thread::spawn(move || {
            for _ in 0..3 {
                l.count_down();
            }
        });
        latch.wait_for(3);
        t.join().unwrap();
    }
}
