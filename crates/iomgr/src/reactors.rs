//! Reactor registry and the thread-local "current reactor" holder.
//!
//! Every reactor attaches here from its own OS thread before entering its
//! loop: a slot in the process-wide registry (indexed by `ReactorIdx`, the
//! backend identity of event-driven io_threads) plus the thread-local
//! pointer `this_reactor()` resolves. Broadcast operations iterate a
//! snapshot of the registry, never the thread-locals.

use std::cell::RefCell;
use std::sync::{Arc, RwLock};

use iomgr_core::reactor::IOReactor;
use iomgr_core::thread::ReactorIdx;

enum Slot {
    Free,
    /// Index handed out, reactor not yet constructed.
    Reserved,
    Active(Arc<dyn IOReactor>),
}

static REGISTRY: RwLock<Vec<Slot>> = RwLock::new(Vec::new());

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Arc<dyn IOReactor>>> = const { RefCell::new(None) };
}

/// Claim a registry index for a reactor about to be constructed.
pub fn reserve_idx() -> ReactorIdx {
    let mut reg = REGISTRY.write().unwrap();
    for (i, slot) in reg.iter_mut().enumerate() {
        if matches!(slot, Slot::Free) {
            *slot = Slot::Reserved;
            return i;
        }
    }
    reg.push(Slot::Reserved);
    reg.len() - 1
}

/// Give back a reserved index whose reactor never came up.
pub fn abort_reserved(idx: ReactorIdx) {
    let mut reg = REGISTRY.write().unwrap();
    if let Some(slot) = reg.get_mut(idx) {
        *slot = Slot::Free;
    }
}

/// Install the reactor in its slot and in this thread's holder. Called
/// from the reactor's own thread, before its loop starts.
pub fn attach(idx: ReactorIdx, reactor: Arc<dyn IOReactor>) {
    {
        let mut reg = REGISTRY.write().unwrap();
        debug_assert!(matches!(reg[idx], Slot::Reserved));
        reg[idx] = Slot::Active(reactor.clone());
    }
    CURRENT_REACTOR.with(|cell| *cell.borrow_mut() = Some(reactor));
}

/// Remove the reactor from its slot and clear this thread's holder.
pub fn detach(idx: ReactorIdx) {
    {
        let mut reg = REGISTRY.write().unwrap();
        if let Some(slot) = reg.get_mut(idx) {
            *slot = Slot::Free;
        }
    }
    CURRENT_REACTOR.with(|cell| *cell.borrow_mut() = None);
}

/// The reactor running on the calling thread, if any.
pub fn this_reactor() -> Option<Arc<dyn IOReactor>> {
    CURRENT_REACTOR.with(|cell| cell.borrow().clone())
}

/// Look up a reactor by registry index.
pub fn specific_reactor(idx: ReactorIdx) -> Option<Arc<dyn IOReactor>> {
    let reg = REGISTRY.read().unwrap();
    match reg.get(idx) {
        Some(Slot::Active(r)) => Some(r.clone()),
        _ => None,
    }
}

/// Visit every attached reactor. The callback gets an `is_last` flag on
/// the final entry so min-tracking scans can finalize. Iterates a
/// snapshot; the registry lock is not held across callbacks.
pub fn all_reactors(mut cb: impl FnMut(&Arc<dyn IOReactor>, bool)) {
    let snapshot: Vec<Arc<dyn IOReactor>> = {
        let reg = REGISTRY.read().unwrap();
        reg.iter()
            .filter_map(|slot| match slot {
                Slot::Active(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    };
    let n = snapshot.len();
    for (i, reactor) in snapshot.iter().enumerate() {
        cb(reactor, i + 1 == n);
    }
}
