//! io_thread endpoints and the thread-regex selector.
//!
//! An `IoThread` is an addressable endpoint within a reactor. Event-driven
//! reactors own exactly one (local address 0); polled reactors own one per
//! logical polled thread. The `thread_idx` is dense and process-global,
//! issued by the manager's reserver; `thread_addr` is local to the owning
//! reactor.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use crate::poll_env::PolledThread;
use crate::reactor::IOReactor;

/// Address of an io_thread within its reactor.
pub type IoThreadAddr = u32;

/// Index of a reactor in the process-wide reactor registry.
pub type ReactorIdx = usize;

/// Selector for unicast/broadcast routing across io_threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRegex {
    AllIo,
    AllWorker,
    AllUser,
    LeastBusyIo,
    LeastBusyWorker,
    LeastBusyUser,
    RandomWorker,
}

impl ThreadRegex {
    /// Whether `thr` is in the set this selector ranges over.
    pub fn matches(&self, thr: &IoThread) -> bool {
        match self {
            ThreadRegex::AllIo | ThreadRegex::LeastBusyIo => true,
            ThreadRegex::AllWorker | ThreadRegex::LeastBusyWorker | ThreadRegex::RandomWorker => {
                thr.is_worker()
            }
            ThreadRegex::AllUser | ThreadRegex::LeastBusyUser => !thr.is_worker(),
        }
    }

    /// True for the selectors resolved by minimum outstanding ops.
    #[inline]
    pub fn is_least_busy(&self) -> bool {
        matches!(
            self,
            ThreadRegex::LeastBusyIo | ThreadRegex::LeastBusyWorker | ThreadRegex::LeastBusyUser
        )
    }
}

/// How messages reach the endpoint: through the registry by reactor index,
/// or straight into a polled thread's queue.
#[derive(Clone)]
pub enum ThreadBackend {
    Reactor(ReactorIdx),
    Polled(Arc<dyn PolledThread>),
}

impl ThreadBackend {
    #[inline]
    pub fn is_polled(&self) -> bool {
        matches!(self, ThreadBackend::Polled(_))
    }
}

/// Per-endpoint metrics.
#[derive(Default)]
pub struct ThreadMetrics {
    outstanding_ops: AtomicI64,
}

/// An addressable endpoint within a reactor.
pub struct IoThread {
    /// Address local to the owning reactor.
    pub thread_addr: IoThreadAddr,

    /// Dense process-global index, from the manager's reserver.
    pub thread_idx: u32,

    /// Delivery identity.
    pub backend: ThreadBackend,

    metrics: ThreadMetrics,

    /// Non-owning back-reference, valid while the reactor is alive
    /// (io_threads are torn down before their reactor).
    reactor: Weak<dyn IOReactor>,

    is_worker: bool,
}

pub type IoThreadPtr = Arc<IoThread>;

impl IoThread {
    pub fn new(
        reactor: &Arc<dyn IOReactor>,
        thread_addr: IoThreadAddr,
        thread_idx: u32,
        backend: ThreadBackend,
    ) -> IoThreadPtr {
        Arc::new(Self {
            thread_addr,
            thread_idx,
            backend,
            metrics: ThreadMetrics::default(),
            reactor: Arc::downgrade(reactor),
            is_worker: reactor.is_worker(),
        })
    }

    pub fn reactor(&self) -> Option<Arc<dyn IOReactor>> {
        self.reactor.upgrade()
    }

    #[inline]
    pub fn is_worker(&self) -> bool {
        self.is_worker
    }

    #[inline]
    pub fn outstanding_ops(&self) -> i64 {
        self.metrics.outstanding_ops.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn incr_pending(&self, n: i64) {
        self.metrics.outstanding_ops.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn decr_pending(&self, n: i64) {
        self.metrics.outstanding_ops.fetch_sub(n, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for IoThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoThread")
            .field("thread_addr", &self.thread_addr)
            .field("thread_idx", &self.thread_idx)
            .field("is_worker", &self.is_worker)
            .field("outstanding_ops", &self.outstanding_ops())
            .finish()
    }
}
