//! Dense thread-index reservation
//!
//! Hands out small integer `thread_idx` values in `[0, capacity)` and takes
//! them back on release. Uses a LIFO free stack so a recently released index
//! is the first one reused; fresh indexes are claimed with a CAS loop.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::{IomgrError, Result};

/// Reserver for dense io_thread indexes.
pub struct ThreadIdxReserver {
    /// LIFO stack of released indexes, reused before fresh ones.
    free_stack: Mutex<Vec<u32>>,

    /// Next never-used index.
    next_fresh: AtomicU32,

    /// Exclusive upper bound on issued indexes.
    capacity: u32,

    /// Number of indexes currently reserved.
    in_use: AtomicU32,
}

impl ThreadIdxReserver {
    pub fn new(capacity: usize) -> Self {
        Self {
            free_stack: Mutex::new(Vec::with_capacity(capacity.min(64))),
            next_fresh: AtomicU32::new(0),
            capacity: capacity as u32,
            in_use: AtomicU32::new(0),
        }
    }

    /// Reserve an index, preferring recently released ones.
    pub fn reserve(&self) -> Result<u32> {
        {
            let mut free = self.free_stack.lock().unwrap();
            if let Some(idx) = free.pop() {
                self.in_use.fetch_add(1, Ordering::Relaxed);
                return Ok(idx);
            }
        }

        loop {
            let current = self.next_fresh.load(Ordering::Acquire);
            if current >= self.capacity {
                return Err(IomgrError::CapacityExhausted {
                    max: self.capacity as usize,
                });
            }
            match self.next_fresh.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.in_use.fetch_add(1, Ordering::Relaxed);
                    return Ok(current);
                }
                Err(_) => continue, // lost the race, retry
            }
        }
    }

    /// Return an index to the reserver. Releasing an index twice corrupts
    /// the free stack; callers release exactly once per reserve.
    pub fn release(&self, idx: u32) {
        debug_assert!(idx < self.capacity);
        let mut free = self.free_stack.lock().unwrap();
        free.push(idx);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn in_use(&self) -> u32 {
        self.in_use.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_sequential() {
        let r = ThreadIdxReserver::new(16);
        assert_eq!(r.reserve().unwrap(), 0);
        assert_eq!(r.reserve().unwrap(), 1);
        assert_eq!(r.reserve().unwrap(), 2);
        assert_eq!(r.in_use(), 3);
    }

    #[test]
    fn test_release_reuse_lifo() {
        let r = ThreadIdxReserver::new(16);
        let a = r.reserve().unwrap();
        let _b = r.reserve().unwrap();

        r.release(a);
        assert_eq!(r.in_use(), 1);

        // Released index comes back first.
        assert_eq!(r.reserve().unwrap(), a);
    }

    #[test]
    fn test_exhaustion() {
        let r = ThreadIdxReserver::new(2);
        r.reserve().unwrap();
        r.reserve().unwrap();
        assert!(matches!(
            r.reserve(),
            Err(IomgrError::CapacityExhausted { max: 2 })
        ));
    }

    #[test]
    fn test_concurrent_reserve_unique() {
        use std::sync::Arc;
        use std::thread;

        let r = Arc::new(ThreadIdxReserver::new(4096));
        let mut handles = vec![];
        for _ in 0..4 {
            let r = Arc::clone(&r);
            handles.push(thread::spawn(move || {
                (0..1000).map(|_| r.reserve().unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u32> = vec![];
        for h in handles {
            all.extend(h.join().unwrap());
        }
        assert_eq!(all.len(), 4000);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 4000);
    }
}
