//! Aligned I/O buffer allocation.
//!
//! Two implementations behind one process-wide hook: libc
//! `aligned_alloc` by default, and the polled environment's DMA-capable
//! allocator once a polled-backend `start` rebinds the hook. Unrelated
//! code paths allocating through `iobuf_alloc` pick up the rebind
//! without knowing which backend is live.
//!
//! Sizes are rounded up to the alignment before allocation, as
//! `aligned_alloc` demands.

use std::sync::{Arc, OnceLock, RwLock};

use iomgr_core::poll_env::PolledEnv;

pub trait AlignedAllocator: Send + Sync {
    fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8;
    fn aligned_free(&self, buf: *mut u8);
    fn aligned_realloc(&self, buf: *mut u8, align: usize, new_size: usize, old_size: usize)
        -> *mut u8;
}

/// Plain libc allocation.
pub struct LibcAlignedAllocator;

impl AlignedAllocator for LibcAlignedAllocator {
    fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        unsafe { libc::aligned_alloc(align, size) as *mut u8 }
    }

    fn aligned_free(&self, buf: *mut u8) {
        unsafe { libc::free(buf as *mut libc::c_void) }
    }

    fn aligned_realloc(
        &self,
        buf: *mut u8,
        align: usize,
        new_size: usize,
        old_size: usize,
    ) -> *mut u8 {
        let new_buf = self.aligned_alloc(align, new_size);
        if new_buf.is_null() {
            return new_buf;
        }
        if !buf.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(buf, new_buf, old_size.min(new_size));
            }
            self.aligned_free(buf);
        }
        new_buf
    }
}

/// DMA-capable allocation through the polled environment.
pub struct DmaAlignedAllocator {
    env: Arc<dyn PolledEnv>,
}

impl DmaAlignedAllocator {
    pub fn new(env: Arc<dyn PolledEnv>) -> Self {
        Self { env }
    }
}

impl AlignedAllocator for DmaAlignedAllocator {
    fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        self.env.dma_alloc(align, size)
    }

    fn aligned_free(&self, buf: *mut u8) {
        self.env.dma_free(buf)
    }

    fn aligned_realloc(
        &self,
        buf: *mut u8,
        align: usize,
        new_size: usize,
        old_size: usize,
    ) -> *mut u8 {
        self.env.dma_realloc(buf, align, new_size, old_size)
    }
}

static CURRENT: RwLock<Option<Arc<dyn AlignedAllocator>>> = RwLock::new(None);

fn libc_allocator() -> Arc<dyn AlignedAllocator> {
    static LIBC: OnceLock<Arc<LibcAlignedAllocator>> = OnceLock::new();
    LIBC.get_or_init(|| Arc::new(LibcAlignedAllocator)).clone()
}

/// Rebind the process-wide allocator hook.
pub fn set_allocator(alloc: Arc<dyn AlignedAllocator>) {
    *CURRENT.write().unwrap() = Some(alloc);
}

/// Back to libc.
pub fn reset_allocator() {
    *CURRENT.write().unwrap() = None;
}

fn current() -> Arc<dyn AlignedAllocator> {
    CURRENT
        .read()
        .unwrap()
        .clone()
        .unwrap_or_else(libc_allocator)
}

#[inline]
fn round_up(size: usize, align: usize) -> usize {
    size.div_ceil(align) * align
}

/// Allocate `size` bytes (rounded up to `align`) at `align`.
pub fn iobuf_alloc(align: usize, size: usize) -> *mut u8 {
    current().aligned_alloc(align, round_up(size, align))
}

/// Free a buffer from `iobuf_alloc`/`iobuf_realloc`. The buffer must not
/// straddle an allocator rebind.
pub fn iobuf_free(buf: *mut u8) {
    current().aligned_free(buf)
}

/// Grow or shrink, preserving the common prefix.
pub fn iobuf_realloc(buf: *mut u8, align: usize, new_size: usize, old_size: usize) -> *mut u8 {
    current().aligned_realloc(buf, align, round_up(new_size, align), old_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_up(513, 512), 1024);
    }

    #[test]
    fn test_alloc_alignment_and_free() {
        let buf = iobuf_alloc(4096, 100);
        assert!(!buf.is_null());
        assert_eq!(buf as usize % 4096, 0);
        unsafe { std::ptr::write_bytes(buf, 0x5a, 100) };
        iobuf_free(buf);
    }

    #[test]
    fn test_realloc_preserves_prefix() {
        let buf = iobuf_alloc(512, 512);
        unsafe { std::ptr::write_bytes(buf, 0xcd, 512) };

        let grown = iobuf_realloc(buf, 512, 2048, 512);
        assert!(!grown.is_null());
        assert_eq!(unsafe { *grown }, 0xcd);
        assert_eq!(unsafe { *grown.add(511) }, 0xcd);
        iobuf_free(grown);
    }
}
