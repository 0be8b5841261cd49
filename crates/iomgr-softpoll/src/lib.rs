//! # iomgr-softpoll
//!
//! Software implementation of the `iomgr-core` polled-runtime contract.
//!
//! Real polled stacks run their own per-core threads with hugepage-backed
//! DMA memory. This crate stands in for one inside a single process: each
//! `SoftPollThread` is a bounded closure inbox plus a deadline list,
//! advanced only when the owning reactor calls `poll()`. The allocator is
//! libc `aligned_alloc` behind the DMA seam.
//!
//! Used by the polled reactor path in tests and demos, and as a template
//! for wiring an actual polled stack.

pub mod env;
pub mod thread;

pub use env::{SoftBlockDesc, SoftPollEnv};
pub use thread::SoftPollThread;
