//! Timer backends.
//!
//! Two flavors behind the `Timer` trait:
//!
//! - event-driven (`event`): a min-heap of deadlines over a one-shot
//!   timerfd, rearmed to the earliest deadline on every mutation and
//!   expiry. Per-reactor thread timers and the global user/worker timers
//!   on the event backend use this.
//! - polled (`polled`): piggybacks the polled runtime's timer primitive.
//!   The global worker timer on the polled backend uses this.
//!
//! Global timers multicast the user callback to every io_thread in their
//! group on each expiry.

pub mod event;
pub mod polled;

pub use event::{EventTimer, GlobalEventTimer};
pub use polled::GlobalPolledTimer;
