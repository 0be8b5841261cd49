//! Built-in I/O interfaces.
//!
//! - `generic`: catch-all device family for raw descriptors (timerfds,
//!   sockets, user eventfds).
//! - `drive`: the default storage families for each backend. Submission
//!   paths live with the concrete drivers outside this crate; the
//!   interfaces here own registration and per-thread lifecycle.

pub mod drive;
pub mod generic;

pub use drive::{EventDriveInterface, PolledDriveInterface};
pub use generic::GenericIOInterface;
