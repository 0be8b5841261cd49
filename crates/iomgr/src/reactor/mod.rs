//! Reactor implementations.
//!
//! - `event`: epoll over registered descriptors plus an eventfd wake
//!   source and a timerfd-backed thread timer.
//! - `polled`: busy-loops a polled-runtime thread; messages arrive as
//!   closures through the polled thread's send primitive.
//!
//! Both deliver dequeued messages through the module table and
//! acknowledge sync messages exactly once per delivery.

pub mod event;
pub mod polled;

pub use event::IOReactorEPoll;
pub use polled::IOReactorPolled;

use tracing::warn;

use iomgr_core::msg::IomgrMsg;

use crate::manager::iomanager;

/// Invoke the registered module handler for a dequeued message, then
/// acknowledge. Consumes the message; this is the single exit point of
/// every delivered message, on the thread that dequeued it.
pub(crate) fn dispatch_msg(msg: IomgrMsg) {
    match iomanager().msg_module(msg.module_id) {
        Some(handler) => handler(&msg),
        None => {
            warn!(module_id = msg.module_id, "message for unregistered module dropped");
        }
    }
    msg.finish();
}
