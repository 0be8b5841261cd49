//! iomgr error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IomgrError {
    /// Caller error: wrong state, bad selector, table full. A warning-level
    /// condition, never fatal to the manager.
    #[error("configuration error: {0}")]
    Configuration(&'static str),

    /// Polled environment or polled thread-library init failed. Fatal to
    /// `start`; the manager stays uninitialized.
    #[error("polled runtime initialization failed: {0}")]
    InitFailure(String),

    /// `make_io_thread` ran past the thread-index ceiling.
    #[error("io thread capacity exhausted (max {max})")]
    CapacityExhausted { max: usize },

    /// The target reactor does not exist or is not accepting messages.
    #[error("message delivery failed")]
    DeliveryFailed,

    /// OS error with errno.
    #[error("os error: errno {0}")]
    Os(i32),
}

impl IomgrError {
    /// Capture the calling thread's last OS error.
    pub fn last_os() -> Self {
        Self::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

impl From<std::io::Error> for IomgrError {
    fn from(e: std::io::Error) -> Self {
        Self::Os(e.raw_os_error().unwrap_or(0))
    }
}

pub type Result<T> = std::result::Result<T, IomgrError>;
