//! Error taxonomy for pool and condition-variable operations.
//!
//! Expected failures are surfaced as [`Error`] values; internal invariant
//! violations in the barrier are debug assertions instead. OS-level failures
//! arrive as raw errno values from the substrate and are collapsed into the
//! small set of conditions a caller can actually act on.

use thiserror::Error;

/// Raw OS error code as returned by the substrate primitives.
pub(crate) type Errno = i32;

/// Failures reported by [`WorkerPool::add_worker`](crate::WorkerPool::add_worker)
/// and [`RtConditionVariable::new`](crate::RtConditionVariable::new).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Out of OS resources: thread limit reached, or no free
    /// condition-variable slots left in the process.
    #[error("system resource limit exceeded")]
    LimitExceeded,

    /// The process lacks the privilege to request realtime scheduling
    /// (CAP_SYS_NICE or an rtprio rlimit on Linux).
    #[error("insufficient privileges for realtime scheduling")]
    PermissionDenied,

    /// Bad priority or CPU index, or a scheduling parameter the OS rejected.
    #[error("invalid arguments")]
    InvalidArguments,

    /// Any other substrate failure.
    #[error("worker thread error")]
    Other,
}

impl Error {
    /// Maps an errno from a substrate primitive to the public taxonomy.
    pub(crate) fn from_errno(errno: Errno) -> Self {
        match errno {
            libc::EAGAIN => Error::LimitExceeded,
            libc::EPERM => Error::PermissionDenied,
            libc::EINVAL => Error::InvalidArguments,
            _ => Error::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::from_errno(libc::EAGAIN), Error::LimitExceeded);
        assert_eq!(Error::from_errno(libc::EPERM), Error::PermissionDenied);
        assert_eq!(Error::from_errno(libc::EINVAL), Error::InvalidArguments);
        assert_eq!(Error::from_errno(libc::EIO), Error::Other);
    }
}
