//! Error types for the OS-integration layer.
//!
//! Only caller-input errors and OS-call failures surface as [`OsError`].
//! Broken primitive contracts (a semaphore post that fails, a signal
//! handler that cannot be installed) go through [`fatal`] instead and
//! terminate the process.

/// Errors returned to the immediate caller of this layer.
#[derive(Debug, thiserror::Error)]
pub enum OsError {
    /// An OS call failed with an errno
    #[error("{op}: errno {errno}")]
    Errno {
        /// Name of the failing call
        op: &'static str,
        /// Raw errno value
        errno: i32,
    },

    /// A spawn descriptor table maps onto itself in a way that cannot be
    /// expressed as dup actions
    #[error("invalid descriptor map: child fd {target} takes parent fd {parent}, which is remapped to {conflict}")]
    InvalidFdMap {
        /// Child descriptor slot
        target: i32,
        /// Parent descriptor feeding that slot
        parent: i32,
        /// Parent descriptor the source slot is remapped to
        conflict: i32,
    },

    /// A socket address could not be encoded or decoded
    #[error("invalid socket address: {0}")]
    InvalidAddress(String),

    /// A socket port outside 0..=65535
    #[error("port {0} out of range")]
    PortOutOfRange(i64),

    /// The primitive does not exist on this target
    #[error("{0} is not supported on this target")]
    NotSupported(&'static str),

    /// A native entry point could not be bound
    #[error("symbol binding failed: {0}")]
    Binding(String),

    /// A string passed to the OS contained an interior NUL
    #[error("{0} contains an interior NUL byte")]
    InteriorNul(&'static str),

    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl OsError {
    /// Build an `Errno` error from the calling thread's current errno.
    pub fn last(op: &'static str) -> Self {
        OsError::Errno {
            op,
            errno: last_errno(),
        }
    }

    /// Build an `Errno` error from an explicit errno value.
    pub fn from_errno(op: &'static str, errno: i32) -> Self {
        OsError::Errno { op, errno }
    }

    /// Raw errno carried by this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            OsError::Errno { errno, .. } => Some(*errno),
            OsError::InvalidFdMap { .. }
            | OsError::InvalidAddress(_)
            | OsError::PortOutOfRange(_)
            | OsError::InteriorNul(_) => Some(libc::EINVAL),
            OsError::NotSupported(_) => Some(libc::ENOSYS),
            OsError::Io(e) => e.raw_os_error(),
            OsError::Binding(_) => None,
        }
    }

    /// True if this error reports a missing file or directory.
    pub fn is_not_found(&self) -> bool {
        self.errno() == Some(libc::ENOENT)
    }
}

/// Result type used throughout this crate
pub type Result<T> = std::result::Result<T, OsError>;

/// The calling thread's errno.
pub fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut i32 {
    // SAFETY: always returns the calling thread's errno slot
    unsafe { libc::__errno_location() }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn errno_location() -> *mut i32 {
    // SAFETY: always returns the calling thread's errno slot
    unsafe { libc::__error() }
}

/// Read errno without going through `std::io`. Async-signal-safe.
pub(crate) fn raw_errno() -> i32 {
    // SAFETY: thread-local slot, valid for the thread's lifetime
    unsafe { *errno_location() }
}

/// Overwrite errno. Async-signal-safe.
pub(crate) fn set_errno(value: i32) {
    // SAFETY: as above
    unsafe { *errno_location() = value };
}

/// Abort the process because a primitive broke its contract.
///
/// Used for failures that leave scheduler state inconsistent: there is no
/// caller that could recover from them.
#[cold]
pub fn fatal(what: &str, errno: i32) -> ! {
    log::error!("fatal: {} (errno={})", what, errno);
    eprintln!("raya-os: fatal error: {} (errno={})", what, errno);
    std::process::abort();
}

/// Async-signal-safe variant of [`fatal`] that exits with `code`.
///
/// Does not allocate or lock; safe to call from the signal trampoline.
pub(crate) fn fatal_in_signal(msg: &[u8], code: i32) -> ! {
    // SAFETY: write(2) and _exit(2) are async-signal-safe
    unsafe {
        libc::write(2, msg.as_ptr().cast(), msg.len());
        libc::_exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_round_trip() {
        let err = OsError::from_errno("epoll_ctl", libc::ENOENT);
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert!(err.is_not_found());
        assert!(err.to_string().starts_with("epoll_ctl: "));
    }

    #[test]
    fn test_caller_input_errors_map_to_einval() {
        let err = OsError::InvalidFdMap {
            target: 1,
            parent: 0,
            conflict: 5,
        };
        assert_eq!(err.errno(), Some(libc::EINVAL));
        assert_eq!(OsError::PortOutOfRange(70000).errno(), Some(libc::EINVAL));
    }

    #[test]
    fn test_not_supported_maps_to_enosys() {
        let err = OsError::NotSupported("getrandom");
        assert_eq!(err.errno(), Some(libc::ENOSYS));
        assert_eq!(err.to_string(), "getrandom is not supported on this target");
    }
}
