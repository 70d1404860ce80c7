//! Raw system call forwarding
//!
//! The target has no generic syscall instruction path; only a handful of
//! calls are routed, by name, to their libc entry points. Anything else
//! reports ENOSYS instead of failing hard.

use crate::error::{OsError, Result};
use std::ffi::{c_char, c_int, c_void};
use std::os::fd::RawFd;

/// Request code type of the host's `ioctl`
#[cfg(any(target_env = "gnu", target_vendor = "apple"))]
pub type IoctlRequest = libc::c_ulong;
/// Request code type of the host's `ioctl`
#[cfg(not(any(target_env = "gnu", target_vendor = "apple")))]
pub type IoctlRequest = libc::c_int;

/// A system call selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// `execve(path, argv, envp)`
    Execve,
    /// `ioctl(fd, request, arg)`
    Ioctl,
    /// Any other call, by number
    Other(i64),
}

impl Trap {
    /// Map a host syscall number
    pub fn from_number(nr: i64) -> Self {
        match nr {
            n if n == libc::SYS_execve as i64 => Trap::Execve,
            n if n == libc::SYS_ioctl as i64 => Trap::Ioctl,
            n => Trap::Other(n),
        }
    }
}

/// `ioctl(fd, request, arg)`
///
/// # Safety
///
/// `arg` must be what `request` expects.
pub unsafe fn ioctl(fd: RawFd, request: IoctlRequest, arg: *mut c_void) -> Result<c_int> {
    let rc = libc::ioctl(fd, request, arg);
    if rc < 0 {
        return Err(OsError::last("ioctl"));
    }
    Ok(rc)
}

/// Forward a three-argument call. Unsupported traps return
/// [`OsError::NotSupported`] (ENOSYS).
///
/// # Safety
///
/// The arguments are passed through unchecked and must be valid for the
/// selected call.
pub unsafe fn dispatch(trap: Trap, a1: usize, a2: usize, a3: usize) -> Result<usize> {
    match trap {
        Trap::Execve => {
            libc::execve(
                a1 as *const c_char,
                a2 as *const *const c_char,
                a3 as *const *const c_char,
            );
            // execve only returns on failure
            Err(OsError::last("execve"))
        }
        Trap::Ioctl => ioctl(a1 as RawFd, a2 as IoctlRequest, a3 as *mut c_void).map(|rc| rc as usize),
        Trap::Other(nr) => {
            log::debug!("system call {} is not routed on this target", nr);
            Err(OsError::NotSupported("system call"))
        }
    }
}
