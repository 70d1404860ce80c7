//! Secure random bytes

use crate::binding::{self, GetRandomFn};
use crate::config::RandomSupport;
use crate::error::{last_errno, OsError, Result};
use bitflags::bitflags;
use once_cell::sync::Lazy;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};

bitflags! {
    /// `getrandom` flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GetRandomFlags: u32 {
        /// Fail with EAGAIN instead of blocking
        const NONBLOCK = 0x0001;
        /// Draw from the blocking pool
        const RANDOM = 0x0002;
    }
}

/// The `getrandom` entry point with a cached "unsupported" verdict.
///
/// Once the entry reports ENOSYS (or is configured absent), no further
/// calls are attempted.
pub struct GetRandom {
    entry: Option<GetRandomFn>,
    unsupported: AtomicBool,
}

impl GetRandom {
    /// Wrap `entry` under `support`
    pub fn new(support: RandomSupport, entry: Option<GetRandomFn>) -> Self {
        let absent = support == RandomSupport::Absent || entry.is_none();
        GetRandom {
            entry,
            unsupported: AtomicBool::new(absent),
        }
    }

    /// False once the entry is known not to work
    pub fn is_supported(&self) -> bool {
        !self.unsupported.load(Ordering::Relaxed)
    }

    /// Fill up to `buf.len()` bytes, returning how many were written.
    pub fn fill(&self, buf: &mut [u8], flags: GetRandomFlags) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let entry = match self.entry {
            Some(entry) if self.is_supported() => entry,
            _ => return Err(OsError::NotSupported("getrandom")),
        };

        // SAFETY: buf is valid for writes of buf.len() bytes
        let n = unsafe { entry(buf.as_mut_ptr().cast(), buf.len(), flags.bits()) };
        if n < 0 {
            let errno = last_errno();
            if errno == libc::ENOSYS {
                self.unsupported.store(true, Ordering::Relaxed);
                log::debug!("getrandom unsupported; using /dev/urandom from now on");
                return Err(OsError::NotSupported("getrandom"));
            }
            return Err(OsError::from_errno("getrandom", errno));
        }
        Ok(n as usize)
    }
}

static GETRANDOM: Lazy<GetRandom> =
    Lazy::new(|| GetRandom::new(crate::os::config().random_support, binding::api().getrandom));

/// The process-wide entry
pub fn getrandom() -> &'static GetRandom {
    &GETRANDOM
}

/// Fill `buf` completely, preferring `getrandom` and falling back to
/// `/dev/urandom`.
pub fn read_random(buf: &mut [u8]) -> Result<()> {
    let source = getrandom();
    let mut filled = 0;
    while filled < buf.len() {
        match source.fill(&mut buf[filled..], GetRandomFlags::empty()) {
            Ok(n) => filled += n,
            Err(e) if e.errno() == Some(libc::EINTR) => continue,
            Err(OsError::NotSupported(_)) => break,
            Err(e) => return Err(e),
        }
    }
    if filled < buf.len() {
        std::fs::File::open("/dev/urandom")?.read_exact(&mut buf[filled..])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn enosys(_: *mut libc::c_void, _: libc::size_t, _: libc::c_uint) -> libc::ssize_t {
        crate::error::set_errno(libc::ENOSYS);
        -1
    }

    #[test]
    fn test_absent_never_calls() {
        let rng = GetRandom::new(RandomSupport::Absent, Some(enosys));
        assert!(!rng.is_supported());
        let mut buf = [0u8; 8];
        assert!(matches!(rng.fill(&mut buf, GetRandomFlags::empty()), Err(OsError::NotSupported(_))));
    }

    #[test]
    fn test_enosys_is_cached() {
        let rng = GetRandom::new(RandomSupport::Probe, Some(enosys));
        assert!(rng.is_supported());
        let mut buf = [0u8; 8];
        assert!(rng.fill(&mut buf, GetRandomFlags::empty()).is_err());
        assert!(!rng.is_supported());
        assert_eq!(
            rng.fill(&mut buf, GetRandomFlags::empty()).unwrap_err().errno(),
            Some(libc::ENOSYS)
        );
    }

    #[test]
    fn test_empty_buffer() {
        let rng = GetRandom::new(RandomSupport::Absent, None);
        assert_eq!(rng.fill(&mut [], GetRandomFlags::empty()).unwrap(), 0);
    }

    #[test]
    fn test_read_random_fills() {
        let mut buf = [0u8; 64];
        read_random(&mut buf).unwrap();
        assert!(buf.iter().any(|&b| b != 0));
    }
}
