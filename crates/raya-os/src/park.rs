//! Worker-thread parking
//!
//! A parked worker blocks its OS thread until another thread wakes it or a
//! timeout elapses. Two handle kinds exist:
//!
//! - [`SemaParker`]: a native counting semaphore, created lazily on first
//!   use. Concurrent first uses race to publish one semaphore; losers destroy
//!   the one they allocated.
//! - [`WordParker`]: a notification word driven by [`crate::futex`].
//!
//! At most one thread may be parked on a handle at a time.

use crate::binding;
use crate::error::{fatal, last_errno};
use crate::futex;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::time::Instant;

/// Result of a park attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    /// A matching wake was consumed
    Woken,
    /// The timeout elapsed (or the wait was interrupted)
    TimedOut,
}

/// Lazily-created semaphore park handle.
pub struct SemaParker {
    sem: AtomicPtr<libc::sem_t>,
    parked: AtomicBool,
}

impl SemaParker {
    /// A handle with no semaphore yet
    pub const fn new() -> Self {
        Self {
            sem: AtomicPtr::new(ptr::null_mut()),
            parked: AtomicBool::new(false),
        }
    }

    /// Create the semaphore if it does not exist yet.
    ///
    /// Safe to call from several threads at once: exactly one semaphore is
    /// published and every caller observes it.
    pub fn create(&self) -> *mut libc::sem_t {
        let current = self.sem.load(Ordering::Acquire);
        if !current.is_null() {
            return current;
        }

        let api = binding::api();
        // SAFETY: sem_t is plain data; sem_init initializes it below
        let fresh = Box::into_raw(Box::new(unsafe { std::mem::zeroed::<libc::sem_t>() }));
        // SAFETY: fresh points to writable, properly aligned sem_t storage
        if unsafe { (api.sem_init)(fresh, 0, 0) } != 0 {
            fatal("sem_init", last_errno());
        }

        match self
            .sem
            .compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(winner) => {
                // SAFETY: fresh was never published, so no other thread uses it
                unsafe {
                    (api.sem_destroy)(fresh);
                    drop(Box::from_raw(fresh));
                }
                winner
            }
        }
    }

    /// True once a semaphore has been published
    pub fn is_created(&self) -> bool {
        !self.sem.load(Ordering::Acquire).is_null()
    }

    /// Block until woken. A negative timeout waits indefinitely, retrying
    /// through signal interruptions; otherwise wait at most `timeout_ns`.
    pub fn sleep(&self, timeout_ns: i64) -> ParkResult {
        let sem = self.create();
        let _parked = ParkedGuard::enter(&self.parked);
        let api = binding::api();

        if timeout_ns >= 0 {
            let ts = libc::timespec {
                tv_sec: (timeout_ns / 1_000_000_000) as libc::time_t,
                tv_nsec: (timeout_ns % 1_000_000_000) as libc::c_long,
            };
            // SAFETY: sem was initialized by create(); ts outlives the call
            if unsafe { (api.sem_reltimedwait)(sem, &ts) } != 0 {
                let errno = last_errno();
                if errno == libc::ETIMEDOUT || errno == libc::EAGAIN || errno == libc::EINTR {
                    return ParkResult::TimedOut;
                }
                fatal("sem_reltimedwait", errno);
            }
            return ParkResult::Woken;
        }

        loop {
            // SAFETY: sem was initialized by create()
            if unsafe { (api.sem_wait)(sem) } == 0 {
                return ParkResult::Woken;
            }
            let errno = last_errno();
            if errno != libc::EINTR {
                fatal("sem_wait", errno);
            }
        }
    }

    /// Post the semaphore once.
    pub fn wake(&self) {
        let sem = self.create();
        // SAFETY: sem was initialized by create()
        if unsafe { (binding::api().sem_post)(sem) } != 0 {
            fatal("sem_post", last_errno());
        }
    }
}

impl Default for SemaParker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SemaParker {
    fn drop(&mut self) {
        let sem = *self.sem.get_mut();
        if !sem.is_null() {
            // SAFETY: we own the handle exclusively; the semaphore was
            // initialized by create() and nobody is parked on it
            unsafe {
                (binding::api().sem_destroy)(sem);
                drop(Box::from_raw(sem));
            }
        }
    }
}

// SAFETY: the semaphore pointer is only published once and the semaphore
// itself is a thread-safe native object
unsafe impl Send for SemaParker {}
unsafe impl Sync for SemaParker {}

const IDLE: u32 = 0;
const NOTIFIED: u32 = 1;

/// Park handle on a shared notification word.
pub struct WordParker {
    state: AtomicU32,
    parked: AtomicBool,
}

impl WordParker {
    /// An idle handle
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(IDLE),
            parked: AtomicBool::new(false),
        }
    }

    /// Block until woken or `timeout_ns` elapses (negative: no deadline).
    /// A wake issued before the sleep is consumed immediately.
    pub fn sleep(&self, timeout_ns: i64) -> ParkResult {
        let _parked = ParkedGuard::enter(&self.parked);
        let deadline = (timeout_ns >= 0)
            .then(|| Instant::now() + std::time::Duration::from_nanos(timeout_ns as u64));

        loop {
            if self.state.swap(IDLE, Ordering::AcqRel) == NOTIFIED {
                return ParkResult::Woken;
            }
            let remaining = match deadline {
                None => -1,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return ParkResult::TimedOut;
                    }
                    (d - now).as_nanos().min(i64::MAX as u128) as i64
                }
            };
            futex::wait(&self.state, IDLE, remaining);
        }
    }

    /// Wake the parked thread, or let the next sleep return immediately.
    pub fn wake(&self) {
        if self.state.swap(NOTIFIED, Ordering::AcqRel) == IDLE {
            futex::wake(&self.state, 1);
        }
    }
}

impl Default for WordParker {
    fn default() -> Self {
        Self::new()
    }
}

/// A worker's parking handle.
pub enum ParkHandle {
    /// Native semaphore
    Semaphore(SemaParker),
    /// Futex-style word
    Word(WordParker),
}

impl ParkHandle {
    /// Park the calling thread
    pub fn sleep(&self, timeout_ns: i64) -> ParkResult {
        match self {
            ParkHandle::Semaphore(p) => p.sleep(timeout_ns),
            ParkHandle::Word(p) => p.sleep(timeout_ns),
        }
    }

    /// Wake the parked thread
    pub fn wake(&self) {
        match self {
            ParkHandle::Semaphore(p) => p.wake(),
            ParkHandle::Word(p) => p.wake(),
        }
    }
}

/// Marks a handle as occupied for the duration of one sleep.
struct ParkedGuard<'a>(&'a AtomicBool);

impl<'a> ParkedGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        if flag.swap(true, Ordering::AcqRel) {
            fatal("two threads parked on one handle", 0);
        }
        ParkedGuard(flag)
    }
}

impl Drop for ParkedGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_create_is_idempotent() {
        let parker = SemaParker::new();
        assert!(!parker.is_created());
        let a = parker.create();
        let b = parker.create();
        assert_eq!(a, b);
        assert!(parker.is_created());
    }

    #[test]
    fn test_sema_wake_before_sleep() {
        let parker = SemaParker::new();
        parker.wake();
        assert_eq!(parker.sleep(-1), ParkResult::Woken);
    }

    #[test]
    fn test_sema_timeout() {
        let parker = SemaParker::new();
        let start = Instant::now();
        assert_eq!(parker.sleep(10_000_000), ParkResult::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_sema_zero_timeout() {
        let parker = SemaParker::new();
        assert_eq!(parker.sleep(0), ParkResult::TimedOut);
    }

    #[test]
    fn test_word_wake_before_sleep() {
        let parker = WordParker::new();
        parker.wake();
        assert_eq!(parker.sleep(-1), ParkResult::Woken);
        assert_eq!(parker.sleep(0), ParkResult::TimedOut);
    }

    #[test]
    fn test_word_cross_thread_wake() {
        let handle = Arc::new(ParkHandle::Word(WordParker::new()));
        let sleeper = {
            let handle = handle.clone();
            thread::spawn(move || handle.sleep(-1))
        };
        thread::sleep(Duration::from_millis(10));
        handle.wake();
        assert_eq!(sleeper.join().unwrap(), ParkResult::Woken);
    }

    #[test]
    fn test_sema_cross_thread_wake() {
        let handle = Arc::new(ParkHandle::Semaphore(SemaParker::new()));
        let sleeper = {
            let handle = handle.clone();
            thread::spawn(move || handle.sleep(5_000_000_000))
        };
        thread::sleep(Duration::from_millis(10));
        handle.wake();
        assert_eq!(sleeper.join().unwrap(), ParkResult::Woken);
    }
}
