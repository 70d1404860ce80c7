//! Futex-style wait/wake on a 32-bit word
//!
//! The target has no futex syscall. Both operations are expressed with the
//! native vutex primitive, which pends on an address and is woken by a post
//! to the same address. Spurious wakeups are allowed: callers always re-check
//! the condition they are waiting on.

use crate::binding::{self, VUTEX_DEEPWAKE, VUTEX_DONTSET, VUTEX_WAIT_INFINITE, VUTEX_WAKEALL};
use std::ffi::c_ulong;
use std::sync::atomic::{AtomicU32, Ordering};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Outcome of a [`wait`] call. Every variant means "re-check the word".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The word no longer held the expected value
    Changed,
    /// Woken by a post (or spuriously)
    Woken,
    /// The timeout elapsed
    TimedOut,
    /// Interrupted by a signal
    Interrupted,
}

/// Block while `*word == expected`.
///
/// `timeout_ns < 0` waits without a deadline. `timeout_ns == 0` only checks
/// the word. Positive timeouts are rounded down to milliseconds, never below
/// one millisecond, since a zero native timeout would mean "do not wait".
pub fn wait(word: &AtomicU32, expected: u32, timeout_ns: i64) -> WaitOutcome {
    if word.load(Ordering::Acquire) != expected {
        return WaitOutcome::Changed;
    }
    if timeout_ns == 0 {
        return WaitOutcome::TimedOut;
    }

    let timeout = native_timeout(timeout_ns);
    let api = binding::api();
    // SAFETY: word is a live AtomicU32; the native call only reads it and
    // uses its address as the wait key
    let rc = unsafe { (api.vutex_pend)(word.as_ptr(), expected, timeout) };
    match rc {
        0 => WaitOutcome::Woken,
        libc::ETIMEDOUT => WaitOutcome::TimedOut,
        libc::EINTR => WaitOutcome::Interrupted,
        libc::EAGAIN => WaitOutcome::Changed,
        other => {
            log::debug!("vutex pend returned {}", other);
            WaitOutcome::Woken
        }
    }
}

/// Wake up to `count` waiters on `word`. Waking with nobody waiting is a
/// no-op; `count > 1` wakes every waiter.
///
/// The word itself is never modified here: the caller publishes its new
/// value before waking.
pub fn wake(word: &AtomicU32, count: u32) {
    if count == 0 {
        return;
    }
    let mut flags = VUTEX_DONTSET | VUTEX_DEEPWAKE;
    if count > 1 {
        flags |= VUTEX_WAKEALL;
    }
    let api = binding::api();
    // SAFETY: word is a live AtomicU32; DONTSET keeps the native call from
    // writing to it
    let rc = unsafe { (api.vutex_post)(word.as_ptr(), word.load(Ordering::Relaxed), flags) };
    if rc != 0 {
        crate::error::fatal("vutex post", rc);
    }
}

/// Wake every waiter on `word`.
pub fn wake_all(word: &AtomicU32) {
    wake(word, u32::MAX);
}

fn native_timeout(timeout_ns: i64) -> c_ulong {
    if timeout_ns < 0 {
        return VUTEX_WAIT_INFINITE;
    }
    let ms = (timeout_ns / NANOS_PER_MILLI).max(1);
    ms as c_ulong
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_wait_returns_when_value_differs() {
        let word = AtomicU32::new(1);
        assert_eq!(wait(&word, 0, -1), WaitOutcome::Changed);
    }

    #[test]
    fn test_zero_timeout_does_not_block() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        assert_eq!(wait(&word, 0, 0), WaitOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_timeout_elapses() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        let outcome = wait(&word, 0, 20 * NANOS_PER_MILLI);
        assert!(matches!(outcome, WaitOutcome::TimedOut | WaitOutcome::Woken));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_wake_without_waiters_is_noop() {
        let word = AtomicU32::new(3);
        wake(&word, 1);
        wake_all(&word);
        assert_eq!(word.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let waiter = {
            let word = word.clone();
            thread::spawn(move || {
                while word.load(Ordering::Acquire) == 0 {
                    wait(&word, 0, -1);
                }
            })
        };
        thread::sleep(Duration::from_millis(20));
        word.store(1, Ordering::Release);
        wake(&word, 1);
        waiter.join().unwrap();
    }

    #[test]
    fn test_native_timeout_rounding() {
        assert_eq!(native_timeout(-1), VUTEX_WAIT_INFINITE);
        assert_eq!(native_timeout(1), 1);
        assert_eq!(native_timeout(5 * NANOS_PER_MILLI + 7), 5);
    }
}
