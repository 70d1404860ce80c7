//! Out-of-band signal event channel
//!
//! The trampoline runs in signal context: no allocation, no locks, no
//! logging. It only touches atomics and writes one byte to a nonblocking
//! pipe. Everything else happens later, on a normal thread, through
//! [`take_pending`] and [`wait_pending`].

use super::{Signal, SignalKind, SignalSet, NSIG, TERMINATION_SIGNAL};
use crate::error::{fatal, fatal_in_signal, last_errno, raw_errno, set_errno};
use once_cell::sync::OnceCell;
use std::ffi::{c_int, c_void};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Exit status used when a fault is delivered by the hardware
pub const EXIT_FATAL_FAULT: i32 = 2;

static PENDING: AtomicU64 = AtomicU64::new(0);
static COUNTS: [AtomicU64; NSIG as usize + 1] = [const { AtomicU64::new(0) }; NSIG as usize + 1];
static FAULT_ADDR: AtomicUsize = AtomicUsize::new(0);
static WAKE_WRITE: AtomicI32 = AtomicI32::new(-1);
static CHANNEL: OnceCell<Pipe> = OnceCell::new();

struct Pipe {
    read: RawFd,
    write: RawFd,
}

/// Create the wake pipe if needed. Called before the trampoline is first
/// installed so the handler never has to create anything.
pub(super) fn ensure_channel() {
    CHANNEL.get_or_init(|| {
        let mut fds = [0 as c_int; 2];
        // SAFETY: fds has room for both ends
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            fatal("signal channel pipe", last_errno());
        }
        for &fd in &fds {
            // SAFETY: fd was just returned by pipe
            unsafe {
                let fl = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        WAKE_WRITE.store(fds[1], Ordering::Release);
        Pipe {
            read: fds[0],
            write: fds[1],
        }
    });
}

/// Entry point for every runtime-installed handler.
pub(crate) extern "C" fn trampoline(sig: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    let saved_errno = raw_errno();

    if sig == TERMINATION_SIGNAL.as_raw() {
        // SAFETY: the kernel passes a valid siginfo for SA_SIGINFO handlers
        let code = unsafe { termination_code(sig, info.as_ref()) };
        // SAFETY: _exit is async-signal-safe
        unsafe { libc::_exit(code) };
    }

    if let Some(kind) = Signal::from_raw(sig).map(Signal::kind) {
        if kind == SignalKind::Fault {
            // SAFETY: as above
            if let Some(info) = unsafe { info.as_ref() } {
                // SAFETY: si_addr is valid for fault signals
                FAULT_ADDR.store(unsafe { info.si_addr() } as usize, Ordering::Relaxed);
                if info.si_code > 0 {
                    fault_exit(sig);
                }
            }
        }
    }

    if (1..=NSIG).contains(&sig) {
        COUNTS[sig as usize].fetch_add(1, Ordering::Relaxed);
        PENDING.fetch_or(1 << (sig - 1), Ordering::Release);
    }

    let fd = WAKE_WRITE.load(Ordering::Acquire);
    if fd >= 0 {
        let byte = sig as u8;
        // SAFETY: write is async-signal-safe; a full pipe already has a
        // wake queued, so EAGAIN is ignored
        unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
    }

    set_errno(saved_errno);
}

/// Exit code for a termination delivery: the queued value when the sender
/// used `sigqueue`, otherwise `128 + sig`.
fn termination_code(sig: c_int, info: Option<&libc::siginfo_t>) -> c_int {
    match info {
        Some(info) if info.si_code == libc::SI_QUEUE => {
            // SAFETY: SI_QUEUE deliveries carry a sigval
            let value = unsafe { info.si_value() };
            value.sival_ptr as usize as u32 as c_int
        }
        _ => 128 + sig,
    }
}

fn fault_exit(sig: c_int) -> ! {
    let name = Signal::from_raw(sig).map_or("fault", Signal::name);
    // SAFETY: write is async-signal-safe; the pieces are static bytes
    unsafe {
        let prefix = b"raya-os: fatal signal ";
        libc::write(2, prefix.as_ptr().cast(), prefix.len());
        libc::write(2, name.as_ptr().cast(), name.len());
    }
    fatal_in_signal(b"\n", EXIT_FATAL_FAULT)
}

/// Drain every signal delivered since the last call.
pub fn take_pending() -> SignalSet {
    if let Some(pipe) = CHANNEL.get() {
        let mut scratch = [0u8; 64];
        // SAFETY: the read end is nonblocking and owned by the channel
        while unsafe { libc::read(pipe.read, scratch.as_mut_ptr().cast(), scratch.len()) } > 0 {}
    }
    SignalSet::from_bits(PENDING.swap(0, Ordering::Acquire))
}

/// Block until some signal has been delivered or `timeout` elapses
/// (`None` waits without a deadline), then drain.
pub fn wait_pending(timeout: Option<Duration>) -> SignalSet {
    let pending = take_pending();
    if !pending.is_empty() {
        return pending;
    }
    let Some(pipe) = CHANNEL.get() else {
        if let Some(t) = timeout {
            std::thread::sleep(t);
        }
        return take_pending();
    };

    let timeout_ms = timeout.map_or(-1, |t| t.as_millis().min(c_int::MAX as u128) as c_int);
    let mut pfd = libc::pollfd {
        fd: pipe.read,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pfd is a single valid pollfd; EINTR just means "drain now"
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
    take_pending()
}

/// Number of deliveries of `sig` seen by the trampoline
pub fn delivery_count(sig: Signal) -> u64 {
    let raw = sig.as_raw();
    if (1..=NSIG).contains(&raw) {
        COUNTS[raw as usize].load(Ordering::Relaxed)
    } else {
        0
    }
}

/// Address reported by the most recent fault signal, 0 if none
pub fn last_fault_address() -> usize {
    FAULT_ADDR.load(Ordering::Relaxed)
}

impl Drop for Pipe {
    fn drop(&mut self) {
        // SAFETY: both ends are owned by this pipe
        unsafe {
            libc::close(self.read);
            libc::close(self.write);
        }
    }
}
