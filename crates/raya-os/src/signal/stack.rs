//! Alternate signal stacks and per-thread signal setup

use super::{set_mask, Signal, SignalKind, SignalSet, TERMINATION_SIGNAL};
use crate::config::MIN_SIGNAL_STACK;
use crate::error::{fatal, last_errno, OsError, Result};
use std::ptr;

/// An mmap'd region used as a thread's alternate signal stack.
pub struct SignalStack {
    base: *mut u8,
    size: usize,
}

impl SignalStack {
    /// Map a stack of at least `size` bytes (never below the target minimum).
    pub fn allocate(size: usize) -> Result<Self> {
        let size = size.max(MIN_SIGNAL_STACK);
        // SAFETY: anonymous private mapping, no file involved
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(OsError::last("mmap signal stack"));
        }
        Ok(SignalStack {
            base: base.cast(),
            size,
        })
    }

    /// Lowest address of the stack
    pub fn base(&self) -> usize {
        self.base as usize
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for SignalStack {
    fn drop(&mut self) {
        // SAFETY: the region came from mmap with this size
        unsafe {
            libc::munmap(self.base.cast(), self.size);
        }
    }
}

// SAFETY: the mapping is only handed to the kernel, never aliased in Rust
unsafe impl Send for SignalStack {}

/// The alternate stack installed on the calling thread, if any
pub fn current_stack() -> Option<(usize, usize)> {
    let old = sigaltstack(None);
    if old.ss_flags & libc::SS_DISABLE != 0 {
        None
    } else {
        Some((old.ss_sp as usize, old.ss_size))
    }
}

fn sigaltstack(new: Option<&libc::stack_t>) -> libc::stack_t {
    // SAFETY: stack_t is plain data; new, when present, is initialized
    unsafe {
        let mut old: libc::stack_t = std::mem::zeroed();
        let new_ptr = new.map_or(ptr::null(), |s| s as *const libc::stack_t);
        if libc::sigaltstack(new_ptr, &mut old) != 0 {
            fatal("sigaltstack", last_errno());
        }
        old
    }
}

/// Signals a runtime thread never keeps blocked: faults must reach the
/// trampoline and termination must always land.
fn always_deliverable() -> SignalSet {
    let mut set = SignalSet::of(&[TERMINATION_SIGNAL]);
    for &sig in Signal::all() {
        if sig.kind() == SignalKind::Fault {
            set.add(sig);
        }
    }
    set
}

/// Signal state a runtime thread sets up on entry and tears down on exit.
///
/// Installs an alternate stack unless one is already present (a foreign
/// thread may have its own) and restores `inherited` as the thread mask
/// with fault and termination signals unblocked. Dropping the value
/// disables the stack again if this thread installed it.
pub struct ThreadSignals {
    stack: Option<SignalStack>,
}

impl ThreadSignals {
    /// Set up the calling thread.
    pub fn init(stack_size: usize, inherited: &SignalSet) -> Result<Self> {
        let stack = if current_stack().is_none() {
            let stack = SignalStack::allocate(stack_size)?;
            let ss = libc::stack_t {
                ss_sp: stack.base.cast(),
                ss_flags: 0,
                ss_size: stack.size,
            };
            sigaltstack(Some(&ss));
            Some(stack)
        } else {
            None
        };

        set_mask(&inherited.difference(always_deliverable()));
        Ok(ThreadSignals { stack })
    }

    /// True if this thread is using a stack installed by [`ThreadSignals::init`]
    pub fn owns_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Tear down explicitly; same as dropping.
    pub fn uninit(self) {}
}

impl Drop for ThreadSignals {
    fn drop(&mut self) {
        if self.stack.is_some() {
            // SAFETY: stack_t is plain data
            let mut ss: libc::stack_t = unsafe { std::mem::zeroed() };
            ss.ss_flags = libc::SS_DISABLE;
            sigaltstack(Some(&ss));
        }
    }
}
