//! Signal disposition installation and queries

use super::events::{ensure_channel, trampoline};
use super::{Signal, SignalSet};
use crate::error::{fatal, last_errno};
use bitflags::bitflags;
use std::ffi::c_int;
use std::sync::atomic::{AtomicUsize, Ordering};

bitflags! {
    /// `sa_flags` bits understood by the runtime
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SaFlags: c_int {
        /// Handler takes `(sig, info, context)`
        const SIGINFO = libc::SA_SIGINFO;
        /// Run the handler on the alternate signal stack
        const ONSTACK = libc::SA_ONSTACK;
        /// Restart interrupted system calls
        const RESTART = libc::SA_RESTART;
        /// Do not block the signal while its handler runs
        const NODEFER = libc::SA_NODEFER;
        /// Reset to the default disposition on delivery
        const RESETHAND = libc::SA_RESETHAND;
        /// No SIGCHLD for stopped children
        const NOCLDSTOP = libc::SA_NOCLDSTOP;
    }
}

/// Where a signal is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// `SIG_DFL`
    Default,
    /// `SIG_IGN`
    Ignore,
    /// The runtime trampoline
    Runtime,
    /// Some other handler, by address
    Address(usize),
}

/// Per-signal record of handler, extra mask and flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalDisposition {
    /// Handler entry
    pub handler: Handler,
    /// Signals blocked while the handler runs
    pub mask: SignalSet,
    /// Action flags
    pub flags: SaFlags,
}

impl SignalDisposition {
    /// The disposition the runtime installs for its own handlers
    pub fn runtime() -> Self {
        SignalDisposition {
            handler: Handler::Runtime,
            mask: SignalSet::from_bits(!0),
            flags: SaFlags::SIGINFO | SaFlags::ONSTACK | SaFlags::RESTART,
        }
    }
}

static DISPATCH_TARGET: AtomicUsize = AtomicUsize::new(0);

/// Record the runtime's dispatch entry point. Handlers installed with this
/// address are redirected to the trampoline.
pub fn register_dispatch_target(addr: usize) {
    DISPATCH_TARGET.store(addr, Ordering::Release);
}

/// Address of the trampoline every runtime handler is delivered through
pub fn trampoline_address() -> usize {
    trampoline as *const () as usize
}

/// Install `handler` for `sig` with the runtime's flags: alternate stack,
/// restart on interrupt, every signal masked during delivery.
pub fn install(sig: Signal, handler: Handler) {
    install_disposition(
        sig,
        &SignalDisposition {
            handler,
            ..SignalDisposition::runtime()
        },
    );
}

/// Install an explicit disposition. Failure is fatal.
pub fn install_disposition(sig: Signal, disposition: &SignalDisposition) {
    // SAFETY: sigaction is plain data, fully initialized below
    let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
    sa.sa_sigaction = native_handler(disposition.handler);
    if sa.sa_sigaction == trampoline_address() {
        ensure_channel();
    }
    sa.sa_mask = disposition.mask.to_native();
    sa.sa_flags = disposition.flags.bits();

    // SAFETY: sa is initialized; the old action is not requested
    if unsafe { libc::sigaction(sig.as_raw(), &sa, std::ptr::null_mut()) } != 0 {
        fatal(sig.name(), last_errno());
    }
}

/// Read the installed disposition without changing it.
pub fn query(sig: Signal) -> SignalDisposition {
    let sa = native_query(sig);
    SignalDisposition {
        handler: decode_handler(sa.sa_sigaction),
        mask: SignalSet::from_native(&sa.sa_mask),
        flags: SaFlags::from_bits_truncate(sa.sa_flags),
    }
}

/// The installed handler for `sig`
pub fn handler_of(sig: Signal) -> Handler {
    query(sig).handler
}

/// Make an existing custom handler run on the alternate stack, leaving the
/// handler itself in place. Default and ignored dispositions are untouched.
pub fn ensure_on_stack(sig: Signal) {
    let mut sa = native_query(sig);
    if sa.sa_flags & libc::SA_ONSTACK != 0
        || sa.sa_sigaction == libc::SIG_DFL
        || sa.sa_sigaction == libc::SIG_IGN
    {
        return;
    }
    sa.sa_flags |= libc::SA_ONSTACK;
    // SAFETY: sa came from the kernel and is only extended by one flag
    if unsafe { libc::sigaction(sig.as_raw(), &sa, std::ptr::null_mut()) } != 0 {
        fatal(sig.name(), last_errno());
    }
}

fn native_query(sig: Signal) -> libc::sigaction {
    // SAFETY: a null new action makes this a pure read
    unsafe {
        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(sig.as_raw(), std::ptr::null(), &mut old) != 0 {
            fatal(sig.name(), last_errno());
        }
        old
    }
}

fn native_handler(handler: Handler) -> libc::sighandler_t {
    match handler {
        Handler::Default => libc::SIG_DFL,
        Handler::Ignore => libc::SIG_IGN,
        Handler::Runtime => trampoline_address(),
        Handler::Address(addr) => {
            let target = DISPATCH_TARGET.load(Ordering::Acquire);
            if target != 0 && addr == target {
                trampoline_address()
            } else {
                addr
            }
        }
    }
}

fn decode_handler(raw: libc::sighandler_t) -> Handler {
    if raw == libc::SIG_DFL {
        Handler::Default
    } else if raw == libc::SIG_IGN {
        Handler::Ignore
    } else if raw == trampoline_address() {
        Handler::Runtime
    } else {
        Handler::Address(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_encoding() {
        assert_eq!(decode_handler(native_handler(Handler::Default)), Handler::Default);
        assert_eq!(decode_handler(native_handler(Handler::Ignore)), Handler::Ignore);
        assert_eq!(decode_handler(native_handler(Handler::Runtime)), Handler::Runtime);
        assert_eq!(decode_handler(0x1234), Handler::Address(0x1234));
    }

    #[test]
    fn test_dispatch_target_is_rewritten() {
        register_dispatch_target(0xdead_0000);
        assert_eq!(native_handler(Handler::Address(0xdead_0000)), trampoline_address());
        assert_eq!(native_handler(Handler::Address(0xbeef_0000)), 0xbeef_0000);
    }

    #[test]
    fn test_query_is_side_effect_free() {
        let first = query(Signal::Urgent);
        let second = query(Signal::Urgent);
        assert_eq!(first, second);
    }

    #[test]
    fn test_install_ignore_round_trip() {
        let before = query(Signal::WindowChange);
        install(Signal::WindowChange, Handler::Ignore);
        let after = query(Signal::WindowChange);
        assert_eq!(after.handler, Handler::Ignore);
        assert!(after.flags.contains(SaFlags::ONSTACK | SaFlags::RESTART));
        install_disposition(Signal::WindowChange, &before);
    }
}
