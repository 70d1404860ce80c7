//! Signal subsystem
//!
//! Handlers are always installed through one trampoline (see [`trampoline_address`]),
//! never pointed directly at runtime code. The trampoline runs on the
//! thread's alternate stack and turns each delivery into a posted event
//! (see [`take_pending`]) that the runtime drains from normal control flow.
//!
//! The termination signal is special: its delivery exits the process
//! immediately, and it is never part of a blocked mask.

mod action;
mod events;
mod set;
mod stack;

pub use action::{
    ensure_on_stack, handler_of, install, install_disposition, query, register_dispatch_target,
    trampoline_address, Handler, SaFlags, SignalDisposition,
};
pub use events::{
    delivery_count, last_fault_address, take_pending, wait_pending, EXIT_FATAL_FAULT,
};
pub use set::{block, current_mask, set_mask, unblock, MaskGuard, SignalSet};
pub use stack::{current_stack, SignalStack, ThreadSignals};

use crate::error::{OsError, Result};

/// Highest signal number tracked by [`SignalSet`]
pub const NSIG: i32 = 64;

/// The signal whose delivery terminates the process
pub const TERMINATION_SIGNAL: Signal = Signal::Terminate;

/// Signals understood by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Hang-up
    Hangup,
    /// Interrupt
    Interrupt,
    /// Quit
    Quit,
    /// Illegal instruction
    IllegalInstruction,
    /// Trace trap
    Trap,
    /// Abort
    Abort,
    /// Bus error
    BusError,
    /// Floating-point exception
    FloatingPoint,
    /// Kill (uncatchable)
    Kill,
    /// User-defined 1
    User1,
    /// Segmentation fault
    SegmentationFault,
    /// User-defined 2
    User2,
    /// Broken pipe
    Pipe,
    /// Alarm clock
    Alarm,
    /// Termination request
    Terminate,
    /// Child status changed
    Child,
    /// Continue
    Continue,
    /// Stop (uncatchable)
    Stop,
    /// Terminal stop
    TerminalStop,
    /// Background read from terminal
    TerminalInput,
    /// Background write to terminal
    TerminalOutput,
    /// Urgent I/O
    Urgent,
    /// CPU time limit exceeded
    CpuLimit,
    /// File size limit exceeded
    FileSizeLimit,
    /// Virtual timer expired
    VirtualTimer,
    /// Profiling timer expired
    Profile,
    /// Window size change
    WindowChange,
    /// I/O possible
    Io,
    /// Power failure
    PowerFailure,
    /// Bad system call
    BadSystemCall,
}

/// How the runtime treats a delivered signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Synchronous fault raised by the faulting instruction
    Fault,
    /// Timer tick (profiling or alarms)
    Timer,
    /// Asynchronous termination
    Termination,
    /// Anything else
    Other,
}

const ALL: [Signal; 30] = [
    Signal::Hangup,
    Signal::Interrupt,
    Signal::Quit,
    Signal::IllegalInstruction,
    Signal::Trap,
    Signal::Abort,
    Signal::BusError,
    Signal::FloatingPoint,
    Signal::Kill,
    Signal::User1,
    Signal::SegmentationFault,
    Signal::User2,
    Signal::Pipe,
    Signal::Alarm,
    Signal::Terminate,
    Signal::Child,
    Signal::Continue,
    Signal::Stop,
    Signal::TerminalStop,
    Signal::TerminalInput,
    Signal::TerminalOutput,
    Signal::Urgent,
    Signal::CpuLimit,
    Signal::FileSizeLimit,
    Signal::VirtualTimer,
    Signal::Profile,
    Signal::WindowChange,
    Signal::Io,
    Signal::PowerFailure,
    Signal::BadSystemCall,
];

impl Signal {
    /// Every known signal
    pub fn all() -> &'static [Signal] {
        &ALL
    }

    /// Native signal number
    pub const fn as_raw(self) -> i32 {
        match self {
            Signal::Hangup => libc::SIGHUP,
            Signal::Interrupt => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::IllegalInstruction => libc::SIGILL,
            Signal::Trap => libc::SIGTRAP,
            Signal::Abort => libc::SIGABRT,
            Signal::BusError => libc::SIGBUS,
            Signal::FloatingPoint => libc::SIGFPE,
            Signal::Kill => libc::SIGKILL,
            Signal::User1 => libc::SIGUSR1,
            Signal::SegmentationFault => libc::SIGSEGV,
            Signal::User2 => libc::SIGUSR2,
            Signal::Pipe => libc::SIGPIPE,
            Signal::Alarm => libc::SIGALRM,
            Signal::Terminate => libc::SIGTERM,
            Signal::Child => libc::SIGCHLD,
            Signal::Continue => libc::SIGCONT,
            Signal::Stop => libc::SIGSTOP,
            Signal::TerminalStop => libc::SIGTSTP,
            Signal::TerminalInput => libc::SIGTTIN,
            Signal::TerminalOutput => libc::SIGTTOU,
            Signal::Urgent => libc::SIGURG,
            Signal::CpuLimit => libc::SIGXCPU,
            Signal::FileSizeLimit => libc::SIGXFSZ,
            Signal::VirtualTimer => libc::SIGVTALRM,
            Signal::Profile => libc::SIGPROF,
            Signal::WindowChange => libc::SIGWINCH,
            Signal::Io => libc::SIGIO,
            Signal::PowerFailure => libc::SIGPWR,
            Signal::BadSystemCall => libc::SIGSYS,
        }
    }

    /// Look up a native signal number
    pub fn from_raw(raw: i32) -> Option<Signal> {
        ALL.iter().copied().find(|s| s.as_raw() == raw)
    }

    /// Conventional upper-case name
    pub fn name(self) -> &'static str {
        match self {
            Signal::Hangup => "SIGHUP",
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::IllegalInstruction => "SIGILL",
            Signal::Trap => "SIGTRAP",
            Signal::Abort => "SIGABRT",
            Signal::BusError => "SIGBUS",
            Signal::FloatingPoint => "SIGFPE",
            Signal::Kill => "SIGKILL",
            Signal::User1 => "SIGUSR1",
            Signal::SegmentationFault => "SIGSEGV",
            Signal::User2 => "SIGUSR2",
            Signal::Pipe => "SIGPIPE",
            Signal::Alarm => "SIGALRM",
            Signal::Terminate => "SIGTERM",
            Signal::Child => "SIGCHLD",
            Signal::Continue => "SIGCONT",
            Signal::Stop => "SIGSTOP",
            Signal::TerminalStop => "SIGTSTP",
            Signal::TerminalInput => "SIGTTIN",
            Signal::TerminalOutput => "SIGTTOU",
            Signal::Urgent => "SIGURG",
            Signal::CpuLimit => "SIGXCPU",
            Signal::FileSizeLimit => "SIGXFSZ",
            Signal::VirtualTimer => "SIGVTALRM",
            Signal::Profile => "SIGPROF",
            Signal::WindowChange => "SIGWINCH",
            Signal::Io => "SIGIO",
            Signal::PowerFailure => "SIGPWR",
            Signal::BadSystemCall => "SIGSYS",
        }
    }

    /// Runtime classification
    pub fn kind(self) -> SignalKind {
        match self {
            Signal::IllegalInstruction
            | Signal::BusError
            | Signal::FloatingPoint
            | Signal::SegmentationFault => SignalKind::Fault,
            Signal::Profile | Signal::VirtualTimer | Signal::Alarm => SignalKind::Timer,
            Signal::Terminate => SignalKind::Termination,
            _ => SignalKind::Other,
        }
    }

    /// False for signals whose disposition cannot be changed
    pub fn is_catchable(self) -> bool {
        !matches!(self, Signal::Kill | Signal::Stop)
    }
}

/// Deliver `sig` to one thread of this process (a preemption request).
pub fn signal_thread(thread: libc::pthread_t, sig: Signal) -> Result<()> {
    // SAFETY: pthread_kill validates the thread handle itself
    let rc = unsafe { libc::pthread_kill(thread, sig.as_raw()) };
    if rc != 0 {
        return Err(OsError::from_errno("pthread_kill", rc));
    }
    Ok(())
}

/// Arm the process profiling timer at `hz` ticks per second; `hz <= 0`
/// disarms it.
pub fn set_profiling_rate(hz: i32) -> Result<()> {
    let interval = if hz > 0 {
        let usec = (1_000_000 / hz as i64).max(1);
        libc::timeval {
            tv_sec: (usec / 1_000_000) as libc::time_t,
            tv_usec: (usec % 1_000_000) as libc::suseconds_t,
        }
    } else {
        libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        }
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    // SAFETY: timer is a valid itimerval; the old value is not requested
    if unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) } != 0 {
        return Err(OsError::last("setitimer"));
    }
    log::debug!("profiling timer set to {} Hz", hz.max(0));
    Ok(())
}
