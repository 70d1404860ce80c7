//! Raya OS Integration Layer
//!
//! The glue between the Raya runtime and a SylixOS-style POSIX target:
//! - Futex-style wait/wake on the native vutex
//! - Semaphore parking for idle worker threads
//! - Worker thread creation with per-thread signal setup
//! - Signal installation, masking and the event channel
//! - epoll readiness multiplexing
//! - posix_spawn with descriptor remapping
//! - Directory streams, ioctl forwarding and socket address encoding
//!
//! Call [`init`] once at startup before using the rest of the crate.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod binding;
pub mod config;
pub mod dir;
pub mod error;
pub mod futex;
pub mod ifaces;
pub mod os;
pub mod park;
pub mod poll;
pub mod random;
pub mod signal;
pub mod sockaddr;
pub mod spawn;
pub mod syscall;
pub mod thread;

pub use config::{OsConfig, RandomSupport};
pub use error::{fatal, OsError, Result};
pub use futex::WaitOutcome;
pub use os::{init, Platform};
pub use park::{ParkHandle, ParkResult, SemaParker, WordParker};
pub use poll::{Event, Interest, Op, PollFlags, Poller};
pub use signal::{Signal, SignalSet};
pub use sockaddr::SockAddr;
pub use spawn::{spawn, ChildProcess, ProcessGroup, SpawnRequest, WaitStatus};
pub use thread::{ThreadStack, WorkerThread};
