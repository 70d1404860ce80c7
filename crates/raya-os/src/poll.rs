//! I/O readiness multiplexer
//!
//! A thin layer over epoll. Each [`Poller`] keeps its own registration
//! table so repeating an identical `Add` succeeds rather than failing
//! with `EEXIST`.

use crate::error::{OsError, Result};
use bitflags::bitflags;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::ffi::c_int;
use std::os::fd::{AsRawFd, RawFd};

bitflags! {
    /// Readiness interest / event mask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u32 {
        /// Readable
        const READABLE = libc::EPOLLIN as u32;
        /// Writable
        const WRITABLE = libc::EPOLLOUT as u32;
        /// Urgent data
        const PRIORITY = libc::EPOLLPRI as u32;
        /// Error condition (always reported)
        const ERROR = libc::EPOLLERR as u32;
        /// Hang-up (always reported)
        const HANGUP = libc::EPOLLHUP as u32;
        /// Peer closed its write half. The target has no separate
        /// constant for this and reports it as [`Interest::HANGUP`].
        const RDHUP = libc::EPOLLRDHUP as u32;
        /// Disarm after one event
        const ONESHOT = libc::EPOLLONESHOT as u32;
        /// Edge-triggered. A software bit, translated to the native
        /// edge-trigger constant at the system call boundary.
        const EDGE = 1 << 31;
    }
}

impl Interest {
    fn to_native(self) -> u32 {
        let mut bits = (self - Interest::EDGE).bits();
        if self.contains(Interest::EDGE) {
            bits |= libc::EPOLLET as u32;
        }
        bits
    }

    fn from_native(bits: u32) -> Self {
        Interest::from_bits_truncate(bits & !(libc::EPOLLET as u32))
    }
}

bitflags! {
    /// Creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: i32 {
        /// Close the poller descriptor across exec
        const CLOEXEC = libc::EPOLL_CLOEXEC;
    }
}

/// Registration operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Register a descriptor
    Add,
    /// Change a registration's interest
    Modify,
    /// Remove a registration
    Delete,
}

/// A ready descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Descriptor
    pub fd: RawFd,
    /// What it is ready for
    pub readiness: Interest,
}

impl Default for Event {
    fn default() -> Self {
        Event {
            fd: -1,
            readiness: Interest::empty(),
        }
    }
}

impl Event {
    /// An empty event buffer sized by the configured `max_poll_events`
    pub fn buffer() -> Vec<Event> {
        vec![Event::default(); crate::os::config().max_poll_events]
    }
}

/// An epoll instance plus its registration table.
pub struct Poller {
    epfd: RawFd,
    registrations: DashMap<RawFd, Interest>,
}

impl Poller {
    /// Create a multiplexer context
    pub fn create(flags: PollFlags) -> Result<Poller> {
        // SAFETY: epoll_create1 takes only flags
        let epfd = unsafe { libc::epoll_create1(flags.bits()) };
        if epfd < 0 {
            return Err(OsError::last("epoll_create1"));
        }
        Ok(Poller {
            epfd,
            registrations: DashMap::new(),
        })
    }

    /// Add, modify or delete the registration of `fd`. `interest` is ignored
    /// for [`Op::Delete`].
    ///
    /// The table entry for `fd` stays locked across the kernel call, so the
    /// table and the epoll set change together.
    pub fn control(&self, op: Op, fd: RawFd, interest: Interest) -> Result<()> {
        match op {
            Op::Add => match self.registrations.entry(fd) {
                Entry::Occupied(entry) if *entry.get() == interest => {
                    // Closing a descriptor drops it from the epoll set without
                    // touching the table; a reused number must be re-added.
                    match self.ctl(libc::EPOLL_CTL_MOD, fd, interest) {
                        Err(e) if e.errno() == Some(libc::ENOENT) => {
                            self.ctl(libc::EPOLL_CTL_ADD, fd, interest)
                        }
                        other => other,
                    }
                }
                Entry::Occupied(mut entry) => {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
                    entry.insert(interest);
                    Ok(())
                }
                Entry::Vacant(entry) => {
                    self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
                    entry.insert(interest);
                    Ok(())
                }
            },
            Op::Modify => match self.registrations.entry(fd) {
                Entry::Occupied(mut entry) => {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, interest)?;
                    entry.insert(interest);
                    Ok(())
                }
                Entry::Vacant(entry) => {
                    self.ctl(libc::EPOLL_CTL_MOD, fd, interest)?;
                    entry.insert(interest);
                    Ok(())
                }
            },
            Op::Delete => match self.registrations.entry(fd) {
                Entry::Occupied(entry) => {
                    let result = self.ctl(libc::EPOLL_CTL_DEL, fd, interest);
                    // A stale entry (descriptor already closed) goes as well
                    if result.is_ok()
                        || matches!(result.as_ref().err().and_then(OsError::errno), Some(libc::ENOENT | libc::EBADF))
                    {
                        entry.remove();
                    }
                    result
                }
                Entry::Vacant(_) => self.ctl(libc::EPOLL_CTL_DEL, fd, interest),
            },
        }
    }

    fn ctl(&self, native_op: c_int, fd: RawFd, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.to_native(),
            u64: fd as u64,
        };
        // SAFETY: ev is valid for the call; the kernel copies it
        if unsafe { libc::epoll_ctl(self.epfd, native_op, fd, &mut ev) } != 0 {
            return Err(OsError::last("epoll_ctl"));
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` (negative: forever) and fill `events`.
    ///
    /// Returns the number of ready descriptors, 0 on timeout or signal
    /// interruption. An empty `events` still performs the wait, through a
    /// one-slot placeholder; the count it reports is not stored anywhere.
    pub fn wait(&self, events: &mut [Event], timeout_ms: i32) -> Result<usize> {
        let capacity = events.len().clamp(1, i32::MAX as usize);
        let mut native = vec![libc::epoll_event { events: 0, u64: 0 }; capacity];

        // SAFETY: native has room for `capacity` entries
        let n = unsafe { libc::epoll_wait(self.epfd, native.as_mut_ptr(), capacity as i32, timeout_ms) };
        if n < 0 {
            let err = OsError::last("epoll_wait");
            if err.errno() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        let n = n as usize;
        for (slot, ev) in events.iter_mut().zip(&native[..n]) {
            *slot = Event {
                fd: ev.u64 as RawFd,
                readiness: Interest::from_native(ev.events),
            };
        }
        Ok(n)
    }

    /// Interest currently registered for `fd`
    pub fn registered(&self, fd: RawFd) -> Option<Interest> {
        self.registrations.get(&fd).map(|r| *r)
    }

    /// Number of registered descriptors
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// True if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // SAFETY: epfd is owned by this poller
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_edge_bit_translation() {
        let i = Interest::READABLE | Interest::EDGE;
        assert_eq!(i.to_native(), libc::EPOLLIN as u32 | libc::EPOLLET as u32);
        assert_eq!(Interest::from_native(i.to_native()), Interest::READABLE);
    }

    #[test]
    fn test_readable_pipe_reported() {
        let poller = Poller::create(PollFlags::CLOEXEC).unwrap();
        let (r, w) = pipe();
        poller.control(Op::Add, r, Interest::READABLE).unwrap();
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr().cast(), 1) }, 1);

        let mut events = [Event::default(); 4];
        let n = poller.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].fd, r);
        assert!(events[0].readiness.contains(Interest::READABLE));
        close(r);
        close(w);
    }

    #[test]
    fn test_identical_add_is_idempotent() {
        let poller = Poller::create(PollFlags::empty()).unwrap();
        let (r, w) = pipe();
        poller.control(Op::Add, r, Interest::READABLE).unwrap();
        poller.control(Op::Add, r, Interest::READABLE).unwrap();
        assert_eq!(poller.len(), 1);

        poller.control(Op::Modify, r, Interest::READABLE | Interest::EDGE).unwrap();
        assert_eq!(poller.registered(r), Some(Interest::READABLE | Interest::EDGE));

        poller.control(Op::Delete, r, Interest::empty()).unwrap();
        assert!(poller.is_empty());
        assert!(poller.control(Op::Delete, r, Interest::empty()).is_err());
        close(r);
        close(w);
    }

    #[test]
    fn test_empty_buffer_still_waits() {
        let poller = Poller::create(PollFlags::empty()).unwrap();
        let start = Instant::now();
        assert_eq!(poller.wait(&mut [], 30).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_configured_buffer_no_registrations() {
        let poller = Poller::create(PollFlags::CLOEXEC).unwrap();
        let mut events = Event::buffer();
        assert_eq!(events.len(), crate::os::config().max_poll_events);
        assert_eq!(poller.wait(&mut events, 10).unwrap(), 0);
    }

    #[test]
    fn test_identical_add_after_descriptor_reuse() {
        let poller = Poller::create(PollFlags::CLOEXEC).unwrap();
        let (r, w) = pipe();
        poller.control(Op::Add, r, Interest::READABLE).unwrap();
        close(r);
        close(w);

        // Reuse the number without deleting the registration first
        let (r2, w2) = pipe();
        let w2 = if w2 == r {
            let moved = unsafe { libc::dup(w2) };
            assert!(moved >= 0);
            close(w2);
            moved
        } else {
            w2
        };
        let r2 = if r2 == r {
            r2
        } else {
            assert!(unsafe { libc::dup2(r2, r) } == r);
            close(r2);
            r
        };
        poller.control(Op::Add, r2, Interest::READABLE).unwrap();
        assert_eq!(unsafe { libc::write(w2, b"x".as_ptr().cast(), 1) }, 1);

        let mut events = [Event::default(); 2];
        assert_eq!(poller.wait(&mut events, 1000).unwrap(), 1);
        assert_eq!(events[0].fd, r2);
        close(r2);
        close(w2);
    }

    #[test]
    fn test_concurrent_identical_add() {
        let poller = Poller::create(PollFlags::empty()).unwrap();
        let (r, w) = pipe();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| poller.control(Op::Add, r, Interest::READABLE).unwrap());
            }
        });
        assert_eq!(poller.registered(r), Some(Interest::READABLE));
        close(r);
        close(w);
    }

    #[test]
    fn test_delete_of_closed_descriptor_clears_table() {
        let poller = Poller::create(PollFlags::empty()).unwrap();
        let (r, w) = pipe();
        poller.control(Op::Add, r, Interest::READABLE).unwrap();
        close(r);
        assert!(poller.control(Op::Delete, r, Interest::empty()).is_err());
        assert!(poller.registered(r).is_none());
        close(w);
    }

    #[test]
    fn test_peer_close_reports_hangup() {
        let poller = Poller::create(PollFlags::empty()).unwrap();
        let (r, w) = pipe();
        poller.control(Op::Add, r, Interest::READABLE | Interest::RDHUP).unwrap();
        close(w);

        let mut events = [Event::default(); 2];
        assert_eq!(poller.wait(&mut events, 1000).unwrap(), 1);
        assert!(events[0].readiness.contains(Interest::HANGUP));
        close(r);
    }
}
