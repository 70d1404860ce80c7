//! Native worker threads
//!
//! Workers are detached pthreads running on a caller-supplied stack. They
//! are never joined; their stacks and bookkeeping live until process exit.
//!
//! Creation blocks every maskable signal on the creating thread first, so
//! the new thread starts fully masked and only unblocks signals once its
//! own signal state (alternate stack, mask) is in place.

use crate::error::{fatal, OsError, Result};
use crate::park::ParkHandle;
use crate::signal::{self, MaskGuard, Signal, SignalSet, ThreadSignals};
use once_cell::sync::OnceCell;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Native thread entry point
pub type ThreadEntry = extern "C" fn(*mut c_void) -> *mut c_void;

static LIVE_THREADS: AtomicUsize = AtomicUsize::new(0);

/// Threads created through this module that have not yet returned
pub fn live_threads() -> usize {
    LIVE_THREADS.load(Ordering::Relaxed)
}

/// A thread stack with a guard page below it.
///
/// There is no `Drop`: a worker may still be running on the stack, and
/// workers are only torn down with the process.
pub struct ThreadStack {
    base: *mut u8,
    len: usize,
    guard: usize,
}

impl ThreadStack {
    /// Map a stack of at least `size` usable bytes, rounded up to whole pages
    /// and never below `PTHREAD_STACK_MIN`.
    pub fn allocate(size: usize) -> Result<Self> {
        let page = crate::os::platform().page_size;
        let usable = round_up(size.max(libc::PTHREAD_STACK_MIN), page);
        let len = usable + page;

        // SAFETY: anonymous private mapping, no file involved
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(OsError::last("mmap thread stack"));
        }
        // SAFETY: the first page lies inside the mapping just created
        if unsafe { libc::mprotect(base, page, libc::PROT_NONE) } != 0 {
            let err = OsError::last("mprotect stack guard");
            // SAFETY: unmapping the region we just mapped
            unsafe { libc::munmap(base, len) };
            return Err(err);
        }

        Ok(ThreadStack {
            base: base.cast(),
            len,
            guard: page,
        })
    }

    /// Lowest usable address (just above the guard page)
    pub fn base(&self) -> *mut c_void {
        // SAFETY: guard < len
        unsafe { self.base.add(self.guard).cast() }
    }

    /// Usable size in bytes
    pub fn size(&self) -> usize {
        self.len - self.guard
    }
}

// SAFETY: the stack memory is handed to exactly one new thread
unsafe impl Send for ThreadStack {}

fn round_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

/// Creation attributes, released on every exit path.
struct ThreadAttr(libc::pthread_attr_t);

impl ThreadAttr {
    fn new(stack: &ThreadStack) -> Self {
        // SAFETY: pthread_attr_init fully initializes the attribute object
        let mut attr: libc::pthread_attr_t = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::pthread_attr_init(&mut attr) };
        if rc != 0 {
            fatal("pthread_attr_init", rc);
        }
        let mut attr = ThreadAttr(attr);

        // SAFETY: attr is initialized; the stack region is mapped and unused
        let rc = unsafe { libc::pthread_attr_setstack(attr.as_mut_ptr(), stack.base(), stack.size()) };
        if rc != 0 {
            fatal("pthread_attr_setstack", rc);
        }
        let rc = unsafe { libc::pthread_attr_setdetachstate(attr.as_mut_ptr(), libc::PTHREAD_CREATE_DETACHED) };
        if rc != 0 {
            fatal("pthread_attr_setdetachstate", rc);
        }
        attr
    }

    fn as_mut_ptr(&mut self) -> *mut libc::pthread_attr_t {
        &mut self.0
    }
}

impl Drop for ThreadAttr {
    fn drop(&mut self) {
        // SAFETY: initialized in new()
        unsafe {
            libc::pthread_attr_destroy(&mut self.0);
        }
    }
}

/// Call `create` until it returns something other than `EAGAIN` or the
/// attempts run out, yielding the processor in between. Returns the last
/// result code.
pub fn retry_on_eagain(attempts: u32, mut create: impl FnMut() -> i32) -> i32 {
    let mut rc = create();
    let mut tries = 1;
    while rc == libc::EAGAIN && tries < attempts.max(1) {
        // SAFETY: sched_yield has no preconditions
        unsafe { libc::sched_yield() };
        rc = create();
        tries += 1;
    }
    rc
}

/// Start a detached thread running `entry(arg)` on `stack`.
///
/// # Safety
///
/// `arg` must be valid for whatever `entry` does with it, and `stack` must
/// not be used by any other thread.
pub unsafe fn spawn_raw(stack: &ThreadStack, entry: ThreadEntry, arg: *mut c_void, attempts: u32) -> libc::pthread_t {
    let mut attr = ThreadAttr::new(stack);
    let attr_ptr = attr.as_mut_ptr();
    let mask = MaskGuard::block_all();

    // Counted before the thread can run, so its exit never underflows
    LIVE_THREADS.fetch_add(1, Ordering::Relaxed);
    let mut tid: libc::pthread_t = std::mem::zeroed();
    let rc = retry_on_eagain(attempts, || unsafe { libc::pthread_create(&mut tid, attr_ptr, entry, arg) });

    drop(mask);
    drop(attr);

    if rc != 0 {
        LIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
        log::error!(
            "failed to create new OS thread (have {} already; errno={})",
            live_threads(),
            rc
        );
        if rc == libc::EAGAIN {
            log::error!("may need to increase max user processes (ulimit -u)");
        }
        fatal("newosproc", rc);
    }
    tid
}

struct Shared {
    id: usize,
    park: ParkHandle,
    tid: OnceCell<libc::pthread_t>,
}

type Body = Box<dyn FnOnce(&WorkerThread) + Send + 'static>;

struct Start {
    shared: Arc<Shared>,
    body: Body,
    inherited: SignalSet,
    signal_stack_size: usize,
}

/// Handle to a runtime worker thread.
#[derive(Clone)]
pub struct WorkerThread {
    shared: Arc<Shared>,
}

impl WorkerThread {
    /// Create worker `id` on `stack`, running `body` once its signal state
    /// is set up. `park` becomes the worker's parking handle.
    pub fn spawn<F>(id: usize, stack: ThreadStack, park: ParkHandle, body: F) -> Result<WorkerThread>
    where
        F: FnOnce(&WorkerThread) + Send + 'static,
    {
        let config = crate::os::config();
        let shared = Arc::new(Shared {
            id,
            park,
            tid: OnceCell::new(),
        });
        let start = Box::new(Start {
            shared: shared.clone(),
            body: Box::new(body),
            inherited: signal::current_mask(),
            signal_stack_size: config.signal_stack_size,
        });

        let arg = Box::into_raw(start).cast::<c_void>();
        // SAFETY: arg is a leaked Box<Start> reclaimed by worker_entry;
        // the stack is moved into this call and never reused
        let tid = unsafe { spawn_raw(&stack, worker_entry, arg, config.thread_create_attempts) };
        let _ = shared.tid.set(tid);

        log::debug!("started raya-worker-{}", id);
        Ok(WorkerThread { shared })
    }

    /// Worker number
    pub fn id(&self) -> usize {
        self.shared.id
    }

    /// Native thread identifier
    pub fn os_thread(&self) -> Option<libc::pthread_t> {
        self.shared.tid.get().copied()
    }

    /// The worker's parking handle
    pub fn park(&self) -> &ParkHandle {
        &self.shared.park
    }

    /// Wake the worker if parked
    pub fn wake(&self) {
        self.shared.park.wake();
    }

    /// Deliver `sig` to this worker
    pub fn signal(&self, sig: Signal) -> Result<()> {
        let tid = self
            .os_thread()
            .ok_or_else(|| OsError::from_errno("pthread_kill", libc::ESRCH))?;
        signal::signal_thread(tid, sig)
    }
}

extern "C" fn worker_entry(arg: *mut c_void) -> *mut c_void {
    // SAFETY: arg came from Box::into_raw in WorkerThread::spawn
    let start = unsafe { Box::from_raw(arg.cast::<Start>()) };
    let Start {
        shared,
        body,
        inherited,
        signal_stack_size,
    } = *start;

    // SAFETY: pthread_self has no preconditions
    let _ = shared.tid.set(unsafe { libc::pthread_self() });

    let signals = match ThreadSignals::init(signal_stack_size, &inherited) {
        Ok(signals) => signals,
        Err(e) => fatal("worker signal setup", e.errno().unwrap_or(0)),
    };

    let me = WorkerThread { shared };
    if panic::catch_unwind(AssertUnwindSafe(|| body(&me))).is_err() {
        fatal("worker thread panicked", 0);
    }

    signals.uninit();
    LIVE_THREADS.fetch_sub(1, Ordering::Relaxed);
    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::park::{ParkResult, WordParker};
    use crossbeam::channel;
    use std::time::Duration;

    #[test]
    fn test_retry_on_eagain_bounded() {
        let mut calls = 0;
        let rc = retry_on_eagain(5, || {
            calls += 1;
            libc::EAGAIN
        });
        assert_eq!(rc, libc::EAGAIN);
        assert_eq!(calls, 5);
    }

    #[test]
    fn test_retry_stops_on_success() {
        let mut calls = 0;
        let rc = retry_on_eagain(5, || {
            calls += 1;
            if calls < 3 {
                libc::EAGAIN
            } else {
                0
            }
        });
        assert_eq!(rc, 0);
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_stack_allocation_is_page_rounded() {
        let stack = ThreadStack::allocate(100_000).unwrap();
        let page = crate::os::platform().page_size;
        assert_eq!(stack.size() % page, 0);
        assert!(stack.size() >= 100_000);
    }

    #[test]
    fn test_worker_runs_with_runtime_mask() {
        let (tx, rx) = channel::bounded(1);
        let stack = ThreadStack::allocate(256 * 1024).unwrap();
        let _blocked = MaskGuard::set(&SignalSet::of(&[Signal::User2]));
        let worker = WorkerThread::spawn(1, stack, ParkHandle::Word(WordParker::new()), move |me| {
            let mask = signal::current_mask();
            tx.send((me.id(), mask)).unwrap();
        })
        .unwrap();

        let (id, mask) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(id, 1);
        assert!(mask.contains(Signal::User2));
        assert!(!mask.contains(Signal::SegmentationFault));
        assert!(!mask.contains(Signal::Terminate));
        assert!(worker.os_thread().is_some());
    }

    #[test]
    fn test_worker_parks_until_woken() {
        let (tx, rx) = channel::bounded(1);
        let stack = ThreadStack::allocate(256 * 1024).unwrap();
        let worker = WorkerThread::spawn(2, stack, ParkHandle::Word(WordParker::new()), move |me| {
            tx.send(me.park().sleep(-1)).unwrap();
        })
        .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        worker.wake();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), ParkResult::Woken);
    }

    #[test]
    fn test_worker_counted_while_running() {
        let (tx, rx) = channel::bounded(1);
        let stack = ThreadStack::allocate(256 * 1024).unwrap();
        let _worker = WorkerThread::spawn(3, stack, ParkHandle::Word(WordParker::new()), move |_| {
            tx.send(live_threads()).unwrap();
        })
        .unwrap();

        let seen = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(seen >= 1);
        assert!(seen < 10_000);
    }
}
