//! Native entry-point binding
//!
//! The target exposes its wait/wake, semaphore and process-mode primitives
//! from vendor shared objects rather than from libc. At startup every entry
//! point is resolved by name into a [`NativeApi`] table of function pointers;
//! the rest of the crate calls through that table as if the calls were
//! ordinary functions.
//!
//! Resolution order per entry:
//! 1. `dlsym(RTLD_DEFAULT, name)`, symbols already linked into the process
//! 2. each configured native library, opened with `dlopen`
//! 3. a host fallback implemented here (when the entry has one)

use crate::error::{OsError, Result};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::ffi::{c_char, c_int, c_uint, c_ulong, c_void, CStr, CString};
use std::time::Duration;

/// Vutex flag: wake every waiter
pub const VUTEX_WAKEALL: c_int = 0x0001;
/// Vutex flag: do not store the value before waking
pub const VUTEX_DONTSET: c_int = 0x0002;
/// Vutex flag: wake all waiters regardless of their desired value
pub const VUTEX_DEEPWAKE: c_int = 0x0004;
/// Vutex timeout meaning "wait forever"
pub const VUTEX_WAIT_INFINITE: c_ulong = c_ulong::MAX;

/// Process exit mode: tear down every thread when the main thread exits
pub const VPROC_EXIT_FORCE: c_int = 1;

/// `pend(addr, expected, timeout_ms)`: 0 when woken, an errno otherwise
pub type VutexPendFn = unsafe extern "C" fn(*mut u32, u32, c_ulong) -> c_int;
/// `post(addr, value, flags)`: 0 on success, an errno otherwise
pub type VutexPostFn = unsafe extern "C" fn(*mut u32, u32, c_int) -> c_int;
/// `sem_init(sem, pshared, value)`
pub type SemInitFn = unsafe extern "C" fn(*mut libc::sem_t, c_int, c_uint) -> c_int;
/// `sem_post` / `sem_wait` / `sem_destroy`
pub type SemOpFn = unsafe extern "C" fn(*mut libc::sem_t) -> c_int;
/// `sem_reltimedwait_np(sem, relative_timeout)`
pub type SemRelWaitFn = unsafe extern "C" fn(*mut libc::sem_t, *const libc::timespec) -> c_int;
/// `vprocExitModeSet(mode)`
pub type ExitModeFn = unsafe extern "C" fn(c_int) -> c_int;
/// `getrandom(buf, len, flags)`
pub type GetRandomFn = unsafe extern "C" fn(*mut c_void, libc::size_t, c_uint) -> libc::ssize_t;
/// `posix_spawnattr_setwd(attr, dir)`
pub type SpawnAttrSetwdFn = unsafe extern "C" fn(*mut libc::posix_spawnattr_t, *const c_char) -> c_int;
/// `posix_spawn_file_actions_addchdir_np(actions, dir)`
pub type SpawnAddChdirFn =
    unsafe extern "C" fn(*mut libc::posix_spawn_file_actions_t, *const c_char) -> c_int;

/// How the child's working directory is set during spawn.
#[derive(Clone, Copy)]
pub enum SpawnChdir {
    /// Native spawn attribute carrying the directory
    Attr(SpawnAttrSetwdFn),
    /// File action executed in the child before exec
    Action(SpawnAddChdirFn),
}

/// Where an entry point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Resolved from the process or a native library
    Native,
    /// Implemented by this crate
    Fallback,
    /// Not available at all
    Missing,
}

/// Table of bound native entry points.
pub struct NativeApi {
    /// Vutex pend
    pub vutex_pend: VutexPendFn,
    /// Vutex post with flags
    pub vutex_post: VutexPostFn,
    /// Semaphore init
    pub sem_init: SemInitFn,
    /// Semaphore post
    pub sem_post: SemOpFn,
    /// Semaphore blocking wait
    pub sem_wait: SemOpFn,
    /// Semaphore wait with a relative timeout
    pub sem_reltimedwait: SemRelWaitFn,
    /// Semaphore destroy
    pub sem_destroy: SemOpFn,
    /// Process exit-mode setter
    pub exit_mode_set: Option<ExitModeFn>,
    /// Secure random source
    pub getrandom: Option<GetRandomFn>,
    /// Spawn working-directory setter
    pub spawn_chdir: Option<SpawnChdir>,

    report: Vec<(&'static str, Source)>,
    _libraries: Vec<Library>,
}

static NATIVE: OnceCell<NativeApi> = OnceCell::new();

/// The process-wide binding table, bound with the default library list on
/// first use if [`crate::init`] has not run.
pub fn api() -> &'static NativeApi {
    NATIVE.get_or_init(|| NativeApi::bind(&crate::config::OsConfig::default().native_libraries))
}

/// Bind the process-wide table with an explicit library list.
///
/// Returns the already-bound table if binding happened earlier.
pub(crate) fn bind_global(libraries: &[String]) -> &'static NativeApi {
    NATIVE.get_or_init(|| NativeApi::bind(libraries))
}

impl NativeApi {
    /// Resolve every entry point, opening `libraries` as additional sources.
    pub fn bind(libraries: &[String]) -> Self {
        let libs: Vec<Library> = libraries
            .iter()
            .filter_map(|name| match Library::open(name) {
                Ok(lib) => Some(lib),
                Err(e) => {
                    log::debug!("native library unavailable: {}", e);
                    None
                }
            })
            .collect();
        let resolver = Resolver { libs: &libs };
        let mut report = Vec::new();

        let vutex_pend = resolver.with_fallback(
            &mut report,
            "API_VutexPend",
            host::vutex_pend as VutexPendFn,
        );
        let vutex_post = resolver.with_fallback(
            &mut report,
            "API_VutexPostEx",
            host::vutex_post as VutexPostFn,
        );
        let sem_init = resolver.with_fallback(&mut report, "sem_init", libc::sem_init as SemInitFn);
        let sem_post = resolver.with_fallback(&mut report, "sem_post", libc::sem_post as SemOpFn);
        let sem_wait = resolver.with_fallback(&mut report, "sem_wait", libc::sem_wait as SemOpFn);
        let sem_destroy =
            resolver.with_fallback(&mut report, "sem_destroy", libc::sem_destroy as SemOpFn);
        let sem_reltimedwait = resolver.with_fallback(
            &mut report,
            "sem_reltimedwait_np",
            host::sem_reltimedwait as SemRelWaitFn,
        );
        let exit_mode_set: Option<ExitModeFn> = resolver.optional(&mut report, "vprocExitModeSet");
        let getrandom: Option<GetRandomFn> = resolver.optional(&mut report, "getrandom");

        let spawn_chdir = match resolver.optional::<SpawnAttrSetwdFn>(&mut report, "posix_spawnattr_setwd") {
            Some(f) => Some(SpawnChdir::Attr(f)),
            None => resolver
                .optional::<SpawnAddChdirFn>(&mut report, "posix_spawn_file_actions_addchdir_np")
                .map(SpawnChdir::Action),
        };

        for (name, source) in &report {
            log::debug!("bound {} ({:?})", name, source);
        }

        NativeApi {
            vutex_pend,
            vutex_post,
            sem_init,
            sem_post,
            sem_wait,
            sem_reltimedwait,
            sem_destroy,
            exit_mode_set,
            getrandom,
            spawn_chdir,
            report,
            _libraries: libs,
        }
    }

    /// Source of each bound entry, in binding order.
    pub fn report(&self) -> &[(&'static str, Source)] {
        &self.report
    }

    /// Source of a single entry by native symbol name.
    pub fn source_of(&self, name: &str) -> Source {
        self.report
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
            .unwrap_or(Source::Missing)
    }
}

struct Resolver<'a> {
    libs: &'a [Library],
}

impl Resolver<'_> {
    fn lookup<T: Copy>(&self, name: &str) -> Option<T> {
        // SAFETY: each call site names a symbol whose C signature matches T
        unsafe {
            if let Some(f) = lookup_default::<T>(name) {
                return Some(f);
            }
            self.libs.iter().find_map(|lib| lib.get::<T>(name).ok())
        }
    }

    fn with_fallback<T: Copy>(
        &self,
        report: &mut Vec<(&'static str, Source)>,
        name: &'static str,
        fallback: T,
    ) -> T {
        match self.lookup(name) {
            Some(f) => {
                report.push((name, Source::Native));
                f
            }
            None => {
                report.push((name, Source::Fallback));
                fallback
            }
        }
    }

    fn optional<T: Copy>(
        &self,
        report: &mut Vec<(&'static str, Source)>,
        name: &'static str,
    ) -> Option<T> {
        let found = self.lookup(name);
        report.push((name, if found.is_some() { Source::Native } else { Source::Missing }));
        found
    }
}

/// Look a symbol up among everything already loaded into the process.
///
/// # Safety
///
/// `T` must be a function pointer type matching the symbol's signature.
unsafe fn lookup_default<T: Copy>(name: &str) -> Option<T> {
    debug_assert_eq!(std::mem::size_of::<T>(), std::mem::size_of::<*mut c_void>());
    let c_name = CString::new(name).ok()?;
    let symbol = libc::dlsym(libc::RTLD_DEFAULT, c_name.as_ptr());
    if symbol.is_null() {
        None
    } else {
        Some(std::mem::transmute_copy(&symbol))
    }
}

/// A shared object opened for symbol lookup. Kept open for the life of the
/// binding table so resolved pointers stay valid.
struct Library {
    handle: *mut c_void,
    path: String,
}

impl Library {
    fn open(path: &str) -> Result<Self> {
        let c_path = CString::new(path).map_err(|_| OsError::InteriorNul("library path"))?;

        // SAFETY: c_path is a valid NUL-terminated string
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(OsError::Binding(format!("{}: {}", path, dl_error())));
        }

        Ok(Library {
            handle,
            path: path.to_string(),
        })
    }

    /// # Safety
    ///
    /// `T` must be a function pointer type matching the symbol's signature.
    unsafe fn get<T: Copy>(&self, name: &str) -> Result<T> {
        let c_name = CString::new(name).map_err(|_| OsError::InteriorNul("symbol name"))?;

        // Clear any stale error first
        libc::dlerror();
        let symbol = libc::dlsym(self.handle, c_name.as_ptr());
        if symbol.is_null() {
            return Err(OsError::Binding(format!(
                "{} not found in {}: {}",
                name,
                self.path,
                dl_error()
            )));
        }

        Ok(std::mem::transmute_copy(&symbol))
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        // SAFETY: handle came from a successful dlopen
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

// SAFETY: dlopen handles may be used from any thread
unsafe impl Send for Library {}
unsafe impl Sync for Library {}

fn dl_error() -> String {
    // SAFETY: dlerror returns NULL or a valid C string owned by libc
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            "unknown error".to_string()
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Host implementations for entry points the target provides natively.
mod host {
    use super::*;

    const BUCKETS: usize = 64;

    struct Bucket {
        lock: Mutex<()>,
        cond: Condvar,
    }

    static TABLE: once_cell::sync::Lazy<Vec<Bucket>> = once_cell::sync::Lazy::new(|| {
        (0..BUCKETS)
            .map(|_| Bucket {
                lock: Mutex::new(()),
                cond: Condvar::new(),
            })
            .collect()
    });

    fn bucket(addr: *mut u32) -> &'static Bucket {
        let key = (addr as usize >> 2).wrapping_mul(0x9E37_79B9_7F4A_7C15u64 as usize);
        &TABLE[key % BUCKETS]
    }

    /// Address-keyed wait: sleeps while `*addr == expected`.
    ///
    /// Waiters re-check the word under the bucket lock and posters take the
    /// same lock before notifying, so a post that follows a store to the
    /// word cannot slip between a waiter's check and its sleep.
    pub(super) unsafe extern "C" fn vutex_pend(addr: *mut u32, expected: u32, timeout_ms: c_ulong) -> c_int {
        let word = &*(addr as *const std::sync::atomic::AtomicU32);
        let b = bucket(addr);
        let mut guard = b.lock.lock();
        if word.load(std::sync::atomic::Ordering::Acquire) != expected {
            return libc::EAGAIN;
        }
        if timeout_ms == VUTEX_WAIT_INFINITE {
            b.cond.wait(&mut guard);
            0
        } else if b
            .cond
            .wait_for(&mut guard, Duration::from_millis(timeout_ms as u64))
            .timed_out()
        {
            libc::ETIMEDOUT
        } else {
            0
        }
    }

    /// Stores `value` unless `VUTEX_DONTSET`, then wakes the bucket.
    pub(super) unsafe extern "C" fn vutex_post(addr: *mut u32, value: u32, flags: c_int) -> c_int {
        let b = bucket(addr);
        let _guard = b.lock.lock();
        if flags & VUTEX_DONTSET == 0 {
            let word = &*(addr as *const std::sync::atomic::AtomicU32);
            word.store(value, std::sync::atomic::Ordering::Release);
        }
        // Buckets are shared between addresses; waking everyone keeps a
        // neighbour's waiter from absorbing this wake.
        b.cond.notify_all();
        0
    }

    /// Relative timed wait expressed as an absolute realtime deadline.
    pub(super) unsafe extern "C" fn sem_reltimedwait(sem: *mut libc::sem_t, rel: *const libc::timespec) -> c_int {
        let mut now: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        let rel = &*rel;
        let mut deadline = libc::timespec {
            tv_sec: now.tv_sec + rel.tv_sec,
            tv_nsec: now.tv_nsec + rel.tv_nsec,
        };
        if deadline.tv_nsec >= 1_000_000_000 {
            deadline.tv_sec += 1;
            deadline.tv_nsec -= 1_000_000_000;
        }
        libc::sem_timedwait(sem, &deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_entries_resolve_natively() {
        let api = NativeApi::bind(&[]);
        assert_eq!(api.source_of("sem_init"), Source::Native);
        assert_eq!(api.source_of("sem_post"), Source::Native);
    }

    #[test]
    fn test_missing_library_is_skipped() {
        let api = NativeApi::bind(&["/nonexistent/libvpmpdm.so".to_string()]);
        assert_ne!(api.source_of("API_VutexPend"), Source::Missing);
        assert_eq!(api.source_of("no_such_entry"), Source::Missing);
    }

    #[test]
    fn test_library_not_found() {
        match Library::open("/nonexistent/library.so") {
            Err(OsError::Binding(msg)) => assert!(msg.contains("/nonexistent/library.so")),
            _ => panic!("Expected Binding error"),
        }
    }

    #[test]
    fn test_host_vutex_mismatch_returns_immediately() {
        let api = NativeApi::bind(&[]);
        let mut word = 5u32;
        let rc = unsafe { (api.vutex_pend)(&mut word, 4, VUTEX_WAIT_INFINITE) };
        assert_eq!(rc, libc::EAGAIN);
    }

    #[test]
    fn test_host_vutex_post_sets_value() {
        let api = NativeApi::bind(&[]);
        let mut word = 0u32;
        unsafe { (api.vutex_post)(&mut word, 7, 0) };
        assert_eq!(word, 7);
        unsafe { (api.vutex_post)(&mut word, 9, VUTEX_DONTSET) };
        assert_eq!(word, 7);
    }
}
