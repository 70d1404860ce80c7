//! Child process creation through `posix_spawn`
//!
//! Raw `fork` is never used: another thread may hold a lock at the moment
//! of the fork and the child would inherit it locked. Descriptor remapping
//! is expressed as spawn file actions instead.

use crate::binding::{self, SpawnChdir};
use crate::error::{OsError, Result};
use crate::signal::SignalSet;
use std::collections::{HashMap, HashSet};
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr;

/// Process-group directive for the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessGroup {
    /// Join process group `pgid`; 0 starts a new group led by the child
    Setpgid(libc::pid_t),
}

/// Everything needed to start one child.
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    /// Executable path (not searched in `PATH`)
    pub path: PathBuf,
    /// Argument vector, including `argv[0]`
    pub args: Vec<OsString>,
    /// Environment as `KEY=VALUE` entries
    pub env: Vec<OsString>,
    /// Working directory for the child
    pub dir: Option<PathBuf>,
    /// Descriptor table: entry `i` is the parent descriptor that becomes
    /// child descriptor `i`; `None` leaves the slot unset
    pub files: Vec<Option<RawFd>>,
    /// Process-group directive
    pub process_group: Option<ProcessGroup>,
}

impl SpawnRequest {
    /// A request for `path` with `argv[0]` set to the path
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        SpawnRequest {
            args: vec![path.clone().into_os_string()],
            path,
            ..Default::default()
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append an environment entry
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let mut entry = key.as_ref().to_os_string();
        entry.push("=");
        entry.push(value);
        self.env.push(entry);
        self
    }

    /// Set the working directory
    pub fn dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Make parent descriptor `parent` appear as child descriptor `child`
    pub fn fd(mut self, child: usize, parent: RawFd) -> Self {
        if self.files.len() <= child {
            self.files.resize(child + 1, None);
        }
        self.files[child] = Some(parent);
        self
    }

    /// Set the process-group directive
    pub fn process_group(mut self, group: ProcessGroup) -> Self {
        self.process_group = Some(group);
        self
    }
}

/// Reject tables where a dup onto some child slot would clobber a parent
/// descriptor another slot still has to read: if slot `i` takes parent `s`
/// and `s` is itself a child slot, that slot must map `s` onto itself.
pub fn validate_fd_map(files: &[Option<RawFd>]) -> Result<()> {
    for (target, parent) in files.iter().enumerate() {
        let Some(parent) = *parent else { continue };
        if parent < 0 {
            return Err(OsError::from_errno("spawn descriptor", libc::EBADF));
        }
        if let Some(Some(conflict)) = files.get(parent as usize) {
            if *conflict != parent {
                return Err(OsError::InvalidFdMap {
                    target: target as i32,
                    parent,
                    conflict: *conflict,
                });
            }
        }
    }
    Ok(())
}

/// A started child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildProcess {
    /// Process id
    pub pid: libc::pid_t,
}

impl ChildProcess {
    /// Block until the child changes state, reporting stops as well as exits.
    pub fn wait(&self) -> Result<WaitStatus> {
        let mut status = 0;
        loop {
            // SAFETY: status is a valid out pointer
            let rc = unsafe { libc::waitpid(self.pid, &mut status, libc::WUNTRACED) };
            if rc >= 0 {
                return Ok(WaitStatus::host(status));
            }
            let err = OsError::last("waitpid");
            if err.errno() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }
}

/// Start the child described by `req`.
pub fn spawn(req: &SpawnRequest) -> Result<ChildProcess> {
    validate_fd_map(&req.files)?;

    let path = c_string(req.path.as_os_str(), "spawn path")?;
    let args = req
        .args
        .iter()
        .map(|a| c_string(a, "spawn argument"))
        .collect::<Result<Vec<_>>>()?;
    let env = req
        .env
        .iter()
        .map(|e| c_string(e, "spawn environment"))
        .collect::<Result<Vec<_>>>()?;
    let dir = req
        .dir
        .as_ref()
        .map(|d| c_string(d.as_os_str(), "spawn directory"))
        .transpose()?;

    let mut attr = SpawnAttr::new()?;
    let mut actions = FileActions::new()?;

    let mut flags = libc::POSIX_SPAWN_SETSIGMASK as libc::c_short;
    attr.set_sigmask(&SignalSet::empty())?;

    if let Some(dir) = &dir {
        match binding::api().spawn_chdir {
            // SAFETY: attr/actions are initialized, dir is NUL-terminated
            Some(SpawnChdir::Attr(setwd)) => check("posix_spawnattr_setwd", unsafe {
                setwd(&mut attr.0, dir.as_ptr())
            })?,
            Some(SpawnChdir::Action(addchdir)) => check("posix_spawn_file_actions_addchdir", unsafe {
                addchdir(&mut actions.0, dir.as_ptr())
            })?,
            None => return Err(OsError::NotSupported("spawn working directory")),
        }
    }

    if let Some(ProcessGroup::Setpgid(pgid)) = req.process_group {
        // SAFETY: attr is initialized
        check("posix_spawnattr_setpgroup", unsafe {
            libc::posix_spawnattr_setpgroup(&mut attr.0, pgid)
        })?;
        flags |= libc::POSIX_SPAWN_SETPGROUP as libc::c_short;
    }
    // SAFETY: attr is initialized
    check("posix_spawnattr_setflags", unsafe {
        libc::posix_spawnattr_setflags(&mut attr.0, flags)
    })?;

    let mut saved = FdFlags::default();
    for parent in req.files.iter().flatten() {
        saved.clear_cloexec(*parent)?;
    }

    let mut closed = HashSet::new();
    for (child, parent) in req.files.iter().enumerate() {
        let Some(parent) = *parent else { continue };
        let child = child as RawFd;
        if parent == child {
            continue;
        }
        actions.add_dup2(parent, child)?;
    }
    for (child, parent) in req.files.iter().enumerate() {
        let Some(parent) = *parent else { continue };
        if parent == child as RawFd || !saved.was_cloexec(parent) {
            continue;
        }
        let identity = matches!(req.files.get(parent as usize), Some(Some(p)) if *p == parent);
        if !identity && closed.insert(parent) {
            actions.add_close(parent)?;
        }
    }

    let mut argv: Vec<*mut libc::c_char> = args.iter().map(|a| a.as_ptr() as *mut _).collect();
    argv.push(ptr::null_mut());
    let mut envp: Vec<*mut libc::c_char> = env.iter().map(|e| e.as_ptr() as *mut _).collect();
    envp.push(ptr::null_mut());

    let mut pid: libc::pid_t = 0;
    // SAFETY: every pointer refers to a live, NUL-terminated buffer and both
    // vectors are NULL-terminated
    let rc = unsafe {
        libc::posix_spawn(
            &mut pid,
            path.as_ptr(),
            &actions.0,
            &attr.0,
            argv.as_ptr(),
            envp.as_ptr(),
        )
    };

    drop(actions);
    drop(attr);
    drop(saved);

    if rc != 0 {
        return Err(OsError::from_errno("posix_spawn", rc));
    }
    log::debug!("spawned {} as pid {}", req.path.display(), pid);
    Ok(ChildProcess { pid })
}

fn c_string(s: &OsStr, what: &'static str) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| OsError::InteriorNul(what))
}

fn check(op: &'static str, rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(OsError::from_errno(op, rc))
    }
}

struct SpawnAttr(libc::posix_spawnattr_t);

impl SpawnAttr {
    fn new() -> Result<Self> {
        // SAFETY: posix_spawnattr_init initializes the zeroed storage
        let mut attr: libc::posix_spawnattr_t = unsafe { std::mem::zeroed() };
        check("posix_spawnattr_init", unsafe { libc::posix_spawnattr_init(&mut attr) })?;
        Ok(SpawnAttr(attr))
    }

    fn set_sigmask(&mut self, mask: &SignalSet) -> Result<()> {
        let native = mask.to_native();
        // SAFETY: self.0 is initialized
        check("posix_spawnattr_setsigmask", unsafe {
            libc::posix_spawnattr_setsigmask(&mut self.0, &native)
        })
    }
}

impl Drop for SpawnAttr {
    fn drop(&mut self) {
        // SAFETY: initialized in new()
        unsafe {
            libc::posix_spawnattr_destroy(&mut self.0);
        }
    }
}

struct FileActions(libc::posix_spawn_file_actions_t);

impl FileActions {
    fn new() -> Result<Self> {
        // SAFETY: init fills in the zeroed storage
        let mut actions: libc::posix_spawn_file_actions_t = unsafe { std::mem::zeroed() };
        check("posix_spawn_file_actions_init", unsafe {
            libc::posix_spawn_file_actions_init(&mut actions)
        })?;
        Ok(FileActions(actions))
    }

    fn add_dup2(&mut self, from: RawFd, to: RawFd) -> Result<()> {
        // SAFETY: self.0 is initialized
        check("posix_spawn_file_actions_adddup2", unsafe {
            libc::posix_spawn_file_actions_adddup2(&mut self.0, from, to)
        })
    }

    fn add_close(&mut self, fd: RawFd) -> Result<()> {
        // SAFETY: self.0 is initialized
        check("posix_spawn_file_actions_addclose", unsafe {
            libc::posix_spawn_file_actions_addclose(&mut self.0, fd)
        })
    }
}

impl Drop for FileActions {
    fn drop(&mut self) {
        // SAFETY: initialized in new()
        unsafe {
            libc::posix_spawn_file_actions_destroy(&mut self.0);
        }
    }
}

/// Original descriptor flags, restored when dropped.
#[derive(Default)]
struct FdFlags {
    saved: HashMap<RawFd, libc::c_int>,
}

impl FdFlags {
    fn clear_cloexec(&mut self, fd: RawFd) -> Result<()> {
        if self.saved.contains_key(&fd) {
            return Ok(());
        }
        // SAFETY: fcntl on an arbitrary descriptor only reports EBADF
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(OsError::last("fcntl"));
        }
        self.saved.insert(fd, flags);
        // SAFETY: as above
        unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
        Ok(())
    }

    fn was_cloexec(&self, fd: RawFd) -> bool {
        self.saved
            .get(&fd)
            .is_some_and(|flags| flags & libc::FD_CLOEXEC != 0)
    }
}

impl Drop for FdFlags {
    fn drop(&mut self) {
        for (&fd, &flags) in &self.saved {
            // SAFETY: restoring the flags read from this descriptor
            unsafe { libc::fcntl(fd, libc::F_SETFD, flags) };
        }
    }
}

/// Which bit layout a raw wait status uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusLayout {
    /// The host's `W*` macros
    Host,
    /// Exit status in bits 0-7, terminating signal in 8-15, `CLD_*` code
    /// in 16-23
    Target,
}

const TERM_SIG_MASK: u32 = 0xFF00;
const TERM_SIG_SHIFT: u32 = 8;
const STOP_SIG_MASK: u32 = 0xFF_0000;
const STOP_SIG_SHIFT: u32 = 16;

/// Target `CLD_*` codes, already shifted into the stop field
pub mod cld {
    /// Exited normally
    pub const EXITED: u32 = 1 << super::STOP_SIG_SHIFT;
    /// Killed by a signal
    pub const KILLED: u32 = 2 << super::STOP_SIG_SHIFT;
    /// Killed, with a core dump
    pub const DUMPED: u32 = 3 << super::STOP_SIG_SHIFT;
    /// Traced child trapped
    pub const TRAPPED: u32 = 4 << super::STOP_SIG_SHIFT;
    /// Stopped
    pub const STOPPED: u32 = 5 << super::STOP_SIG_SHIFT;
    /// Continued
    pub const CONTINUED: u32 = 6 << super::STOP_SIG_SHIFT;
}

/// Decoded child status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitStatus {
    raw: i32,
    layout: StatusLayout,
}

impl WaitStatus {
    /// Status in the host layout
    pub fn host(raw: i32) -> Self {
        WaitStatus {
            raw,
            layout: StatusLayout::Host,
        }
    }

    /// Status in the target layout
    pub fn target(raw: i32) -> Self {
        WaitStatus {
            raw,
            layout: StatusLayout::Target,
        }
    }

    /// Raw value
    pub fn raw(&self) -> i32 {
        self.raw
    }

    fn bits(&self) -> u32 {
        self.raw as u32
    }

    /// The child terminated. In the target layout a killed child also
    /// counts, matching how that system reports it.
    pub fn exited(&self) -> bool {
        match self.layout {
            StatusLayout::Host => libc::WIFEXITED(self.raw),
            StatusLayout::Target => matches!(
                self.bits() & STOP_SIG_MASK,
                0 | cld::EXITED | cld::KILLED | cld::DUMPED
            ),
        }
    }

    /// Exit status, if the child exited
    pub fn exit_status(&self) -> Option<i32> {
        if !self.exited() {
            return None;
        }
        match self.layout {
            StatusLayout::Host => Some(libc::WEXITSTATUS(self.raw)),
            StatusLayout::Target => Some((self.bits() & 0xFF) as i32),
        }
    }

    /// The child was terminated by a signal
    pub fn signaled(&self) -> bool {
        match self.layout {
            StatusLayout::Host => libc::WIFSIGNALED(self.raw),
            StatusLayout::Target => self.bits() & TERM_SIG_MASK != 0,
        }
    }

    /// Terminating signal number
    pub fn signal(&self) -> Option<i32> {
        if !self.signaled() {
            return None;
        }
        match self.layout {
            StatusLayout::Host => Some(libc::WTERMSIG(self.raw)),
            StatusLayout::Target => Some(((self.bits() & TERM_SIG_MASK) >> TERM_SIG_SHIFT) as i32),
        }
    }

    /// A core file was written
    pub fn core_dumped(&self) -> bool {
        match self.layout {
            StatusLayout::Host => libc::WIFSIGNALED(self.raw) && libc::WCOREDUMP(self.raw),
            StatusLayout::Target => self.bits() & STOP_SIG_MASK == cld::DUMPED,
        }
    }

    /// The child is stopped
    pub fn stopped(&self) -> bool {
        match self.layout {
            StatusLayout::Host => libc::WIFSTOPPED(self.raw),
            StatusLayout::Target => self.bits() & STOP_SIG_MASK == cld::STOPPED,
        }
    }

    /// The child was resumed
    pub fn continued(&self) -> bool {
        match self.layout {
            StatusLayout::Host => libc::WIFCONTINUED(self.raw),
            StatusLayout::Target => self.bits() & STOP_SIG_MASK == cld::CONTINUED,
        }
    }

    /// Signal that stopped or resumed the child
    pub fn stop_signal(&self) -> Option<i32> {
        match self.layout {
            StatusLayout::Host if self.stopped() => Some(libc::WSTOPSIG(self.raw)),
            StatusLayout::Host => None,
            StatusLayout::Target if self.stopped() => Some(libc::SIGSTOP),
            StatusLayout::Target if self.continued() => Some(libc::SIGCONT),
            StatusLayout::Target => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_identity_and_high_sources() {
        let files = vec![Some(0), Some(4), Some(2), Some(3)];
        assert!(validate_fd_map(&files).is_ok());
    }

    #[test]
    fn test_validate_rejects_overlapping_table() {
        // child 0 takes parent 1, but child slot 1 is being replaced by 2
        let files = vec![Some(1), Some(2), Some(2)];
        match validate_fd_map(&files) {
            Err(OsError::InvalidFdMap {
                target,
                parent,
                conflict,
            }) => {
                assert_eq!((target, parent, conflict), (0, 1, 2));
            }
            other => panic!("Expected InvalidFdMap, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_ignores_unset_slots() {
        let files = vec![None, Some(0), None];
        assert!(validate_fd_map(&files).is_ok());
    }

    #[test]
    fn test_builder_fills_gaps() {
        let req = SpawnRequest::new("/bin/true").fd(3, 7).arg("x");
        assert_eq!(req.files, vec![None, None, None, Some(7)]);
        assert_eq!(req.args.len(), 2);
    }

    #[test]
    fn test_target_layout_decoding() {
        let exited = WaitStatus::target((cld::EXITED | 3) as i32);
        assert!(exited.exited());
        assert_eq!(exited.exit_status(), Some(3));
        assert!(!exited.signaled());

        let killed = WaitStatus::target((cld::KILLED | (9 << TERM_SIG_SHIFT)) as i32);
        assert!(killed.signaled());
        assert_eq!(killed.signal(), Some(9));

        let dumped = WaitStatus::target((cld::DUMPED | (11 << TERM_SIG_SHIFT)) as i32);
        assert!(dumped.core_dumped());

        let stopped = WaitStatus::target(cld::STOPPED as i32);
        assert!(stopped.stopped());
        assert!(!stopped.exited());
        assert_eq!(stopped.stop_signal(), Some(libc::SIGSTOP));
        assert_eq!(WaitStatus::target(cld::CONTINUED as i32).stop_signal(), Some(libc::SIGCONT));
    }

    #[test]
    fn test_spawn_and_wait_exit_code() {
        let req = SpawnRequest::new("/bin/sh").arg("-c").arg("exit 5");
        let child = spawn(&req).unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.exit_status(), Some(5));
    }

    #[test]
    fn test_interior_nul_rejected() {
        let req = SpawnRequest::new("/bin/sh").arg("a\0b");
        assert!(matches!(spawn(&req), Err(OsError::InteriorNul(_))));
    }
}
