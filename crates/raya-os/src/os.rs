//! Process-wide startup and platform queries

use crate::binding::{self, VPROC_EXIT_FORCE};
use crate::config::OsConfig;
use crate::error::{OsError, Result};
use once_cell::sync::{Lazy, OnceCell};
use std::path::PathBuf;

/// Facts about the machine queried once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Online processors
    pub ncpu: usize,
    /// Page size in bytes
    pub page_size: usize,
}

impl Platform {
    fn query() -> Self {
        // SAFETY: sysconf has no preconditions
        let (ncpu, page) = unsafe {
            (
                libc::sysconf(libc::_SC_NPROCESSORS_ONLN),
                libc::sysconf(libc::_SC_PAGESIZE),
            )
        };
        Platform {
            ncpu: if ncpu > 0 { ncpu as usize } else { 1 },
            page_size: if page > 0 { page as usize } else { 4096 },
        }
    }
}

static CONFIG: OnceCell<OsConfig> = OnceCell::new();
static DEFAULT_CONFIG: Lazy<OsConfig> = Lazy::new(OsConfig::default);
static PLATFORM: OnceCell<Platform> = OnceCell::new();

/// One-time startup: stores `config`, binds the native entry points and
/// switches the process to forced exit when the target supports it.
///
/// Later calls change nothing and return the same platform.
pub fn init(config: OsConfig) -> &'static Platform {
    let mut first = false;
    let config = CONFIG.get_or_init(|| {
        first = true;
        config.normalized()
    });
    let platform = platform();
    if !first {
        return platform;
    }

    let api = binding::bind_global(&config.native_libraries);
    if let Some(set_exit_mode) = api.exit_mode_set {
        // SAFETY: bound native entry taking a mode constant
        if unsafe { set_exit_mode(VPROC_EXIT_FORCE) } != 0 {
            log::warn!("could not switch the process to forced exit");
        }
    }
    log::debug!(
        "os layer ready: {} cpus, page size {}",
        platform.ncpu,
        platform.page_size
    );
    platform
}

/// Configuration passed to [`init`], or the defaults before it runs
pub fn config() -> &'static OsConfig {
    CONFIG.get().unwrap_or(&DEFAULT_CONFIG)
}

/// Processor count and page size
pub fn platform() -> &'static Platform {
    PLATFORM.get_or_init(Platform::query)
}

/// Path of the running executable. A `" (deleted)"` marker left by the
/// kernel for a removed binary is stripped.
pub fn executable_path() -> Result<PathBuf> {
    let link = std::fs::read_link(format!("/proc/{}/exe", std::process::id()))?;
    let text = link.to_string_lossy();
    match text.strip_suffix(" (deleted)") {
        Some(stripped) => Ok(PathBuf::from(stripped)),
        None => Ok(link),
    }
}

/// Monotonic nanoseconds, standing in for a CPU tick counter
pub fn cputicks() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-parameter
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Give up the processor
pub fn osyield() {
    // SAFETY: no preconditions
    unsafe {
        libc::sched_yield();
    }
}

/// One loaded module's address range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleMapping {
    /// First address
    pub start: u64,
    /// One past the last address
    pub end: u64,
    /// Module name as listed
    pub name: String,
}

/// Parse a module listing:
///
/// ```text
/// NAME HANDLE TYPE GLB BASE SIZE SYMCNT
/// app 045c5e90 USER YES 100040000 35acf0 0
/// ```
///
/// Lines whose base or size is not hex (the header, trailers) are skipped.
pub fn parse_modules(text: &str) -> Vec<ModuleMapping> {
    text.lines()
        .filter_map(|line| {
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.len() < 6 {
                return None;
            }
            let start = u64::from_str_radix(f[4], 16).ok()?;
            let size = u64::from_str_radix(f[5], 16).ok()?;
            Some(ModuleMapping {
                start,
                end: start.saturating_add(size),
                name: f[0].to_string(),
            })
        })
        .collect()
}

/// Modules of this process, with the executable's short name widened to
/// its full path
pub fn module_mappings() -> Result<Vec<ModuleMapping>> {
    let text = std::fs::read_to_string(format!("/proc/{}/modules", std::process::id()))?;
    let mut modules = parse_modules(&text);
    if let Ok(exe) = executable_path() {
        let exe = exe.to_string_lossy().into_owned();
        for m in modules.iter_mut().filter(|m| exe.ends_with(m.name.as_str())) {
            m.name = exe.clone();
        }
    }
    Ok(modules)
}

/// Address range of the main executable: the first listed module.
pub fn main_module_mapping() -> Result<ModuleMapping> {
    let text = std::fs::read_to_string(format!("/proc/{}/modules", std::process::id()))?;
    parse_modules(&text)
        .into_iter()
        .next()
        .ok_or_else(|| OsError::from_errno("modules", libc::ENOENT))
}
