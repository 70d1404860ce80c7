//! Startup configuration for the OS layer

/// Whether the secure-random entry point is probed or assumed absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomSupport {
    /// Call the native entry point; cache "unsupported" on ENOSYS
    Probe,
    /// Never call it: every request reports not-supported
    Absent,
}

/// Configuration consumed by [`crate::init`].
#[derive(Debug, Clone)]
pub struct OsConfig {
    /// Attempts made when thread creation fails with EAGAIN
    pub thread_create_attempts: u32,

    /// Alternate signal stack size per worker thread, in bytes
    pub signal_stack_size: usize,

    /// getrandom availability policy
    pub random_support: RandomSupport,

    /// Shared objects searched for native entry points
    pub native_libraries: Vec<String>,

    /// Default capacity of multiplexer event buffers
    pub max_poll_events: usize,
}

/// Smallest alternate signal stack the target accepts.
pub const MIN_SIGNAL_STACK: usize = 2 * 1024;

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            thread_create_attempts: 20,
            signal_stack_size: 32 * 1024,
            random_support: RandomSupport::Probe,
            native_libraries: vec!["libvpmpdm.so".to_string(), "libfastlock.so".to_string()],
            max_poll_events: 128,
        }
    }
}

impl OsConfig {
    /// Defaults overridden by `RAYA_OS_*` environment variables.
    ///
    /// - `RAYA_OS_THREAD_ATTEMPTS`: thread creation attempts
    /// - `RAYA_OS_SIGSTACK`: signal stack size in bytes
    /// - `RAYA_OS_GETRANDOM`: `probe` or `absent`
    /// - `RAYA_OS_LIBS`: colon-separated library list
    /// - `RAYA_OS_POLL_EVENTS`: event buffer capacity
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = lookup("RAYA_OS_THREAD_ATTEMPTS") {
            match v.parse() {
                Ok(n) => config.thread_create_attempts = n,
                Err(_) => log::warn!("ignoring RAYA_OS_THREAD_ATTEMPTS={:?}", v),
            }
        }
        if let Some(v) = lookup("RAYA_OS_SIGSTACK") {
            match v.parse() {
                Ok(n) => config.signal_stack_size = n,
                Err(_) => log::warn!("ignoring RAYA_OS_SIGSTACK={:?}", v),
            }
        }
        if let Some(v) = lookup("RAYA_OS_GETRANDOM") {
            match v.as_str() {
                "probe" => config.random_support = RandomSupport::Probe,
                "absent" => config.random_support = RandomSupport::Absent,
                _ => log::warn!("ignoring RAYA_OS_GETRANDOM={:?}", v),
            }
        }
        if let Some(v) = lookup("RAYA_OS_LIBS") {
            config.native_libraries = v
                .split(':')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("RAYA_OS_POLL_EVENTS") {
            match v.parse() {
                Ok(n) if n > 0 => config.max_poll_events = n,
                _ => log::warn!("ignoring RAYA_OS_POLL_EVENTS={:?}", v),
            }
        }

        config.normalized()
    }

    /// Set the thread creation attempt bound
    pub fn with_thread_create_attempts(mut self, attempts: u32) -> Self {
        self.thread_create_attempts = attempts;
        self
    }

    /// Set the alternate signal stack size
    pub fn with_signal_stack_size(mut self, size: usize) -> Self {
        self.signal_stack_size = size;
        self.normalized()
    }

    /// Set the getrandom policy
    pub fn with_random_support(mut self, support: RandomSupport) -> Self {
        self.random_support = support;
        self
    }

    /// Set the default event buffer capacity (at least one)
    pub fn with_max_poll_events(mut self, events: usize) -> Self {
        self.max_poll_events = events.max(1);
        self
    }

    /// Replace the native library search list
    pub fn with_native_libraries<I, S>(mut self, libs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.native_libraries = libs.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.thread_create_attempts = self.thread_create_attempts.max(1);
        self.signal_stack_size = self.signal_stack_size.max(MIN_SIGNAL_STACK);
        self
    }
}
