//! Environment configuration.

use std::time::Duration;

use tracing::warn;

/// Environment variable overriding [`EnvironmentConfig::preemption_period`],
/// in milliseconds.
pub const PREEMPTION_MS_ENV: &str = "VM_PREEMPTION_MS";

/// Environment variable overriding [`EnvironmentConfig::reactor_threads`].
pub const REACTOR_THREADS_ENV: &str = "VM_REACTOR_THREADS";

/// Default preemption period.
pub const DEFAULT_PREEMPTION_PERIOD: Duration = Duration::from_millis(4);

/// Default number of reactor worker threads.
pub const DEFAULT_REACTOR_THREADS: usize = 2;

/// Configuration shared by every engine of an [`Environment`](crate::Environment).
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// How often the running lightweight thread is asked to yield.
    pub preemption_period: Duration,
    /// Worker threads of the shared I/O reactor.
    pub reactor_threads: usize,
    /// Prefix for engine and reactor thread names.
    pub thread_name_prefix: String,
}

impl EnvironmentConfig {
    /// Build the default configuration, then apply overrides from
    /// [`PREEMPTION_MS_ENV`] and [`REACTOR_THREADS_ENV`]. Unparseable
    /// values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = read_env::<u64>(PREEMPTION_MS_ENV).filter(|ms| *ms > 0) {
            config.preemption_period = Duration::from_millis(ms);
        }
        if let Some(threads) = read_env::<usize>(REACTOR_THREADS_ENV).filter(|n| *n > 0) {
            config.reactor_threads = threads;
        }
        config
    }

    /// Override the preemption period (at least one millisecond).
    #[must_use]
    pub fn with_preemption_period(mut self, period: Duration) -> Self {
        self.preemption_period = period.max(Duration::from_millis(1));
        self
    }

    /// Override the number of reactor worker threads.
    #[must_use]
    pub fn with_reactor_threads(mut self, threads: usize) -> Self {
        self.reactor_threads = threads.max(1);
        self
    }

    /// Override the thread name prefix.
    #[must_use]
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            preemption_period: DEFAULT_PREEMPTION_PERIOD,
            reactor_threads: DEFAULT_REACTOR_THREADS,
            thread_name_prefix: "vm".to_string(),
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(variable = name, value = raw, "ignoring unparseable setting");
            None
        }
    }
}
