//! The default diagnostic sources: CPU profile, heap snapshot, host metadata
//! and a stack dump of every registered thread.
//!
//! Stack-based probes only see threads that registered themselves with
//! [`register_thread`] (or [`register_thread_guard`]), typically from a tokio
//! runtime's `on_thread_start` / `on_thread_stop` hooks.

use std::error::Error;
use std::fmt;
use std::time::Duration;

use dossier::{ArchiveOptions, RegisterError, Registry};

#[cfg(unix)]
mod cpu;
#[cfg(unix)]
mod heap;
#[cfg(unix)]
mod host;
#[cfg(unix)]
mod rusage;
#[cfg(unix)]
mod stacks;
#[cfg(unix)]
mod threads;

#[cfg(unix)]
pub use cpu::CpuProfileSource;
#[cfg(unix)]
pub use heap::{HeapSource, capture_heap_profile};
#[cfg(unix)]
pub use host::{HostSource, capture_host_info};
#[cfg(unix)]
pub use stacks::StackDumpSource;
#[cfg(unix)]
pub use threads::{
    ThreadGuard, deregister_thread, register_thread, register_thread_guard,
    registered_thread_names,
};

pub const CPU_SOURCE: &str = "cpuSource";
pub const HEAP_SOURCE: &str = "heapSource";
pub const HOST_SOURCE: &str = "hostSource";
pub const THREAD_DUMP_SOURCE: &str = "goroutineProfile";

/// Names registered by [`default_source_set`].
pub const DEFAULT_SOURCE_NAMES: [&str; 4] =
    [CPU_SOURCE, HEAP_SOURCE, HOST_SOURCE, THREAD_DUMP_SOURCE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Pause between sampling sweeps during a CPU profile.
    pub sample_interval: Duration,
    /// Upper bound on sweeps in one CPU profile. Long windows space their
    /// sweeps out instead of signaling threads more often.
    pub max_samples: u32,
    /// How long one sweep waits for signaled threads to report a backtrace.
    pub sweep_timeout: Duration,
    pub archive: ArchiveOptions,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(10),
            max_samples: 100,
            sweep_timeout: Duration::from_millis(100),
            archive: ArchiveOptions::default(),
        }
    }
}

#[derive(Debug)]
pub enum ConstructionError {
    UnsupportedPlatform { target_os: &'static str },
    SignalHandler(std::io::Error),
    Register(RegisterError),
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedPlatform { target_os } => write!(
                f,
                "default diagnostic sources need signal-based stack capture, unavailable on {target_os}"
            ),
            Self::SignalHandler(e) => write!(f, "failed to install SIGPROF handler: {e}"),
            Self::Register(e) => write!(f, "failed to register default source: {e}"),
        }
    }
}

impl Error for ConstructionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UnsupportedPlatform { .. } => None,
            Self::SignalHandler(e) => Some(e),
            Self::Register(e) => Some(e),
        }
    }
}

impl From<RegisterError> for ConstructionError {
    fn from(value: RegisterError) -> Self {
        Self::Register(value)
    }
}

/// A registry holding the four standard sources.
///
/// `profile_duration` is the CPU profile window, so every build of the
/// returned registry takes at least that long.
#[cfg(unix)]
pub fn default_source_set(
    profile_duration: Duration,
    options: ProbeOptions,
) -> Result<Registry, ConstructionError> {
    threads::install_sigprof_handler().map_err(ConstructionError::SignalHandler)?;
    host::mark_started();

    let registry = Registry::with_options(options.archive);
    registry.register_source(
        CPU_SOURCE,
        CpuProfileSource {
            duration: profile_duration,
            sample_interval: options.sample_interval,
            max_samples: options.max_samples,
            sweep_timeout: options.sweep_timeout,
        },
    )?;
    registry.register_source(HEAP_SOURCE, HeapSource)?;
    registry.register_source(HOST_SOURCE, HostSource)?;
    registry.register_source(
        THREAD_DUMP_SOURCE,
        StackDumpSource {
            sweep_timeout: options.sweep_timeout,
        },
    )?;
    tracing::debug!(
        profile_ms = profile_duration.as_millis() as u64,
        "default diagnostic sources registered"
    );
    Ok(registry)
}

#[cfg(not(unix))]
pub fn default_source_set(
    _profile_duration: Duration,
    _options: ProbeOptions,
) -> Result<Registry, ConstructionError> {
    Err(ConstructionError::UnsupportedPlatform {
        target_os: std::env::consts::OS,
    })
}
