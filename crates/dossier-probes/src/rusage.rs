use std::io;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ResourceUsage {
    pub user_time: Duration,
    pub system_time: Duration,
    pub max_rss_bytes: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
}

/// `getrusage(RUSAGE_SELF)` for the whole process.
pub(crate) fn resource_usage() -> io::Result<ResourceUsage> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    let usage = unsafe { usage.assume_init() };

    Ok(ResourceUsage {
        user_time: timeval_to_duration(usage.ru_utime),
        system_time: timeval_to_duration(usage.ru_stime),
        max_rss_bytes: max_rss_to_bytes(usage.ru_maxrss),
        minor_faults: usage.ru_minflt.max(0) as u64,
        major_faults: usage.ru_majflt.max(0) as u64,
    })
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

// macOS reports ru_maxrss in bytes, everyone else in kilobytes.
#[cfg(target_os = "macos")]
fn max_rss_to_bytes(raw: libc::c_long) -> u64 {
    raw.max(0) as u64
}

#[cfg(not(target_os = "macos"))]
fn max_rss_to_bytes(raw: libc::c_long) -> u64 {
    (raw.max(0) as u64) * 1024
}
