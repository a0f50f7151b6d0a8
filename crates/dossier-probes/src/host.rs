use std::ffi::CStr;
use std::io::{self, Write};
use std::sync::OnceLock;
use std::time::Instant;

use dossier::{Source, SourceError};
use dossier_types::{HostInfo, now_ms};

/// Static and slowly changing host facts, written as JSON.
pub struct HostSource;

impl Source for HostSource {
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), SourceError> {
        let info = capture_host_info()?;
        let json = facet_json::to_string_pretty(&info)
            .map_err(|e| format!("encode host info: {e}"))?;
        sink.write_all(json.as_bytes())?;
        Ok(())
    }
}

static PROBES_STARTED: OnceLock<Instant> = OnceLock::new();

/// Start the uptime clock reported by [`HostInfo::uptime_ms`].
pub(crate) fn mark_started() {
    let _ = PROBES_STARTED.get_or_init(Instant::now);
}

pub fn capture_host_info() -> io::Result<HostInfo> {
    let uts = uname()?;
    let page_size = sysconf(libc::_SC_PAGESIZE).unwrap_or(0);

    Ok(HostInfo {
        hostname: field(&uts.nodename),
        os: field(&uts.sysname),
        os_release: field(&uts.release),
        os_version: field(&uts.version),
        arch: std::env::consts::ARCH.to_string(),
        machine: field(&uts.machine),
        logical_cpus: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        page_size,
        physical_memory_bytes: physical_memory(page_size),
        pid: std::process::id(),
        executable: std::env::current_exe()
            .ok()
            .map(|path| path.display().to_string()),
        captured_at_ms: now_ms(),
        uptime_ms: PROBES_STARTED
            .get_or_init(Instant::now)
            .elapsed()
            .as_millis()
            .min(u64::MAX as u128) as u64,
        dossier_version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn uname() -> io::Result<libc::utsname> {
    let mut uts = std::mem::MaybeUninit::<libc::utsname>::zeroed();
    if unsafe { libc::uname(uts.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { uts.assume_init() })
}

fn field(raw: &[libc::c_char]) -> String {
    // uname fields are NUL-terminated within their fixed-size buffers.
    if !raw.contains(&0) {
        return String::new();
    }
    unsafe { CStr::from_ptr(raw.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn sysconf(name: libc::c_int) -> Option<u64> {
    let value = unsafe { libc::sysconf(name) };
    (value > 0).then_some(value as u64)
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn physical_memory(page_size: u64) -> Option<u64> {
    sysconf(libc::_SC_PHYS_PAGES).map(|pages| pages.saturating_mul(page_size))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn physical_memory(_page_size: u64) -> Option<u64> {
    None
}
