use std::io::Write;

use dossier::{Source, SourceError};
use dossier_types::{HeapProfile, now_ms};

use crate::rusage::resource_usage;

/// Instantaneous memory snapshot of this process, written as JSON.
pub struct HeapSource;

impl Source for HeapSource {
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), SourceError> {
        let profile = capture_heap_profile()?;
        let json = facet_json::to_string_pretty(&profile)
            .map_err(|e| format!("encode heap profile: {e}"))?;
        sink.write_all(json.as_bytes())?;
        Ok(())
    }
}

pub fn capture_heap_profile() -> std::io::Result<HeapProfile> {
    let usage = resource_usage()?;
    let mut profile = HeapProfile {
        captured_at_ms: now_ms(),
        max_rss_bytes: usage.max_rss_bytes,
        minor_faults: usage.minor_faults,
        major_faults: usage.major_faults,
        ..HeapProfile::default()
    };
    fill_from_proc_status(&mut profile);
    Ok(profile)
}

#[cfg(target_os = "linux")]
fn fill_from_proc_status(profile: &mut HeapProfile) {
    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        apply_proc_status(profile, &status);
    }
}

#[cfg(not(target_os = "linux"))]
fn fill_from_proc_status(_profile: &mut HeapProfile) {}

/// Copy the memory fields of a `/proc/<pid>/status` document into `profile`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn apply_proc_status(profile: &mut HeapProfile, status: &str) {
    for line in status.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "VmRSS" => profile.resident_bytes = parse_kb(value),
            "VmHWM" => profile.peak_resident_bytes = parse_kb(value),
            "VmSize" => profile.virtual_bytes = parse_kb(value),
            "VmData" => profile.data_bytes = parse_kb(value),
            "VmStk" => profile.stack_bytes = parse_kb(value),
            "Threads" => profile.thread_count = value.trim().parse().ok(),
            _ => {}
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_kb(value: &str) -> Option<u64> {
    value
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "\
Name:\tdossier
VmPeak:\t  300000 kB
VmSize:\t  250000 kB
VmHWM:\t   12000 kB
VmRSS:\t   10000 kB
VmData:\t   40000 kB
VmStk:\t     132 kB
Threads:\t7
";

    #[test]
    fn parses_proc_status_memory_fields() {
        let mut profile = HeapProfile::default();
        apply_proc_status(&mut profile, STATUS);
        assert_eq!(profile.resident_bytes, Some(10_000 * 1024));
        assert_eq!(profile.peak_resident_bytes, Some(12_000 * 1024));
        assert_eq!(profile.virtual_bytes, Some(250_000 * 1024));
        assert_eq!(profile.data_bytes, Some(40_000 * 1024));
        assert_eq!(profile.stack_bytes, Some(132 * 1024));
        assert_eq!(profile.thread_count, Some(7));
    }

    #[test]
    fn heap_source_writes_json() {
        let mut out = Vec::new();
        HeapSource.write_to(&mut out).expect("heap source must write");
        let text = String::from_utf8(out).expect("json is utf-8");
        assert!(text.contains("\"max_rss_bytes\""));
        assert!(text.contains("\"captured_at_ms\""));
    }
}
