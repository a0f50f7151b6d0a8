//! Payload types shared by the dossier HTTP surface and the default probes.

use std::time::{SystemTime, UNIX_EPOCH};

use facet::Facet;

/// Error body returned by the HTTP adapter.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub error: String,
}

/// Names of the sources currently registered, in registration order.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SourceList {
    pub sources: Vec<String>,
}

/// Static and slowly changing facts about the host and this process.
#[derive(Facet, Debug, Clone)]
pub struct HostInfo {
    pub hostname: String,
    /// Kernel name as reported by `uname` (e.g. "Linux", "Darwin").
    pub os: String,
    pub os_release: String,
    pub os_version: String,
    /// Architecture this binary was compiled for.
    pub arch: String,
    /// Hardware name as reported by `uname`.
    pub machine: String,
    pub logical_cpus: u32,
    pub page_size: u64,
    pub physical_memory_bytes: Option<u64>,
    pub pid: u32,
    pub executable: Option<String>,
    pub captured_at_ms: i64,
    /// Time since the probes were first initialized in this process.
    pub uptime_ms: u64,
    pub dossier_version: String,
}

/// Point-in-time memory usage of this process.
///
/// Fields sourced from `/proc/self/status` are `None` on platforms without
/// procfs.
#[derive(Facet, Debug, Clone, Default)]
pub struct HeapProfile {
    pub captured_at_ms: i64,
    pub resident_bytes: Option<u64>,
    pub peak_resident_bytes: Option<u64>,
    pub virtual_bytes: Option<u64>,
    pub data_bytes: Option<u64>,
    pub stack_bytes: Option<u64>,
    pub thread_count: Option<u32>,
    /// Maximum resident set size from `getrusage`, normalized to bytes.
    pub max_rss_bytes: u64,
    pub minor_faults: u64,
    pub major_faults: u64,
}

/// A single thread's stack trace, with sampling data for stuck detection.
#[derive(Facet, Debug, Clone)]
pub struct ThreadStackSnapshot {
    /// Name the thread registered under (e.g. "tokio-runtime-worker").
    pub name: String,
    /// Most recent captured backtrace. `None` if the thread never responded
    /// (possibly stuck in an uninterruptible syscall).
    pub backtrace: Option<String>,
    pub samples: u32,
    /// Number of samples where the thread responded with a backtrace.
    pub responded: u32,
    /// Number of samples where the top useful frame was identical to the
    /// previous sample. Values close to `samples` mean the thread sat in one
    /// place for the whole window.
    pub same_location_count: u32,
    /// Top useful frame that appeared most often across samples.
    pub dominant_frame: Option<String>,
    /// Hit count per top useful frame, most frequent first.
    pub frame_counts: Vec<FrameCount>,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct FrameCount {
    pub frame: String,
    pub hits: u32,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_list_serializes_as_object() {
        let list = SourceList {
            sources: vec!["cpuSource".to_string(), "heapSource".to_string()],
        };
        let json = facet_json::to_string(&list).expect("source list must encode");
        assert!(json.contains("\"sources\""));
        assert!(json.contains("cpuSource"));

        let decoded: SourceList = facet_json::from_str(&json).expect("source list must decode");
        assert_eq!(decoded, list);
    }

    #[test]
    fn now_ms_is_after_epoch() {
        assert!(now_ms() > 0);
    }
}
