use std::fmt::Write as _;
use std::io::Write;
use std::time::Duration;

use dossier::{Source, SourceError};

use crate::rusage::{ResourceUsage, resource_usage};
use crate::threads::{SampleReport, sample_threads};

/// Samples registered threads for a fixed window and writes a flat text
/// profile: process CPU time over the window plus top-frame hit counts per
/// thread.
pub struct CpuProfileSource {
    pub duration: Duration,
    /// Minimum pause between sweeps.
    pub sample_interval: Duration,
    /// Upper bound on sweeps per profile; the pause grows to fit the window.
    pub max_samples: u32,
    pub sweep_timeout: Duration,
}

impl Source for CpuProfileSource {
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), SourceError> {
        let before = resource_usage()?;
        let report = sample_threads(
            self.duration,
            self.sample_interval,
            self.max_samples,
            self.sweep_timeout,
        );
        let after = resource_usage()?;

        sink.write_all(render_profile(self, &report, &before, &after).as_bytes())?;
        Ok(())
    }
}

fn render_profile(
    source: &CpuProfileSource,
    report: &SampleReport,
    before: &ResourceUsage,
    after: &ResourceUsage,
) -> String {
    let user = after.user_time.saturating_sub(before.user_time);
    let system = after.system_time.saturating_sub(before.system_time);
    let window_secs = report.window.as_secs_f64();
    let cores_busy = if window_secs > 0.0 {
        (user + system).as_secs_f64() / window_secs
    } else {
        0.0
    };

    let mut out = String::new();
    let _ = writeln!(out, "# cpu profile");
    let _ = writeln!(out, "requested_window_ms: {}", source.duration.as_millis());
    let _ = writeln!(out, "actual_window_ms: {}", report.window.as_millis());
    let _ = writeln!(out, "sample_interval_ms: {}", report.interval.as_millis());
    let _ = writeln!(out, "sweeps: {}", report.sweeps);
    let _ = writeln!(out, "process_user_cpu_ms: {}", user.as_millis());
    let _ = writeln!(out, "process_system_cpu_ms: {}", system.as_millis());
    let _ = writeln!(out, "cores_busy: {cores_busy:.3}");
    let _ = writeln!(out, "registered_threads: {}", report.threads.len());

    for thread in &report.threads {
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "thread {:?} responded={}/{} same_location={}",
            thread.name, thread.responded, thread.samples, thread.same_location_count
        );
        if thread.frame_counts.is_empty() {
            let _ = writeln!(out, "  (no samples)");
        }
        for fc in &thread.frame_counts {
            let _ = writeln!(out, "  {:>6} {}", fc.hits, fc.frame);
        }
    }
    out
}
