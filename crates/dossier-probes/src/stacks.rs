use std::fmt::Write as _;
use std::io::Write;
use std::time::Duration;

use dossier::{Source, SourceError};
use dossier_types::{ThreadStackSnapshot, now_ms};

use crate::threads::{current_thread_backtrace, sample_threads};

/// Stack dump of every registered thread plus the thread running the build.
pub struct StackDumpSource {
    pub sweep_timeout: Duration,
}

impl Source for StackDumpSource {
    fn write_to(&self, sink: &mut dyn Write) -> Result<(), SourceError> {
        let report = sample_threads(Duration::ZERO, Duration::ZERO, 1, self.sweep_timeout);
        let current = std::thread::current();
        let dump = render_dump(
            now_ms(),
            &report.threads,
            current.name().unwrap_or("<unnamed>"),
            &current_thread_backtrace(),
        );
        sink.write_all(dump.as_bytes())?;
        Ok(())
    }
}

fn render_dump(
    captured_at_ms: i64,
    threads: &[ThreadStackSnapshot],
    current_name: &str,
    current_backtrace: &str,
) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# thread dump: {} registered thread(s), captured_at_ms={captured_at_ms}",
        threads.len()
    );

    let _ = writeln!(out);
    let _ = writeln!(out, "thread {current_name:?} [collector]");
    let _ = writeln!(out, "{}", current_backtrace.trim_end());

    for thread in threads {
        let _ = writeln!(out);
        match &thread.backtrace {
            Some(bt) => {
                let _ = writeln!(out, "thread {:?}", thread.name);
                let _ = writeln!(out, "{}", bt.trim_end());
            }
            None => {
                let _ = writeln!(
                    out,
                    "thread {:?} [no response: skipped, exiting, or blocked with SIGPROF masked]",
                    thread.name
                );
            }
        }
    }
    out
}
