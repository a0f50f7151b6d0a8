//! Thread stack collection via `pthread_kill(SIGPROF)`.
//!
//! Threads opt in by registering themselves. A sweep sends SIGPROF to every
//! registered thread; the handler walks the interrupted stack and stores the
//! raw instruction pointers in a pre-allocated slot, and the collector reads
//! the slots back after a short wait and symbolizes them on its own thread.
//! Repeating sweeps over a window gives a sampling profile.
//!
//! The handler never allocates: an interrupted thread may be holding the
//! allocator lock.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use dossier_types::{FrameCount, ThreadStackSnapshot};

/// Opaque `pthread_t`. On some platforms it is a pointer, which is only ever
/// compared and passed back to libc.
#[derive(Clone, Copy)]
struct ThreadHandle(libc::pthread_t);

unsafe impl Send for ThreadHandle {}

impl ThreadHandle {
    fn current() -> Self {
        Self(unsafe { libc::pthread_self() })
    }

    fn same(self, other: Self) -> bool {
        unsafe { libc::pthread_equal(self.0, other.0) != 0 }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Thread registry ──────────────────────────────────────────

struct ThreadEntry {
    handle: ThreadHandle,
    name: String,
}

static THREAD_REGISTRY: OnceLock<Mutex<Vec<ThreadEntry>>> = OnceLock::new();

fn registry() -> MutexGuard<'static, Vec<ThreadEntry>> {
    lock(THREAD_REGISTRY.get_or_init(|| Mutex::new(Vec::new())))
}

/// Register the calling thread for stack sampling.
/// Call this from thread startup (e.g. tokio's `on_thread_start`).
pub fn register_thread(name: &str) {
    let handle = ThreadHandle::current();
    let mut reg = registry();
    reg.retain(|entry| !entry.handle.same(handle));
    reg.push(ThreadEntry {
        handle,
        name: name.to_string(),
    });
}

/// Deregister the calling thread. Must run before the thread exits.
pub fn deregister_thread() {
    let handle = ThreadHandle::current();
    registry().retain(|entry| !entry.handle.same(handle));
}

/// RAII guard that deregisters the thread on drop.
pub struct ThreadGuard(());

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        deregister_thread();
    }
}

/// Register the calling thread and return a guard that deregisters on drop.
pub fn register_thread_guard(name: &str) -> ThreadGuard {
    register_thread(name);
    ThreadGuard(())
}

pub fn registered_thread_names() -> Vec<String> {
    registry().iter().map(|entry| entry.name.clone()).collect()
}

// ── Stack collection machinery ───────────────────────────────

/// Maximum number of threads sampled in one sweep.
const MAX_THREADS: usize = 256;
/// Frames recorded per sample; deeper stacks are truncated.
const MAX_FRAMES: usize = 128;

struct StackSlot {
    /// Whether this slot is waiting for a response.
    active: AtomicBool,
    /// Thread this slot is assigned to (set before signaling).
    thread: Mutex<Option<ThreadHandle>>,
    /// Set by the handler once `frames[..depth]` is complete.
    ready: AtomicBool,
    depth: AtomicUsize,
    /// Raw instruction pointers written by the SIGPROF handler.
    frames: [AtomicUsize; MAX_FRAMES],
}

static STACK_SLOTS: OnceLock<Vec<StackSlot>> = OnceLock::new();
static COLLECTION_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
/// Serializes sweeps: slots are shared by every collector in the process.
static SWEEP_LOCK: Mutex<()> = Mutex::new(());

fn slots() -> &'static [StackSlot] {
    STACK_SLOTS.get_or_init(|| {
        (0..MAX_THREADS)
            .map(|_| StackSlot {
                active: AtomicBool::new(false),
                thread: Mutex::new(None),
                ready: AtomicBool::new(false),
                depth: AtomicUsize::new(0),
                frames: std::array::from_fn(|_| AtomicUsize::new(0)),
            })
            .collect()
    })
}

/// Install the SIGPROF handler. Idempotent; the first outcome is remembered.
///
/// Until this succeeds, sweeps never signal any thread (the default SIGPROF
/// action terminates the process).
pub fn install_sigprof_handler() -> io::Result<()> {
    static INSTALL: OnceLock<Result<(), i32>> = OnceLock::new();
    let outcome = *INSTALL.get_or_init(|| {
        // Initialize slots eagerly so the signal handler never allocates them.
        let _ = slots();

        let rc = unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = sigprof_handler as *const () as usize;
            sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            libc::sigaction(libc::SIGPROF, &sa, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        HANDLER_INSTALLED.store(true, Ordering::Release);
        Ok(())
    });
    outcome.map_err(io::Error::from_raw_os_error)
}

/// Runs in signal context on the target thread.
extern "C" fn sigprof_handler(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    if !COLLECTION_IN_PROGRESS.load(Ordering::Acquire) {
        return;
    }

    let self_handle = ThreadHandle::current();
    let Some(slots) = STACK_SLOTS.get() else {
        return;
    };

    for slot in slots.iter() {
        if !slot.active.load(Ordering::Acquire) {
            continue;
        }
        let matches = match slot.thread.try_lock() {
            Ok(thread) => thread.is_some_and(|t| t.same(self_handle)),
            Err(_) => false,
        };
        if matches {
            let mut depth = 0usize;
            // The synchronized `trace` takes a global lock this thread may
            // already hold.
            unsafe {
                backtrace::trace_unsynchronized(|frame| {
                    slot.frames[depth].store(frame.ip() as usize, Ordering::Relaxed);
                    depth += 1;
                    depth < MAX_FRAMES
                });
            }
            slot.depth.store(depth, Ordering::Relaxed);
            slot.ready.store(true, Ordering::Release);
            return;
        }
    }
}

/// Signal every target once and wait up to `timeout` for the handlers.
/// Returns the raw frames of each target, index-aligned with `targets`.
fn sweep_once(targets: &[ThreadHandle], timeout: Duration) -> Vec<Option<Vec<usize>>> {
    let _sweep = lock(&SWEEP_LOCK);
    let slots = slots();
    let count = targets.len().min(MAX_THREADS);
    let self_handle = ThreadHandle::current();

    for (slot, target) in slots.iter().zip(targets).take(count) {
        slot.ready.store(false, Ordering::Release);
        slot.depth.store(0, Ordering::Relaxed);
        *lock(&slot.thread) = Some(*target);
        slot.active.store(true, Ordering::Release);
    }

    COLLECTION_IN_PROGRESS.store(true, Ordering::Release);

    let mut expected = 0usize;
    if HANDLER_INSTALLED.load(Ordering::Acquire) {
        // Holding the registry lock keeps targets from deregistering (and
        // exiting) while they are being signaled.
        let reg = registry();
        for target in targets.iter().take(count) {
            if target.same(self_handle) || !reg.iter().any(|entry| entry.handle.same(*target)) {
                continue;
            }
            if unsafe { libc::pthread_kill(target.0, libc::SIGPROF) } == 0 {
                expected += 1;
            }
        }
    }

    let deadline = Instant::now() + timeout;
    while expected > 0 {
        let responded = slots
            .iter()
            .take(count)
            .filter(|slot| slot.ready.load(Ordering::Acquire))
            .count();
        if responded >= expected || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(2));
    }

    COLLECTION_IN_PROGRESS.store(false, Ordering::Release);

    slots
        .iter()
        .take(count)
        .map(|slot| {
            slot.active.store(false, Ordering::Release);
            *lock(&slot.thread) = None;
            if !slot.ready.load(Ordering::Acquire) {
                return None;
            }
            let depth = slot.depth.load(Ordering::Relaxed).min(MAX_FRAMES);
            Some(
                slot.frames[..depth]
                    .iter()
                    .map(|ip| ip.load(Ordering::Relaxed))
                    .collect(),
            )
        })
        .collect()
}

struct ResolvedFrame {
    name: String,
    location: Option<String>,
}

/// Turns raw instruction pointers into backtrace text, caching each address.
#[derive(Default)]
struct Symbolizer {
    cache: HashMap<usize, Vec<ResolvedFrame>>,
}

impl Symbolizer {
    fn render(&mut self, ips: &[usize]) -> String {
        let mut out = String::new();
        let mut index = 0usize;
        for &ip in ips {
            let frames = self.cache.entry(ip).or_insert_with(|| resolve_ip(ip));
            for frame in frames.iter() {
                out.push_str(&format!("{index:4}: {}\n", frame.name));
                if let Some(location) = &frame.location {
                    out.push_str(&format!("             at {location}\n"));
                }
                index += 1;
            }
        }
        out
    }
}

fn resolve_ip(ip: usize) -> Vec<ResolvedFrame> {
    let mut frames = Vec::new();
    backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
        let name = match symbol.name() {
            Some(name) => format!("{name:#}"),
            None => format!("<unknown> {ip:#x}"),
        };
        let location = match (symbol.filename(), symbol.lineno()) {
            (Some(file), Some(line)) => Some(format!("{}:{line}", file.display())),
            (Some(file), None) => Some(file.display().to_string()),
            _ => None,
        };
        frames.push(ResolvedFrame { name, location });
    });
    if frames.is_empty() {
        frames.push(ResolvedFrame {
            name: format!("<unknown> {ip:#x}"),
            location: None,
        });
    }
    frames
}

/// Extract the first "useful" frame from a backtrace string.
///
/// Skips signal-handler internals, backtrace machinery and parking frames,
/// and returns the first frame that looks like application or library code.
pub(crate) fn extract_top_frame(bt: &str) -> Option<String> {
    // Backtrace lines look like:
    //   4: module::function
    // or:
    //   at /path/to/file.rs:123
    let noise = [
        "std::backtrace",
        "std::sys",
        "backtrace_rs",
        "backtrace::",
        "_Unwind_",
        "sigprof_handler",
        "__os_lock",
        "_pthread_",
        "pthread_",
        "core::ops::function",
        "std::panicking",
        "std::panic",
        "std::rt::lang_start",
        "<unknown>",
        "__psynch_",
        "kevent",
        "_sigtramp",
        "__restore_rt",
        "signal_handler",
        "dossier_probes::threads",
    ];

    for line in bt.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("at ") || trimmed.starts_with("stack ") {
            continue;
        }
        // Strip leading frame number like "4: "
        let frame = match trimmed.find(": ") {
            Some(idx) if trimmed[..idx].trim().chars().all(|c| c.is_ascii_digit()) => {
                trimmed[idx + 2..].trim()
            }
            _ => trimmed,
        };

        if frame.is_empty() || noise.iter().any(|n| frame.contains(n)) {
            continue;
        }
        return Some(frame.to_string());
    }
    None
}

/// Result of sampling every registered thread over a window.
pub struct SampleReport {
    pub sweeps: u32,
    pub window: Duration,
    /// Pause actually used between sweeps.
    pub interval: Duration,
    pub threads: Vec<ThreadStackSnapshot>,
}

/// Spacing between sweeps so that at most `max_sweeps` fit in `window`,
/// never closer together than `interval`.
pub(crate) fn sweep_spacing(window: Duration, interval: Duration, max_sweeps: u32) -> Duration {
    interval.max(window / max_sweeps.max(1))
}

/// Sample all registered threads until `window` elapses or `max_sweeps`
/// sweeps have run, spacing sweeps by `sweep_spacing`. Always performs at
/// least one sweep when threads are registered.
///
/// Blocks the calling thread for the whole window even when no thread is
/// registered.
pub fn sample_threads(
    window: Duration,
    interval: Duration,
    max_sweeps: u32,
    sweep_timeout: Duration,
) -> SampleReport {
    let started = Instant::now();
    let deadline = started + window;
    let interval = sweep_spacing(window, interval, max_sweeps);
    let max_sweeps = max_sweeps.max(1);
    let mut symbolizer = Symbolizer::default();

    let (targets, names): (Vec<ThreadHandle>, Vec<String>) = registry()
        .iter()
        .take(MAX_THREADS)
        .map(|entry| (entry.handle, entry.name.clone()))
        .unzip();

    struct ThreadTracker {
        last_frame: Option<String>,
        same_count: u32,
        responded: u32,
        last_backtrace: Option<String>,
        frame_counts: HashMap<String, u32>,
    }
    let mut trackers: Vec<ThreadTracker> = targets
        .iter()
        .map(|_| ThreadTracker {
            last_frame: None,
            same_count: 0,
            responded: 0,
            last_backtrace: None,
            frame_counts: HashMap::new(),
        })
        .collect();

    let mut sweeps = 0u32;
    loop {
        if !targets.is_empty() && sweeps < max_sweeps {
            let results = sweep_once(&targets, sweep_timeout);
            sweeps += 1;

            for (tracker, ips) in trackers.iter_mut().zip(results) {
                let Some(ips) = ips else { continue };
                let bt = symbolizer.render(&ips);
                tracker.responded += 1;
                let frame = extract_top_frame(&bt);
                if let Some(f) = &frame {
                    *tracker.frame_counts.entry(f.clone()).or_insert(0) += 1;
                }
                if frame.is_some() && frame == tracker.last_frame {
                    tracker.same_count += 1;
                }
                tracker.last_frame = frame;
                tracker.last_backtrace = Some(bt);
            }
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(interval.min(deadline - now));
    }

    let threads = names
        .into_iter()
        .zip(trackers)
        .map(|(name, tracker)| {
            let mut frame_counts: Vec<FrameCount> = tracker
                .frame_counts
                .into_iter()
                .map(|(frame, hits)| FrameCount { frame, hits })
                .collect();
            frame_counts.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.frame.cmp(&b.frame)));

            ThreadStackSnapshot {
                name,
                backtrace: tracker.last_backtrace,
                samples: sweeps,
                responded: tracker.responded,
                same_location_count: tracker.same_count,
                dominant_frame: frame_counts.first().map(|fc| fc.frame.clone()),
                frame_counts,
            }
        })
        .collect();

    SampleReport {
        sweeps,
        window: started.elapsed(),
        interval,
        threads,
    }
}

/// Backtrace of the calling thread, captured directly.
pub fn current_thread_backtrace() -> String {
    Backtrace::force_capture().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn top_frame_skips_signal_machinery() {
        let bt = "\
   0: std::backtrace::Backtrace::force_capture
             at /rustc/library/std/src/backtrace.rs:310:9
   1: dossier_probes::threads::sigprof_handler
   2: __restore_rt
   3: my_app::worker::crunch_numbers
             at ./src/worker.rs:42:5
   4: my_app::main";
        assert_eq!(
            extract_top_frame(bt).as_deref(),
            Some("my_app::worker::crunch_numbers")
        );
    }

    #[test]
    fn top_frame_of_pure_noise_is_none() {
        assert_eq!(extract_top_frame("   0: std::sys::backtrace\n   1: <unknown>"), None);
        assert_eq!(extract_top_frame(""), None);
    }

    #[test]
    fn guard_deregisters_on_drop() {
        let name = "dossier-test-guard";
        std::thread::spawn(move || {
            let _guard = register_thread_guard(name);
            assert!(registered_thread_names().iter().any(|n| n == name));
        })
        .join()
        .expect("registering thread panicked");
        assert!(!registered_thread_names().iter().any(|n| n == name));
    }

    #[test]
    fn sampling_lists_registered_threads_and_blocks_for_the_window() {
        install_sigprof_handler().expect("SIGPROF handler must install");

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let spinner = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                let _guard = register_thread_guard("dossier-test-spinner");
                ready_tx.send(()).expect("ready signal");
                let mut acc = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    acc = acc.wrapping_mul(31).wrapping_add(7);
                    std::hint::spin_loop();
                }
                acc
            })
        };
        ready_rx.recv().expect("spinner registered");

        let window = Duration::from_millis(60);
        let report = sample_threads(
            window,
            Duration::from_millis(10),
            100,
            Duration::from_millis(100),
        );
        stop.store(true, Ordering::Relaxed);
        spinner.join().expect("spinner panicked");

        assert!(report.window >= window);
        assert!(report.sweeps >= 1);
        let spinner = report
            .threads
            .iter()
            .find(|t| t.name == "dossier-test-spinner")
            .expect("registered thread must be reported");
        assert_eq!(spinner.samples, report.sweeps);
        assert!(spinner.responded <= spinner.samples);
    }

    #[test]
    fn sweep_spacing_caps_the_number_of_sweeps() {
        let ms = Duration::from_millis;
        assert_eq!(sweep_spacing(ms(5_000), ms(10), 100), ms(50));
        assert_eq!(sweep_spacing(ms(100), ms(10), 100), ms(10));
        assert_eq!(sweep_spacing(ms(100), ms(0), 0), ms(100));
    }

    #[test]
    fn sampling_stops_after_max_sweeps() {
        install_sigprof_handler().expect("SIGPROF handler must install");

        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let sleeper = std::thread::spawn(move || {
            let _guard = register_thread_guard("dossier-test-capped");
            ready_tx.send(()).expect("ready signal");
            let _ = done_rx.recv();
        });
        ready_rx.recv().expect("sleeper registered");

        let window = Duration::from_millis(80);
        let report = sample_threads(window, Duration::ZERO, 3, Duration::from_millis(50));
        drop(done_tx);
        sleeper.join().expect("sleeper panicked");

        assert!(report.sweeps >= 1 && report.sweeps <= 3, "sweeps = {}", report.sweeps);
        assert!(report.interval >= window / 3);
        assert!(report.window >= window);
    }

    #[test]
    fn unresolvable_addresses_render_as_noise() {
        let text = Symbolizer::default().render(&[0]);
        assert!(text.contains("<unknown>"), "{text}");
        assert_eq!(extract_top_frame(&text), None);
    }
}
