//! Capture-session lifecycle.
//!
//! At most one tracker session exists per process. `start` wires everything
//! up in an order that keeps the process consistent at every step: sink
//! first (so a bad output path fails before anything is instrumented),
//! then the header, the initial segment generation, and only then the
//! symbol patch that makes intercepts live. `stop` unwinds in reverse.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Once;

use crate::error::{Error, Result};
use crate::records::sink::{FileSink, Sink, SocketSink};
use crate::records::writer::{RecordWriter, WriterOptions};
use crate::records::AllocatorKind;
use crate::resolve::{segments, unwind};
use crate::sync::mutex::Mutex;
use crate::tracking::{guard, shadow};

/// Consecutive writer failures tolerated before tracking shuts itself off.
const MAX_WRITE_FAILURES: usize = 8;

/// Where the capture goes.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Write to a fresh file at this path.
    Path(PathBuf),
    /// Listen on this port and stream to the first reader that connects.
    Port(u16),
}

impl Destination {
    /// Convenience constructor for file captures.
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Destination::Path(path.into())
    }
}

/// Capture-session configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Capture native stacks alongside managed ones.
    pub native_traces: bool,

    /// Restart the capture in forked children (into `<output>.<pid>`).
    /// Without it, children keep the re-entrancy guard set and record
    /// nothing. Never honored on socket sinks.
    pub follow_fork: bool,

    /// Emit a MEMORY_SNAPSHOT every this many records (0 disables).
    pub memory_snapshot_every: usize,

    /// Command line stored in the header; defaults to the process's own.
    pub command_line: Option<String>,

    /// Symbol of the runtime's lock-acquire entry point. When set, the
    /// patcher redirects it so the profile hook reaches every thread that
    /// ever enters managed code.
    pub runtime_acquire_symbol: Option<String>,

    /// Patch the platform allocators. Disable for embedders that deliver
    /// all events through the tracking API instead of interception.
    pub instrument_allocators: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            native_traces: false,
            follow_fork: false,
            memory_snapshot_every: 1024,
            command_line: None,
            runtime_acquire_symbol: None,
            instrument_allocators: true,
        }
    }
}

impl TrackerConfig {
    /// Configuration for embedders that feed events through the API only:
    /// no allocator patching, no native unwinding.
    pub fn embedded() -> Self {
        Self {
            instrument_allocators: false,
            ..Self::default()
        }
    }
}

/// Everything the intercepts need, behind one pointer.
pub(crate) struct TrackerState {
    pub(crate) writer: RecordWriter,
    follow_fork: bool,
    instrumented: bool,
    output_path: Option<PathBuf>,
    memory_snapshot_every: usize,
    failures: AtomicUsize,
}

impl TrackerState {
    /// Count a writer failure; after too many in a row, stop tracking so a
    /// dead sink cannot slow the traced program forever.
    pub(crate) fn note_write_failure(&self, err: Error) {
        log::warn!("dropping record after write failure: {err}");
        let seen = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if seen == MAX_WRITE_FAILURES {
            log::error!("capture sink failed {seen} times; deactivating tracking");
            ACTIVE.store(false, Ordering::Release);
        }
    }
}

static ACTIVE: AtomicBool = AtomicBool::new(false);
static STATE: AtomicPtr<TrackerState> = AtomicPtr::new(std::ptr::null_mut());
static GENERATION: AtomicU32 = AtomicU32::new(0);
static ACCEPT_CANCEL: AtomicBool = AtomicBool::new(false);
static LIFECYCLE: Mutex<()> = Mutex::new(());
static FORK_HANDLERS: Once = Once::new();
static THREAD_INIT_HOOK: AtomicPtr<()> = AtomicPtr::new(std::ptr::null_mut());

/// Run `f` against the live session, if any.
///
/// The state pointer is published before ACTIVE flips on and is never
/// freed while the process lives (one leaked block per session), so a
/// stale read races benignly: the writer's own mutex serializes the rest.
pub(crate) fn with_active(f: impl FnOnce(&TrackerState)) {
    if !ACTIVE.load(Ordering::Acquire) {
        return;
    }
    let ptr = STATE.load(Ordering::Acquire);
    if !ptr.is_null() {
        f(unsafe { &*ptr });
    }
}

/// Current segment-map generation.
pub(crate) fn current_generation() -> u32 {
    GENERATION.load(Ordering::Relaxed)
}

/// True while a capture session is active in this process.
pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

/// Interrupt a `Tracker::start` blocked waiting for a socket reader.
pub fn cancel_pending_start() {
    ACCEPT_CANCEL.store(true, Ordering::Relaxed);
}

/// Register a callback invoked once per thread when the runtime's
/// lock-acquire entry point first fires there. The embedder installs its
/// profile hook from this callback.
pub fn set_thread_init_hook(hook: fn()) {
    THREAD_INIT_HOOK.store(hook as *mut (), Ordering::Release);
}

/// Handle to the live capture session.
///
/// Stopping (explicitly or on drop) restores patched symbols, flushes the
/// writer, and rewrites the header stats.
pub struct Tracker {
    stopped: bool,
}

impl Tracker {
    /// Start a capture session.
    ///
    /// Fails deterministically - before the process is instrumented - when
    /// the output exists, the port cannot be bound, or another session is
    /// already active.
    pub fn start(destination: Destination, config: TrackerConfig) -> Result<Tracker> {
        let _lifecycle = LIFECYCLE.lock();
        if ACTIVE.load(Ordering::Acquire) {
            return Err(Error::AlreadyActive);
        }
        ACCEPT_CANCEL.store(false, Ordering::Relaxed);

        let (sink, output_path): (Box<dyn Sink>, Option<PathBuf>) = match &destination {
            Destination::Path(path) => (Box::new(FileSink::create(path)?), Some(path.clone())),
            Destination::Port(port) => (Box::new(SocketSink::accept(*port, &ACCEPT_CANCEL)?), None),
        };

        let command_line = config.command_line.clone().unwrap_or_else(process_command_line);
        let writer = RecordWriter::new(
            sink,
            WriterOptions {
                native_traces: config.native_traces,
                pid: std::process::id(),
                command_line,
                memory_snapshot_every: config.memory_snapshot_every,
            },
        )?;

        // The first generation of this session keeps the process-wide
        // monotonic counter going; readers key strictly off the value.
        let generation = GENERATION.load(Ordering::Relaxed);
        writer.push_segment_snapshot(segments::snapshot_current(generation));
        writer.flush_pending_segments()?;

        install_fork_handlers();

        let state = Box::into_raw(Box::new(TrackerState {
            writer,
            follow_fork: config.follow_fork,
            instrumented: config.instrument_allocators,
            output_path,
            memory_snapshot_every: config.memory_snapshot_every,
            failures: AtomicUsize::new(0),
        }));
        STATE.store(state, Ordering::Release);

        if config.instrument_allocators {
            #[cfg(target_os = "linux")]
            {
                crate::hooks::initialize(config.runtime_acquire_symbol.as_deref());
                crate::hooks::patcher::patch_all(crate::hooks::patcher::PatchMode::Patch);
            }
            #[cfg(not(target_os = "linux"))]
            log::warn!("allocator instrumentation is only available on linux; tracking API events only");
        }

        shadow::mark_hook_installed();
        ACTIVE.store(true, Ordering::Release);
        log::debug!("tracker started (pid {})", std::process::id());
        Ok(Tracker { stopped: false })
    }

    /// Stop the session and finalize the capture.
    pub fn stop(mut self) -> Result<()> {
        self.stop_impl()
    }

    fn stop_impl(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let _lifecycle = LIFECYCLE.lock();
        ACTIVE.store(false, Ordering::Release);

        let ptr = STATE.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return Ok(());
        }
        // Intentionally leaked: an intercept that loaded the pointer just
        // before ACTIVE flipped may still be inside the writer.
        let state = unsafe { &*ptr };

        #[cfg(target_os = "linux")]
        if state.instrumented {
            crate::hooks::patcher::patch_all(crate::hooks::patcher::PatchMode::Restore);
        }

        let stats = state.writer.finalize()?;
        log::debug!(
            "tracker stopped: {} allocations, peak {}",
            stats.n_allocations,
            crate::util::size::format_bytes(stats.peak_memory)
        );
        Ok(())
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Err(err) = self.stop_impl() {
            log::warn!("failed to finalize capture on drop: {err}");
        }
    }
}

/// Record one allocator event.
///
/// Called from intercepts (which already hold the re-entrancy guard) and by
/// embedders that instrument an allocator of their own. The guard is taken
/// here when free so the writer's internal allocations are never traced.
pub fn record_allocation(kind: AllocatorKind, address: u64, size: u64) {
    let _token = guard::enter();
    with_active(|state| {
        let thread_id = shadow::current_thread_id();
        let line = shadow::current_line();

        let mut ips = [0u64; unwind::MAX_NATIVE_FRAMES];
        let captured = if state.writer.native_traces() {
            unwind::capture(&mut ips)
        } else {
            0
        };

        if let Err(err) = state.writer.write_allocation(
            thread_id,
            address,
            size,
            kind,
            line,
            &ips[..captured],
            current_generation(),
        ) {
            state.note_write_failure(err);
        }
    });
}

/// A shared object was loaded or unloaded: bump the generation, snapshot
/// the new layout, and patch any newly arrived relocation tables.
pub(crate) fn on_module_change() {
    with_active(|state| {
        let generation = GENERATION.fetch_add(1, Ordering::SeqCst) + 1;
        state.writer.push_segment_snapshot(segments::snapshot_current(generation));
        #[cfg(target_os = "linux")]
        if state.instrumented {
            crate::hooks::patcher::patch_all(crate::hooks::patcher::PatchMode::Patch);
        }
    });
}

/// The runtime's lock-acquire entry point fired on this thread. Install
/// the embedder's profile hook exactly once per thread.
pub(crate) fn on_runtime_thread() {
    if shadow::mark_hook_installed() {
        return;
    }
    let hook = THREAD_INIT_HOOK.load(Ordering::Acquire);
    if !hook.is_null() {
        let hook: fn() = unsafe { std::mem::transmute(hook) };
        hook();
    }
}

fn process_command_line() -> String {
    #[cfg(target_os = "linux")]
    if let Ok(raw) = std::fs::read("/proc/self/cmdline") {
        return raw
            .split(|&b| b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
    }
    std::env::args().collect::<Vec<_>>().join(" ")
}

fn install_fork_handlers() {
    FORK_HANDLERS.call_once(|| {
        #[cfg(unix)]
        unsafe {
            libc::pthread_atfork(Some(fork_prepare), Some(fork_parent), Some(fork_child));
        }
    });
}

#[cfg(unix)]
extern "C" fn fork_prepare() {
    // Allocations made inside fork() itself must not be recorded.
    guard::block_thread();
}

#[cfg(unix)]
extern "C" fn fork_parent() {
    guard::unblock_thread();
}

#[cfg(unix)]
extern "C" fn fork_child() {
    if !ACTIVE.load(Ordering::Acquire) {
        guard::unblock_thread();
        return;
    }
    let ptr = STATE.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    let state = unsafe { &*ptr };

    let path = match (&state.output_path, state.follow_fork) {
        (Some(path), true) => path.clone(),
        // Default policy: the child keeps the guard set and stays
        // suspended until it starts its own session.
        _ => return,
    };

    // Restart the capture into a sibling file named after the child pid.
    // Only this thread exists in the child, so swapping state is safe.
    let child_path = path.with_extension(format!(
        "{}{}",
        path.extension().map(|e| format!("{}.", e.to_string_lossy())).unwrap_or_default(),
        std::process::id()
    ));
    let restarted = FileSink::create(&child_path)
        .map(|sink| Box::new(sink) as Box<dyn Sink>)
        .and_then(|sink| {
            RecordWriter::new(
                sink,
                WriterOptions {
                    native_traces: state.writer.native_traces(),
                    pid: std::process::id(),
                    command_line: process_command_line(),
                    memory_snapshot_every: state.memory_snapshot_every,
                },
            )
        });

    match restarted {
        Ok(writer) => {
            let generation = GENERATION.load(Ordering::Relaxed);
            writer.push_segment_snapshot(segments::snapshot_current(generation));
            let new_state = Box::into_raw(Box::new(TrackerState {
                writer,
                follow_fork: state.follow_fork,
                instrumented: state.instrumented,
                output_path: Some(child_path),
                memory_snapshot_every: state.memory_snapshot_every,
                failures: AtomicUsize::new(0),
            }));
            STATE.store(new_state, Ordering::Release);
            guard::unblock_thread();
            shadow::reemit_stack();
        }
        Err(err) => {
            log::warn!("could not restart capture in forked child: {err}");
            ACTIVE.store(false, Ordering::Release);
            guard::unblock_thread();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TrackerConfig::default();
        assert!(!config.native_traces);
        assert!(!config.follow_fork);
        assert!(config.instrument_allocators);
        assert_eq!(config.memory_snapshot_every, 1024);

        let embedded = TrackerConfig::embedded();
        assert!(!embedded.instrument_allocators);
    }

    #[test]
    fn test_record_allocation_without_session_is_noop() {
        // Must not crash or touch any state.
        record_allocation(AllocatorKind::Malloc, 0x1000, 64);
        assert!(!is_active());
    }
}
