//! Integration tests for memtrail.
//!
//! These drive the full pipeline - tracker session, record stream, reader,
//! snapshots - through the public API, with allocator patching disabled so
//! the test runner's own heap stays untouched. At most one session may
//! exist per process, so every test that starts a tracker serializes on
//! one lock.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;

use memtrail::{
    AllocatorKind, CaptureReader, Destination, Error, ProfileEvent, Tracker, TrackerConfig,
    ALL_THREADS,
};

static SESSION: Mutex<()> = Mutex::new(());

fn session_lock() -> MutexGuard<'static, ()> {
    SESSION.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start_file_tracker(dir: &tempfile::TempDir, config: TrackerConfig) -> (Tracker, std::path::PathBuf) {
    let path = dir.path().join("capture.memtrail");
    let tracker = Tracker::start(Destination::path(&path), config).unwrap();
    (tracker, path)
}

#[test]
fn test_alloc_free_sequence_peak_and_leaks() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, path) = start_file_tracker(&dir, TrackerConfig::embedded());

    // Blocks of 10, 20, 30 allocated then freed in order.
    memtrail::record_allocation(AllocatorKind::Malloc, 0x1000, 10);
    memtrail::record_allocation(AllocatorKind::Malloc, 0x2000, 20);
    memtrail::record_allocation(AllocatorKind::Malloc, 0x3000, 30);
    memtrail::record_allocation(AllocatorKind::Free, 0x1000, 0);
    memtrail::record_allocation(AllocatorKind::Free, 0x2000, 0);
    memtrail::record_allocation(AllocatorKind::Free, 0x3000, 0);
    tracker.stop().unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    assert_eq!(reader.metadata().stats.peak_memory, 60);
    assert_eq!(reader.metadata().stats.n_allocations, 6);

    let peak = reader.high_watermark().unwrap();
    assert_eq!(peak.peak_memory, 60);
    assert_eq!(peak.index, 2);

    let at_peak = reader.high_watermark_snapshot(true).unwrap();
    let live_count: usize = at_peak.iter().map(|entry| entry.n_allocations).sum();
    assert_eq!(live_count, 3);

    assert!(reader.leak_snapshot(true).unwrap().is_empty());
}

#[test]
fn test_round_trip_preserves_event_tuples() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, path) = start_file_tracker(&dir, TrackerConfig::embedded());

    let written = [
        (AllocatorKind::Malloc, 0xa000u64, 128u64),
        (AllocatorKind::Calloc, 0xb000, 256),
        (AllocatorKind::Free, 0xa000, 0),
        (AllocatorKind::Mmap, 0x7f00_0000, 4096),
        (AllocatorKind::Munmap, 0x7f00_0000, 4096),
    ];
    for (kind, address, size) in written {
        memtrail::record_allocation(kind, address, size);
    }
    tracker.stop().unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    let decoded: Vec<_> = reader
        .allocations()
        .map(|event| event.unwrap())
        .map(|event| (event.record.kind, event.record.address, event.record.size))
        .collect();
    assert_eq!(decoded, written);
}

#[test]
fn test_realloc_pattern_temporaries() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, path) = start_file_tracker(&dir, TrackerConfig::embedded());

    // p = malloc(100); p = realloc(p, 200); free(p) - realloc shows up as
    // an explicit free of the old address followed by the new allocation.
    memtrail::record_allocation(AllocatorKind::Malloc, 0x10, 100);
    memtrail::record_allocation(AllocatorKind::Free, 0x10, 0);
    memtrail::record_allocation(AllocatorKind::Realloc, 0x20, 200);
    memtrail::record_allocation(AllocatorKind::Free, 0x20, 0);
    tracker.stop().unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    assert_eq!(reader.metadata().stats.peak_memory, 200);
    assert!(reader.leak_snapshot(true).unwrap().is_empty());

    // Both blocks die exactly one event after they are born.
    assert!(reader.temporary_allocations(0, true).unwrap().is_empty());
    let temporaries = reader.temporary_allocations(1, true).unwrap();
    assert_eq!(temporaries.len(), 1);
    assert_eq!(temporaries[0].size, 300);
    assert_eq!(temporaries[0].n_allocations, 2);
}

#[test]
fn test_partial_unmap_live_coverage() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, path) = start_file_tracker(&dir, TrackerConfig::embedded());

    let a = 0x7f10_0000u64;
    let b = 0x7f20_0000u64;
    memtrail::record_allocation(AllocatorKind::Mmap, a, 4096);
    memtrail::record_allocation(AllocatorKind::Mmap, b, 4096);
    memtrail::record_allocation(AllocatorKind::Munmap, a, 2048);
    tracker.stop().unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    let peak = reader.high_watermark().unwrap();
    assert_eq!(peak.peak_memory, 8192);
    assert_eq!(peak.index, 1);

    let leaks = reader.leak_snapshot(true).unwrap();
    let live: u64 = leaks.iter().map(|entry| entry.size).sum();
    assert_eq!(live, 6144);
}

#[test]
fn test_two_threads_merge_and_split() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, path) = start_file_tracker(&dir, TrackerConfig::embedded());

    let workers: Vec<_> = [0x1111u64, 0x2222u64]
        .into_iter()
        .map(|address| {
            thread::spawn(move || {
                memtrail::profile_event(ProfileEvent::Call {
                    function: "worker",
                    file: "app.py",
                    line: 10,
                });
                memtrail::record_allocation(AllocatorKind::Malloc, address, 100);
                memtrail::profile_event(ProfileEvent::Return);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    tracker.stop().unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    let events: Vec<_> = reader.allocations().map(|event| event.unwrap()).collect();
    assert_eq!(events.len(), 2);
    assert_ne!(events[0].record.thread_id, events[1].record.thread_id);
    // Identical managed stacks intern to one stack id.
    assert_eq!(events[0].stack_id, events[1].stack_id);

    let merged = reader.leak_snapshot(true).unwrap();
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].size, 200);
    assert_eq!(merged[0].n_allocations, 2);
    assert_eq!(merged[0].thread_id, ALL_THREADS);

    let split = reader.leak_snapshot(false).unwrap();
    assert_eq!(split.len(), 2);
    assert!(split.iter().all(|entry| entry.size == 100));
}

#[test]
fn test_managed_stack_with_line_patching() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, path) = start_file_tracker(&dir, TrackerConfig::embedded());

    memtrail::profile_event(ProfileEvent::Call { function: "outer", file: "app.py", line: 3 });
    memtrail::profile_event(ProfileEvent::Call { function: "inner", file: "lib.py", line: 14 });
    memtrail::profile_event(ProfileEvent::Line { line: 21 });
    memtrail::record_allocation(AllocatorKind::Malloc, 0x9000, 64);
    memtrail::profile_event(ProfileEvent::Return);
    memtrail::profile_event(ProfileEvent::Return);
    tracker.stop().unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    let events: Vec<_> = reader.allocations().map(|event| event.unwrap()).collect();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].record.line, 21);

    let stack = reader.resolve_stack(events[0].stack_id, 0).unwrap();
    assert_eq!(stack.len(), 2);
    // Innermost first, with the event's line substituted in.
    assert_eq!(stack[0].function, "inner");
    assert_eq!(stack[0].line, 21);
    assert_eq!(stack[1].function, "outer");
    assert_eq!(stack[1].line, 3);

    assert_eq!(reader.resolve_stack(events[0].stack_id, 1).unwrap().len(), 1);
    assert!(matches!(reader.resolve_stack(9999, 0), Err(Error::UnknownStackId(9999))));
}

#[test]
fn test_second_tracker_fails_while_active() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, _path) = start_file_tracker(&dir, TrackerConfig::embedded());

    let other = dir.path().join("other.memtrail");
    match Tracker::start(Destination::path(&other), TrackerConfig::embedded()) {
        Err(Error::AlreadyActive) => {}
        other => panic!("expected AlreadyActive, got {:?}", other.map(|_| ())),
    }
    tracker.stop().unwrap();

    // After stop, a new session may begin.
    let tracker = Tracker::start(Destination::path(&other), TrackerConfig::embedded()).unwrap();
    tracker.stop().unwrap();
}

#[test]
fn test_existing_output_fails_before_instrumentation() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("taken.memtrail");
    std::fs::write(&path, b"stale").unwrap();

    match Tracker::start(Destination::path(&path), TrackerConfig::embedded()) {
        Err(Error::OutputExists(p)) => assert_eq!(p, path),
        other => panic!("expected OutputExists, got {:?}", other.map(|_| ())),
    }
    // The stale file was not clobbered and no session is active.
    assert_eq!(std::fs::read(&path).unwrap(), b"stale");
    assert!(!memtrail::is_active());
}

#[test]
fn test_drop_finalizes_capture() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let (tracker, path) = start_file_tracker(&dir, TrackerConfig::embedded());

    memtrail::record_allocation(AllocatorKind::Malloc, 0x4000, 512);
    drop(tracker);

    let mut reader = CaptureReader::open(&path).unwrap();
    assert_eq!(reader.metadata().stats.n_allocations, 1);
    assert_eq!(reader.metadata().stats.peak_memory, 512);
    assert!(reader.metadata().stats.end_time_ms >= reader.metadata().stats.start_time_ms);
    let leaked = reader.leak_snapshot(true).unwrap();
    assert_eq!(leaked[0].size, 512);
}

#[test]
fn test_memory_snapshots_enable_timeline() {
    let _session = session_lock();
    let dir = tempfile::tempdir().unwrap();
    let config = TrackerConfig { memory_snapshot_every: 2, ..TrackerConfig::embedded() };
    let (tracker, path) = start_file_tracker(&dir, config);

    for index in 0..8u64 {
        memtrail::record_allocation(AllocatorKind::Malloc, 0x1_0000 + index, 100);
    }
    tracker.stop().unwrap();

    let mut reader = CaptureReader::open(&path).unwrap();
    let timeline = reader.heap_timeline().unwrap().to_vec();
    assert!(timeline.len() >= 3);
    // The running heap only grows in this workload.
    for window in timeline.windows(2) {
        assert!(window[1].heap_bytes >= window[0].heap_bytes);
    }

    // A mid-stream window sees only its own allocations.
    let windowed = reader.snapshot_between(2, 5, true).unwrap();
    let size: u64 = windowed.iter().map(|entry| entry.size).sum();
    assert_eq!(size, 400);
}

#[test]
fn test_socket_capture_streams_to_reader() {
    let _session = session_lock();

    // Find a free port, then race-free enough: bind happens in the tracker.
    let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let tracker_thread = thread::spawn(move || {
        let config = TrackerConfig { memory_snapshot_every: 0, ..TrackerConfig::embedded() };
        let tracker = Tracker::start(Destination::Port(port), config).unwrap();
        memtrail::record_allocation(AllocatorKind::Malloc, 0x111, 40);
        memtrail::record_allocation(AllocatorKind::Malloc, 0x222, 60);
        memtrail::record_allocation(AllocatorKind::Free, 0x111, 0);
        tracker.stop().unwrap();
    });

    // The tracker blocks in accept until we connect.
    let mut reader = loop {
        match CaptureReader::from_port(port) {
            Ok(reader) => break reader,
            Err(_) => thread::sleep(std::time::Duration::from_millis(10)),
        }
    };

    let events: Vec<_> = reader.allocations().map(|event| event.unwrap()).collect();
    assert_eq!(events.len(), 3);
    tracker_thread.join().unwrap();

    // Socket headers keep placeholder stats; a scan recovers them.
    assert_eq!(reader.metadata().stats.n_allocations, 0);
    let recovered = reader.computed_stats().unwrap();
    assert_eq!(recovered.n_allocations, 3);
    assert_eq!(recovered.peak_memory, 100);

    let leaks = reader.leak_snapshot(true).unwrap();
    assert_eq!(leaks.len(), 1);
    assert_eq!(leaks[0].size, 60);
}

#[test]
fn test_interrupted_socket_start_is_cancellable() {
    let _session = session_lock();

    let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    let starter = thread::spawn(move || {
        Tracker::start(Destination::Port(port), TrackerConfig::embedded())
    });
    // Keep requesting cancellation until the pending start observes it;
    // start() clears the flag on entry, so a single set could be lost.
    while !starter.is_finished() {
        memtrail::cancel_pending_start();
        thread::sleep(std::time::Duration::from_millis(10));
    }

    match starter.join().unwrap() {
        Err(Error::AcceptCancelled) => {}
        other => panic!("expected AcceptCancelled, got {:?}", other.map(|_| ())),
    }
    assert!(!memtrail::is_active());
}
