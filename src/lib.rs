//! # memtrail
//!
//! Allocation-tracing heap profiler core for managed-runtime processes.
//!
//! ## Features
//!
//! - Process-wide allocator interception (malloc family + mmap/munmap)
//!   via relocation-table patching
//! - Merged call stacks: a per-thread managed-stack mirror plus bounded
//!   native unwinding, with deferred symbolification
//! - Self-describing binary captures with frame interning and a
//!   prefix-shared call tree, to a file or a socket
//! - Snapshot analysis: high-water mark, leaks, temporary allocations,
//!   and time-window views
//! - dlopen/dlclose aware: segment generations keep old instruction
//!   pointers resolvable after the module map changes
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use memtrail::{CaptureReader, Destination, Tracker, TrackerConfig};
//!
//! # fn main() -> memtrail::Result<()> {
//! let tracker = Tracker::start(
//!     Destination::path("app.memtrail"),
//!     TrackerConfig::default(),
//! )?;
//! // ... run the workload ...
//! tracker.stop()?;
//!
//! let mut reader = CaptureReader::open("app.memtrail")?;
//! for entry in reader.high_watermark_snapshot(true)? {
//!     println!("{} bytes in {} allocations", entry.size, entry.n_allocations);
//! }
//! # Ok(())
//! # }
//! ```

// Internal modules
mod error;
mod sync;
mod util;

#[cfg(target_os = "linux")]
mod hooks;

// Capture format, analysis, and resolution layers
pub mod records;
pub mod report;
pub mod resolve;
pub mod tracking;

// Re-export the primary API surface
pub use error::{Error, Result};
pub use records::reader::CaptureReader;
pub use records::{
    AllocationRecord, AllocatorClass, AllocatorKind, CaptureStats, Header, HeapSample,
    ManagedFrame,
};
pub use report::aggregate::{Allocation, HighWatermark, SnapshotEntry, ALL_THREADS};
pub use resolve::symbolize::{DebuginfodConfig, ResolvedNativeFrame, SymbolResolver};
pub use tracking::shadow::{current_thread_id, prime_stack, profile_event, ProfileEvent};
pub use tracking::tracker::{
    cancel_pending_start, is_active, record_allocation, set_thread_init_hook, Destination,
    Tracker, TrackerConfig,
};
