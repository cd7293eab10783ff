//! Binary capture format: typed records, tags, and the wire-level types
//! shared by the writer and the reader.
//!
//! A capture is a header followed by a stream of tagged records. Every
//! numeric field is little-endian with a fixed width; strings are
//! NUL-terminated UTF-8. Fixed records carry their payload directly after
//! the tag byte; variable records carry a `u32` payload length first.

pub(crate) mod interner;
pub mod reader;
pub(crate) mod sink;
pub(crate) mod writer;

use crate::error::Error;

/// Leading magic bytes of every capture.
pub const MAGIC: [u8; 4] = *b"memr";

/// Current format version. Bumped on any wire-incompatible change.
pub const FORMAT_VERSION: u16 = 3;

/// Upper bound on a variable record's payload, to reject corrupt lengths
/// before allocating.
pub(crate) const MAX_VARIABLE_PAYLOAD: u32 = 1 << 20;

/// One-byte tag identifying each record in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordTag {
    /// A single allocator event.
    Allocation = 1,
    /// A newly interned managed frame.
    FrameIndex = 2,
    /// Managed stack delta: a frame was entered on a thread.
    FramePush = 3,
    /// Managed stack delta: a frame was left on a thread.
    FramePop = 4,
    /// A newly interned native frame (instruction pointer + parent).
    NativeFrameIndex = 5,
    /// Start of one shared object's segment list for a generation.
    SegmentHeader = 6,
    /// One address range belonging to the preceding segment header.
    Segment = 7,
    /// Periodic total-heap sample.
    MemorySnapshot = 8,
    /// End-of-stream sentinel.
    End = 255,
}

impl TryFrom<u8> for RecordTag {
    type Error = Error;

    fn try_from(raw: u8) -> Result<Self, Error> {
        Ok(match raw {
            1 => RecordTag::Allocation,
            2 => RecordTag::FrameIndex,
            3 => RecordTag::FramePush,
            4 => RecordTag::FramePop,
            5 => RecordTag::NativeFrameIndex,
            6 => RecordTag::SegmentHeader,
            7 => RecordTag::Segment,
            8 => RecordTag::MemorySnapshot,
            255 => RecordTag::End,
            other => return Err(Error::UnknownRecordTag(other)),
        })
    }
}

/// Which instrumented allocator function produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AllocatorKind {
    Malloc = 1,
    Free = 2,
    Calloc = 3,
    Realloc = 4,
    PosixMemalign = 5,
    Memalign = 6,
    Valloc = 7,
    Pvalloc = 8,
    Mmap = 9,
    Munmap = 10,
}

/// Whether an allocator event is a point allocation, a point deallocation,
/// or operates on a length-carrying range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorClass {
    SimpleAlloc,
    SimpleDealloc,
    RangedAlloc,
    RangedDealloc,
}

impl AllocatorKind {
    /// Classify this kind for aggregation.
    pub fn class(self) -> AllocatorClass {
        match self {
            AllocatorKind::Malloc
            | AllocatorKind::Calloc
            | AllocatorKind::Realloc
            | AllocatorKind::PosixMemalign
            | AllocatorKind::Memalign
            | AllocatorKind::Valloc
            | AllocatorKind::Pvalloc => AllocatorClass::SimpleAlloc,
            AllocatorKind::Free => AllocatorClass::SimpleDealloc,
            AllocatorKind::Mmap => AllocatorClass::RangedAlloc,
            AllocatorKind::Munmap => AllocatorClass::RangedDealloc,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => AllocatorKind::Malloc,
            2 => AllocatorKind::Free,
            3 => AllocatorKind::Calloc,
            4 => AllocatorKind::Realloc,
            5 => AllocatorKind::PosixMemalign,
            6 => AllocatorKind::Memalign,
            7 => AllocatorKind::Valloc,
            8 => AllocatorKind::Pvalloc,
            9 => AllocatorKind::Mmap,
            10 => AllocatorKind::Munmap,
            _ => return None,
        })
    }
}

/// One allocator event as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    /// OS thread that performed the call.
    pub thread_id: u64,

    /// Address returned by (or passed to) the allocator.
    pub address: u64,

    /// Requested size; 0 for simple deallocations, mapped length for ranged
    /// events.
    pub size: u64,

    /// Which allocator function fired.
    pub kind: AllocatorKind,

    /// Line executing in the innermost managed frame at event time.
    pub line: u32,

    /// Native stack id (0 when native traces are disabled or empty).
    pub native_frame_id: u32,

    /// Segment-map generation the native stack was captured under.
    pub generation: u32,
}

/// A managed-runtime frame after interning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedFrame {
    /// Function (or method) name.
    pub function: String,

    /// Source file the function lives in.
    pub file: String,

    /// Line attributed to the frame when it was first seen.
    pub line: u32,
}

impl ManagedFrame {
    /// Convenience constructor used throughout the tests.
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self { function: function.into(), file: file.into(), line }
    }
}

/// Aggregate statistics stored in the header.
///
/// Written as placeholders at start and rewritten at stop on seekable sinks;
/// socket captures keep the placeholders and are recovered by scanning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Wall-clock capture start, ms since the Unix epoch.
    pub start_time_ms: u64,

    /// Wall-clock capture end, ms since the Unix epoch.
    pub end_time_ms: u64,

    /// Number of ALLOCATION records written.
    pub n_allocations: u64,

    /// Number of interned managed frames.
    pub n_frames: u64,

    /// Peak of the running live-heap counter.
    pub peak_memory: u64,
}

/// The capture header: first record of the file, rewritten last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Format version the capture was written with.
    pub version: u16,

    /// Whether native stacks were captured.
    pub native_traces: bool,

    /// Pid of the traced process.
    pub pid: u32,

    /// Command line of the traced process.
    pub command_line: String,

    /// Aggregate statistics (placeholders on unseekable sinks).
    pub stats: CaptureStats,
}

/// One periodic total-heap sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSample {
    /// Wall-clock time of the sample, ms since the Unix epoch.
    pub timestamp_ms: u64,

    /// Live heap at sample time, per the writer's running counter.
    pub heap_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip() {
        for tag in [
            RecordTag::Allocation,
            RecordTag::FrameIndex,
            RecordTag::FramePush,
            RecordTag::FramePop,
            RecordTag::NativeFrameIndex,
            RecordTag::SegmentHeader,
            RecordTag::Segment,
            RecordTag::MemorySnapshot,
            RecordTag::End,
        ] {
            assert_eq!(RecordTag::try_from(tag as u8).unwrap(), tag);
        }
        assert!(RecordTag::try_from(0).is_err());
        assert!(RecordTag::try_from(42).is_err());
    }

    #[test]
    fn test_allocator_classes() {
        assert_eq!(AllocatorKind::Malloc.class(), AllocatorClass::SimpleAlloc);
        assert_eq!(AllocatorKind::Pvalloc.class(), AllocatorClass::SimpleAlloc);
        assert_eq!(AllocatorKind::Free.class(), AllocatorClass::SimpleDealloc);
        assert_eq!(AllocatorKind::Mmap.class(), AllocatorClass::RangedAlloc);
        assert_eq!(AllocatorKind::Munmap.class(), AllocatorClass::RangedDealloc);
    }

    #[test]
    fn test_allocator_kind_round_trip() {
        for raw in 1..=10u8 {
            let kind = AllocatorKind::from_u8(raw).unwrap();
            assert_eq!(kind as u8, raw);
        }
        assert!(AllocatorKind::from_u8(0).is_none());
        assert!(AllocatorKind::from_u8(11).is_none());
    }
}
