//! Streaming record writer.
//!
//! One mutex guards the sink, the in-process buffer, the frame interner,
//! and the native-frame trie; critical sections are bounded by a single
//! record. Segment snapshots produced by `dlopen`/`dlclose` intercepts on
//! arbitrary threads arrive through a lock-free queue and are drained into
//! the stream before the next record, so segment generations always appear
//! ahead of the first event that references them.

use std::collections::HashMap;

use crossbeam_queue::SegQueue;

use crate::error::Result;
use crate::records::interner::{FrameId, FrameInterner};
use crate::records::sink::Sink;
use crate::records::{
    AllocationRecord, AllocatorClass, AllocatorKind, CaptureStats, ManagedFrame, RecordTag,
    FORMAT_VERSION, MAGIC,
};
use crate::report::intervals::IntervalTree;
use crate::report::tree::{FrameTree, NodeIndex, ROOT};
use crate::resolve::segments::SegmentSnapshot;
use crate::sync::mutex::Mutex;
use crate::util::time::timestamp_ms;

/// In-process buffer size; records are appended here and flushed to the
/// sink when the next record would not fit.
const BUFFER_CAPACITY: usize = 64 * 1024;

/// Options fixed for the lifetime of one capture session.
pub struct WriterOptions {
    pub native_traces: bool,
    pub pid: u32,
    pub command_line: String,
    /// Emit a MEMORY_SNAPSHOT every this many records; 0 disables sampling.
    pub memory_snapshot_every: usize,
}

/// Running mirror of the live heap, used only to stamp `peak_memory` into
/// the header without a reader-side pass.
struct RunningHeap {
    sizes: HashMap<u64, u64>,
    ranges: IntervalTree<()>,
    current: u64,
}

impl RunningHeap {
    fn new() -> Self {
        Self { sizes: HashMap::new(), ranges: IntervalTree::new(), current: 0 }
    }

    fn apply(&mut self, kind: AllocatorKind, address: u64, size: u64) {
        match kind.class() {
            AllocatorClass::SimpleAlloc => {
                self.sizes.insert(address, size);
                self.current += size;
            }
            AllocatorClass::SimpleDealloc => {
                if let Some(freed) = self.sizes.remove(&address) {
                    self.current = self.current.saturating_sub(freed);
                }
            }
            AllocatorClass::RangedAlloc => {
                self.ranges.add(address, size, ());
                self.current += size;
            }
            AllocatorClass::RangedDealloc => {
                let freed: u64 = self
                    .ranges
                    .remove(address, size)
                    .iter()
                    .map(|(range, _)| range.length())
                    .sum();
                self.current = self.current.saturating_sub(freed);
            }
        }
    }
}

struct WriterInner {
    sink: Box<dyn Sink>,
    buffer: Vec<u8>,
    interner: FrameInterner,
    native: FrameTree<u64>,
    heap: RunningHeap,
    stats: CaptureStats,
    stats_offset: u64,
    records_since_snapshot: usize,
    finalized: bool,
}

/// The capture-session record writer.
pub struct RecordWriter {
    inner: Mutex<WriterInner>,
    pending_segments: SegQueue<SegmentSnapshot>,
    native_traces: bool,
    memory_snapshot_every: usize,
}

impl RecordWriter {
    /// Open a session on `sink` and write the placeholder header.
    pub fn new(mut sink: Box<dyn Sink>, options: WriterOptions) -> Result<Self> {
        let stats = CaptureStats { start_time_ms: timestamp_ms(), ..CaptureStats::default() };

        let mut header = Vec::with_capacity(64 + options.command_line.len());
        header.extend_from_slice(&MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        header.push(options.native_traces as u8);
        header.extend_from_slice(&options.pid.to_le_bytes());
        header.extend_from_slice(options.command_line.as_bytes());
        header.push(0);
        let stats_offset = header.len() as u64;
        append_stats(&mut header, &stats);
        sink.write_all(&header)?;

        Ok(Self {
            inner: Mutex::new(WriterInner {
                sink,
                buffer: Vec::with_capacity(BUFFER_CAPACITY),
                interner: FrameInterner::new(),
                native: FrameTree::new(),
                heap: RunningHeap::new(),
                stats,
                stats_offset,
                records_since_snapshot: 0,
                finalized: false,
            }),
            pending_segments: SegQueue::new(),
            native_traces: options.native_traces,
            memory_snapshot_every: options.memory_snapshot_every,
        })
    }

    /// Whether native stacks belong in this capture.
    pub fn native_traces(&self) -> bool {
        self.native_traces
    }

    /// Queue a module-layout snapshot for emission. Callable from any
    /// thread without taking the writer lock.
    pub fn push_segment_snapshot(&self, snapshot: SegmentSnapshot) {
        self.pending_segments.push(snapshot);
    }

    /// Emit any queued segment snapshots immediately.
    pub fn flush_pending_segments(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.drain_segments(&mut inner)
    }

    /// Record one allocator event.
    ///
    /// `native_stack` is leaf-first as captured by the unwinder; it is
    /// interned into the native trie and referenced by id.
    pub fn write_allocation(
        &self,
        thread_id: u64,
        address: u64,
        size: u64,
        kind: AllocatorKind,
        line: u32,
        native_stack: &[u64],
        generation: u32,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        self.drain_segments(&mut inner)?;

        let native_frame_id = if native_stack.is_empty() {
            ROOT
        } else {
            intern_native(&mut inner, native_stack)?
        };

        let record = AllocationRecord {
            thread_id,
            address,
            size,
            kind,
            line,
            native_frame_id,
            generation,
        };
        let mut payload = [0u8; 37];
        payload[0..8].copy_from_slice(&record.thread_id.to_le_bytes());
        payload[8..16].copy_from_slice(&record.address.to_le_bytes());
        payload[16..24].copy_from_slice(&record.size.to_le_bytes());
        payload[24] = record.kind as u8;
        payload[25..29].copy_from_slice(&record.line.to_le_bytes());
        payload[29..33].copy_from_slice(&record.native_frame_id.to_le_bytes());
        payload[33..37].copy_from_slice(&record.generation.to_le_bytes());
        append_record(&mut inner, RecordTag::Allocation, &payload)?;

        inner.stats.n_allocations += 1;
        inner.heap.apply(kind, address, size);
        if inner.heap.current >= inner.stats.peak_memory {
            inner.stats.peak_memory = inner.heap.current;
        }

        self.maybe_sample(&mut inner)
    }

    /// Record a managed frame being entered on a thread. Interns the frame,
    /// emitting a FRAME_INDEX record the first time it is seen.
    pub fn write_frame_push(&self, thread_id: u64, frame: &ManagedFrame) -> Result<FrameId> {
        let mut inner = self.inner.lock();
        self.drain_segments(&mut inner)?;

        let (id, is_new) = inner.interner.intern(frame);
        if is_new {
            let mut payload = Vec::with_capacity(12 + frame.function.len() + frame.file.len());
            payload.extend_from_slice(&id.to_le_bytes());
            payload.extend_from_slice(frame.function.as_bytes());
            payload.push(0);
            payload.extend_from_slice(frame.file.as_bytes());
            payload.push(0);
            payload.extend_from_slice(&frame.line.to_le_bytes());
            append_variable_record(&mut inner, RecordTag::FrameIndex, &payload)?;
            inner.stats.n_frames = inner.interner.len() as u64;
        }

        let mut payload = [0u8; 12];
        payload[0..8].copy_from_slice(&thread_id.to_le_bytes());
        payload[8..12].copy_from_slice(&id.to_le_bytes());
        append_record(&mut inner, RecordTag::FramePush, &payload)?;
        self.maybe_sample(&mut inner)?;
        Ok(id)
    }

    /// Record a managed frame being left on a thread.
    pub fn write_frame_pop(&self, thread_id: u64, frame_id: FrameId) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut payload = [0u8; 12];
        payload[0..8].copy_from_slice(&thread_id.to_le_bytes());
        payload[8..12].copy_from_slice(&frame_id.to_le_bytes());
        append_record(&mut inner, RecordTag::FramePop, &payload)?;
        self.maybe_sample(&mut inner)
    }

    /// Flush the in-process buffer to the sink.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        flush_buffer(&mut inner)?;
        inner.sink.flush()?;
        Ok(())
    }

    /// Terminate the stream: drain segments, write END, flush, and rewrite
    /// the header stats in place when the sink can seek.
    pub fn finalize(&self) -> Result<CaptureStats> {
        let mut inner = self.inner.lock();
        if inner.finalized {
            return Ok(inner.stats);
        }
        self.drain_segments(&mut inner)?;
        append_record(&mut inner, RecordTag::End, &[])?;
        flush_buffer(&mut inner)?;

        inner.stats.end_time_ms = timestamp_ms();
        let offset = inner.stats_offset;
        if inner.sink.seek_to(offset)? {
            let mut bytes = Vec::with_capacity(40);
            append_stats(&mut bytes, &inner.stats);
            inner.sink.write_all(&bytes)?;
        }
        inner.sink.flush()?;
        inner.finalized = true;
        Ok(inner.stats)
    }

    fn drain_segments(&self, inner: &mut WriterInner) -> Result<()> {
        while let Some(snapshot) = self.pending_segments.pop() {
            for module in &snapshot.modules {
                let mut payload = Vec::with_capacity(17 + module.filename.len());
                payload.extend_from_slice(module.filename.as_bytes());
                payload.push(0);
                payload.extend_from_slice(&(module.segments.len() as u32).to_le_bytes());
                payload.extend_from_slice(&module.base_address.to_le_bytes());
                payload.extend_from_slice(&snapshot.generation.to_le_bytes());
                append_variable_record(inner, RecordTag::SegmentHeader, &payload)?;

                for &(start, end) in &module.segments {
                    let mut seg = [0u8; 16];
                    seg[0..8].copy_from_slice(&start.to_le_bytes());
                    seg[8..16].copy_from_slice(&end.to_le_bytes());
                    append_record(inner, RecordTag::Segment, &seg)?;
                }
            }
        }
        Ok(())
    }

    fn maybe_sample(&self, inner: &mut WriterInner) -> Result<()> {
        if self.memory_snapshot_every == 0 {
            return Ok(());
        }
        inner.records_since_snapshot += 1;
        if inner.records_since_snapshot < self.memory_snapshot_every {
            return Ok(());
        }
        inner.records_since_snapshot = 0;
        let mut payload = [0u8; 16];
        payload[0..8].copy_from_slice(&timestamp_ms().to_le_bytes());
        payload[8..16].copy_from_slice(&inner.heap.current.to_le_bytes());
        append_record(inner, RecordTag::MemorySnapshot, &payload)
    }
}

/// Intern a leaf-first native stack, emitting NATIVE_FRAME_INDEX records
/// for nodes created now. Ids are the trie indices, dense from 1.
fn intern_native(inner: &mut WriterInner, leaf_first: &[u64]) -> Result<NodeIndex> {
    let root_first: Vec<u64> = leaf_first.iter().rev().copied().collect();

    // The borrow checker will not let the emit callback touch the buffer
    // while the trie is borrowed, so collect new nodes first.
    let mut new_nodes: Vec<(u64, NodeIndex)> = Vec::new();
    let id = inner
        .native
        .index_of_with(&root_first, |_index, ip, parent| new_nodes.push((ip, parent)));

    for (ip, parent) in new_nodes {
        let mut payload = [0u8; 12];
        payload[0..8].copy_from_slice(&ip.to_le_bytes());
        payload[8..12].copy_from_slice(&parent.to_le_bytes());
        append_record(inner, RecordTag::NativeFrameIndex, &payload)?;
    }
    Ok(id)
}

fn append_stats(out: &mut Vec<u8>, stats: &CaptureStats) {
    out.extend_from_slice(&stats.start_time_ms.to_le_bytes());
    out.extend_from_slice(&stats.end_time_ms.to_le_bytes());
    out.extend_from_slice(&stats.n_allocations.to_le_bytes());
    out.extend_from_slice(&stats.n_frames.to_le_bytes());
    out.extend_from_slice(&stats.peak_memory.to_le_bytes());
}

fn append_record(inner: &mut WriterInner, tag: RecordTag, payload: &[u8]) -> Result<()> {
    // A write racing the end of the session is dropped, not appended to a
    // stream that already carries its END marker.
    if inner.finalized {
        return Ok(());
    }
    reserve(inner, 1 + payload.len())?;
    inner.buffer.push(tag as u8);
    inner.buffer.extend_from_slice(payload);
    Ok(())
}

fn append_variable_record(inner: &mut WriterInner, tag: RecordTag, payload: &[u8]) -> Result<()> {
    if inner.finalized {
        return Ok(());
    }
    reserve(inner, 5 + payload.len())?;
    inner.buffer.push(tag as u8);
    inner.buffer.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    inner.buffer.extend_from_slice(payload);
    Ok(())
}

fn reserve(inner: &mut WriterInner, needed: usize) -> Result<()> {
    if inner.buffer.len() + needed > BUFFER_CAPACITY {
        flush_buffer(inner)?;
    }
    Ok(())
}

fn flush_buffer(inner: &mut WriterInner) -> Result<()> {
    if !inner.buffer.is_empty() {
        let WriterInner { sink, buffer, .. } = inner;
        sink.write_all(buffer)?;
        buffer.clear();
    }
    Ok(())
}
