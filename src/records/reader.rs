//! Capture parsing and the query API.
//!
//! The reader is forward-only and keeps bounded state: the rebuilt frame
//! tables, per-thread stacks, and the segment map - never the raw stream.
//! Decoded allocation events are additionally cached in order, because
//! every snapshot view is defined over random event indices.

use std::collections::HashMap;
use std::io::{BufReader, Read};
use std::net::TcpStream;
use std::path::Path;

use crate::error::{Error, Result};
use crate::records::interner::FrameInterner;
use crate::records::{
    AllocationRecord, AllocatorKind, CaptureStats, Header, HeapSample, ManagedFrame, RecordTag,
    FORMAT_VERSION, MAGIC, MAX_VARIABLE_PAYLOAD,
};
use crate::report::aggregate::{self, Allocation, HighWatermark, SnapshotEntry};
use crate::report::tree::{FrameTree, NodeIndex};
use crate::resolve::segments::{ModuleSegments, SegmentMap};
use crate::resolve::symbolize::{ResolvedNativeFrame, SymbolResolver};

/// Reads one capture and answers queries over it.
pub struct CaptureReader {
    source: Box<dyn Read + Send>,
    header: Header,

    /// Frames exactly as interned by the writer, keyed by wire id.
    wire_frames: FrameInterner,

    /// Reader-local interner feeding the frame tree; holds the wire frames
    /// plus line-patched variants synthesized per allocation.
    stack_frames: FrameInterner,

    tree: FrameTree<u32>,
    native: FrameTree<u64>,
    segments: SegmentMap,
    samples: Vec<HeapSample>,
    thread_stacks: HashMap<u64, Vec<u32>>,
    pending_module: Option<(u32, ModuleSegments, u32)>,
    events: Vec<Allocation>,
    finished: bool,
    resolver: SymbolResolver,
}

impl CaptureReader {
    /// Open a capture file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_source(Box::new(BufReader::new(file)))
    }

    /// Connect to a live tracker streaming on `port` (localhost).
    pub fn from_port(port: u16) -> Result<Self> {
        let stream = TcpStream::connect(("127.0.0.1", port))?;
        Self::from_source(Box::new(BufReader::new(stream)))
    }

    /// Read from an arbitrary byte source (already positioned at the
    /// header).
    pub fn from_source(mut source: Box<dyn Read + Send>) -> Result<Self> {
        let header = read_header(&mut source)?;
        Ok(Self {
            source,
            header,
            wire_frames: FrameInterner::new(),
            stack_frames: FrameInterner::new(),
            tree: FrameTree::new(),
            native: FrameTree::new(),
            segments: SegmentMap::new(),
            samples: Vec::new(),
            thread_stacks: HashMap::new(),
            pending_module: None,
            events: Vec::new(),
            finished: false,
            resolver: SymbolResolver::new(),
        })
    }

    /// The capture header. Stats are placeholders when the capture was
    /// streamed over a socket; see [`computed_stats`](Self::computed_stats).
    pub fn metadata(&self) -> &Header {
        &self.header
    }

    /// Lazy, single-pass sequence of decoded allocation events.
    pub fn allocations(&mut self) -> Allocations<'_> {
        Allocations { reader: self }
    }

    /// Decode records until the next allocation event (or end of stream).
    pub fn next_allocation(&mut self) -> Result<Option<Allocation>> {
        loop {
            if self.finished {
                return Ok(None);
            }
            let tag = match read_tag(&mut self.source)? {
                // A socket closing between records is a legal end.
                None => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(tag) => tag,
            };

            match tag {
                RecordTag::End => {
                    self.finished = true;
                    return Ok(None);
                }
                RecordTag::Allocation => {
                    let event = self.read_allocation()?;
                    self.events.push(event.clone());
                    return Ok(Some(event));
                }
                RecordTag::FrameIndex => self.read_frame_index()?,
                RecordTag::FramePush => {
                    let (thread_id, frame_id) = self.read_stack_delta(tag)?;
                    self.thread_stacks.entry(thread_id).or_default().push(frame_id);
                }
                RecordTag::FramePop => {
                    let (thread_id, _frame_id) = self.read_stack_delta(tag)?;
                    if let Some(stack) = self.thread_stacks.get_mut(&thread_id) {
                        stack.pop();
                    }
                }
                RecordTag::NativeFrameIndex => {
                    let mut payload = [0u8; 12];
                    read_payload(&mut self.source, &mut payload, tag)?;
                    let ip = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                    let parent = u32::from_le_bytes(payload[8..12].try_into().unwrap());
                    self.native.push_node(ip, parent);
                }
                RecordTag::SegmentHeader => self.read_segment_header()?,
                RecordTag::Segment => {
                    let mut payload = [0u8; 16];
                    read_payload(&mut self.source, &mut payload, tag)?;
                    let start = u64::from_le_bytes(payload[0..8].try_into().unwrap());
                    let end = u64::from_le_bytes(payload[8..16].try_into().unwrap());
                    self.read_segment(start, end);
                }
                RecordTag::MemorySnapshot => {
                    let mut payload = [0u8; 16];
                    read_payload(&mut self.source, &mut payload, tag)?;
                    self.samples.push(HeapSample {
                        timestamp_ms: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
                        heap_bytes: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
                    });
                }
            }
        }
    }

    fn read_allocation(&mut self) -> Result<Allocation> {
        let mut payload = [0u8; 37];
        read_payload(&mut self.source, &mut payload, RecordTag::Allocation)?;

        let kind_raw = payload[24];
        let kind = AllocatorKind::from_u8(kind_raw)
            .ok_or(Error::UnknownRecordTag(kind_raw))?;
        let record = AllocationRecord {
            thread_id: u64::from_le_bytes(payload[0..8].try_into().unwrap()),
            address: u64::from_le_bytes(payload[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(payload[16..24].try_into().unwrap()),
            kind,
            line: u32::from_le_bytes(payload[25..29].try_into().unwrap()),
            native_frame_id: u32::from_le_bytes(payload[29..33].try_into().unwrap()),
            generation: u32::from_le_bytes(payload[33..37].try_into().unwrap()),
        };
        let stack_id = self.stack_id_for(record.thread_id, record.line);
        Ok(Allocation { record, stack_id, n_allocations: 1 })
    }

    /// Intern the thread's current stack into the frame tree, substituting
    /// the event's line into the innermost frame.
    fn stack_id_for(&mut self, thread_id: u64, line: u32) -> NodeIndex {
        let Some(stack) = self.thread_stacks.get(&thread_id) else {
            return crate::report::tree::ROOT;
        };
        let depth = stack.len();
        let mut keys = Vec::with_capacity(depth);
        for (position, &wire_id) in stack.iter().enumerate() {
            let frame = match self.wire_frames.get(wire_id) {
                Some(frame) => frame.clone(),
                None => ManagedFrame::new("<unknown>", "<unknown>", 0),
            };
            let frame = if position + 1 == depth && line != 0 && frame.line != line {
                ManagedFrame { line, ..frame }
            } else {
                frame
            };
            let (key, _) = self.stack_frames.intern(&frame);
            keys.push(key);
        }
        self.tree.index_of(&keys)
    }

    fn read_frame_index(&mut self) -> Result<()> {
        let payload = read_variable(&mut self.source, RecordTag::FrameIndex)?;
        if payload.len() < 10 {
            return Err(Error::TruncatedRecord(RecordTag::FrameIndex as u8));
        }
        let id = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let (function, rest) = split_nul(&payload[4..])?;
        let (file, rest) = split_nul(rest)?;
        if rest.len() < 4 {
            return Err(Error::TruncatedRecord(RecordTag::FrameIndex as u8));
        }
        let line = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        self.wire_frames.insert_with_id(
            id,
            ManagedFrame { function: function.to_string(), file: file.to_string(), line },
        );
        Ok(())
    }

    fn read_stack_delta(&mut self, tag: RecordTag) -> Result<(u64, u32)> {
        let mut payload = [0u8; 12];
        read_payload(&mut self.source, &mut payload, tag)?;
        Ok((
            u64::from_le_bytes(payload[0..8].try_into().unwrap()),
            u32::from_le_bytes(payload[8..12].try_into().unwrap()),
        ))
    }

    fn read_segment_header(&mut self) -> Result<()> {
        self.flush_pending_module();
        let payload = read_variable(&mut self.source, RecordTag::SegmentHeader)?;
        let (filename, rest) = split_nul(&payload)?;
        if rest.len() < 16 {
            return Err(Error::TruncatedRecord(RecordTag::SegmentHeader as u8));
        }
        let num_segments = u32::from_le_bytes(rest[0..4].try_into().unwrap());
        let base_address = u64::from_le_bytes(rest[4..12].try_into().unwrap());
        let generation = u32::from_le_bytes(rest[12..16].try_into().unwrap());

        let module = ModuleSegments {
            filename: filename.to_string(),
            base_address,
            segments: Vec::new(),
        };
        if num_segments == 0 {
            self.segments.add_module(generation, module);
        } else {
            self.pending_module = Some((generation, module, num_segments));
        }
        Ok(())
    }

    fn read_segment(&mut self, start: u64, end: u64) {
        match self.pending_module.as_mut() {
            Some((_, module, remaining)) => {
                module.segments.push((start, end));
                *remaining -= 1;
                if *remaining == 0 {
                    self.flush_pending_module();
                }
            }
            // A segment with no preceding header carries no usable context.
            None => log::debug!("ignoring stray segment record [{start:#x}, {end:#x})"),
        }
    }

    fn flush_pending_module(&mut self) {
        if let Some((generation, module, _)) = self.pending_module.take() {
            self.segments.add_module(generation, module);
        }
    }

    /// Drain the rest of the stream into the event cache.
    fn ensure_loaded(&mut self) -> Result<()> {
        while self.next_allocation()?.is_some() {}
        Ok(())
    }

    /// Aggregate stats recomputed by scanning, for captures whose header
    /// still holds placeholders (socket sinks cannot seek back).
    pub fn computed_stats(&mut self) -> Result<CaptureStats> {
        self.ensure_loaded()?;
        let peak = aggregate::find_high_watermark(&self.events);
        Ok(CaptureStats {
            start_time_ms: self.header.stats.start_time_ms,
            end_time_ms: self.header.stats.end_time_ms,
            n_allocations: self.events.len() as u64,
            n_frames: self.wire_frames.len() as u64,
            peak_memory: peak.peak_memory,
        })
    }

    /// Index and size of the live heap's maximum.
    pub fn high_watermark(&mut self) -> Result<HighWatermark> {
        self.ensure_loaded()?;
        Ok(aggregate::find_high_watermark(&self.events))
    }

    /// The live set when heap usage peaked, grouped by stack (and thread).
    pub fn high_watermark_snapshot(&mut self, merge_threads: bool) -> Result<Vec<SnapshotEntry>> {
        self.ensure_loaded()?;
        let peak = aggregate::find_high_watermark(&self.events);
        Ok(aggregate::snapshot_at(&self.events, peak.index, merge_threads))
    }

    /// Allocations never freed before the capture ended.
    pub fn leak_snapshot(&mut self, merge_threads: bool) -> Result<Vec<SnapshotEntry>> {
        self.ensure_loaded()?;
        Ok(aggregate::leak_snapshot(&self.events, merge_threads))
    }

    /// Allocations freed within `threshold` events of being made.
    pub fn temporary_allocations(
        &mut self,
        threshold: usize,
        merge_threads: bool,
    ) -> Result<Vec<SnapshotEntry>> {
        self.ensure_loaded()?;
        Ok(aggregate::temporary_allocations(&self.events, threshold, merge_threads))
    }

    /// Aggregate view of an event-index window.
    pub fn snapshot_between(
        &mut self,
        start: usize,
        end: usize,
        merge_threads: bool,
    ) -> Result<Vec<SnapshotEntry>> {
        self.ensure_loaded()?;
        Ok(aggregate::snapshot_between(&self.events, start, end, merge_threads))
    }

    /// Periodic heap samples, if the writer emitted them.
    pub fn heap_timeline(&mut self) -> Result<&[HeapSample]> {
        self.ensure_loaded()?;
        Ok(&self.samples)
    }

    /// Number of distinct segment generations seen so far.
    pub fn generation_count(&mut self) -> Result<usize> {
        self.ensure_loaded()?;
        Ok(self.segments.generation_count())
    }

    /// Reconstruct a managed stack, innermost frame first.
    pub fn resolve_stack(&self, stack_id: NodeIndex, max_depth: usize) -> Result<Vec<ManagedFrame>> {
        if stack_id as usize >= self.tree.len() {
            return Err(Error::UnknownStackId(stack_id));
        }
        Ok(self
            .tree
            .walk_up(stack_id, max_depth)
            .into_iter()
            .map(|key| {
                self.stack_frames
                    .get(key)
                    .cloned()
                    .unwrap_or_else(|| ManagedFrame::new("<unknown>", "<unknown>", 0))
            })
            .collect())
    }

    /// Resolve a native stack id against the segments of `generation`,
    /// innermost frame first. IPs that resolve to nothing yield
    /// `<unknown>` placeholder frames rather than errors.
    pub fn resolve_native_stack(
        &mut self,
        native_frame_id: NodeIndex,
        generation: u32,
        max_depth: usize,
    ) -> Result<Vec<ResolvedNativeFrame>> {
        if native_frame_id as usize >= self.native.len() {
            return Err(Error::UnknownStackId(native_frame_id));
        }
        let ips = self.native.walk_up(native_frame_id, max_depth);
        let mut frames = Vec::with_capacity(ips.len());
        for ip in ips {
            frames.extend(self.resolver.resolve(ip, generation, &self.segments));
        }
        Ok(frames)
    }
}

/// Iterator over decoded allocation events; see
/// [`CaptureReader::allocations`].
pub struct Allocations<'a> {
    reader: &'a mut CaptureReader,
}

impl Iterator for Allocations<'_> {
    type Item = Result<Allocation>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_allocation().transpose()
    }
}

fn read_header(source: &mut dyn Read) -> Result<Header> {
    let mut magic = [0u8; 4];
    source.read_exact(&mut magic).map_err(|_| Error::BadMagic)?;
    if magic != MAGIC {
        return Err(Error::BadMagic);
    }

    let mut fixed = [0u8; 7];
    source
        .read_exact(&mut fixed)
        .map_err(|_| Error::TruncatedRecord(0))?;
    let version = u16::from_le_bytes(fixed[0..2].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(Error::UnsupportedVersion(version));
    }
    let native_traces = fixed[2] != 0;
    let pid = u32::from_le_bytes(fixed[3..7].try_into().unwrap());

    let mut command_line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        source.read_exact(&mut byte).map_err(|_| Error::TruncatedRecord(0))?;
        if byte[0] == 0 {
            break;
        }
        if command_line.len() as u32 >= MAX_VARIABLE_PAYLOAD {
            return Err(Error::OversizedRecord {
                got: command_line.len() as u32,
                limit: MAX_VARIABLE_PAYLOAD,
            });
        }
        command_line.push(byte[0]);
    }
    let command_line = String::from_utf8(command_line).map_err(|_| Error::InvalidString)?;

    let mut stats_bytes = [0u8; 40];
    source
        .read_exact(&mut stats_bytes)
        .map_err(|_| Error::TruncatedRecord(0))?;
    let stats = CaptureStats {
        start_time_ms: u64::from_le_bytes(stats_bytes[0..8].try_into().unwrap()),
        end_time_ms: u64::from_le_bytes(stats_bytes[8..16].try_into().unwrap()),
        n_allocations: u64::from_le_bytes(stats_bytes[16..24].try_into().unwrap()),
        n_frames: u64::from_le_bytes(stats_bytes[24..32].try_into().unwrap()),
        peak_memory: u64::from_le_bytes(stats_bytes[32..40].try_into().unwrap()),
    };

    Ok(Header { version, native_traces, pid, command_line, stats })
}

/// Read the next tag byte; `None` on a clean end-of-stream.
fn read_tag(source: &mut dyn Read) -> Result<Option<RecordTag>> {
    let mut byte = [0u8; 1];
    loop {
        return match source.read(&mut byte) {
            Ok(0) => Ok(None),
            Ok(_) => RecordTag::try_from(byte[0]).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => Err(Error::Io(err)),
        };
    }
}

/// Read a fixed payload, mapping short reads to [`Error::TruncatedRecord`].
fn read_payload(source: &mut dyn Read, buffer: &mut [u8], tag: RecordTag) -> Result<()> {
    source.read_exact(buffer).map_err(|err| match err.kind() {
        std::io::ErrorKind::UnexpectedEof => Error::TruncatedRecord(tag as u8),
        _ => Error::Io(err),
    })
}

/// Read a length-prefixed payload, rejecting implausible lengths before
/// allocating.
fn read_variable(source: &mut dyn Read, tag: RecordTag) -> Result<Vec<u8>> {
    let mut length_bytes = [0u8; 4];
    read_payload(source, &mut length_bytes, tag)?;
    let length = u32::from_le_bytes(length_bytes);
    if length > MAX_VARIABLE_PAYLOAD {
        return Err(Error::OversizedRecord { got: length, limit: MAX_VARIABLE_PAYLOAD });
    }
    let mut payload = vec![0u8; length as usize];
    read_payload(source, &mut payload, tag)?;
    Ok(payload)
}

/// Split a NUL-terminated UTF-8 string off the front of a payload.
fn split_nul(payload: &[u8]) -> Result<(&str, &[u8])> {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or(Error::InvalidString)?;
    let text = std::str::from_utf8(&payload[..nul]).map_err(|_| Error::InvalidString)?;
    Ok((text, &payload[nul + 1..]))
}
