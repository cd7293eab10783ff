//! Event replay and snapshot reduction.
//!
//! All views are defined over the ordered sequence of decoded allocation
//! events: replay a prefix against a pointer index plus an interval tree,
//! then group whatever is still live by `(stack_id, thread_id)`.

use std::collections::HashMap;

use crate::records::{AllocationRecord, AllocatorClass};
use crate::report::intervals::IntervalTree;
use crate::report::tree::NodeIndex;

/// Thread id used for all entries when threads are merged.
pub const ALL_THREADS: u64 = u64::MAX;

/// One decoded allocator event, enriched with its interned stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    /// The wire-level event.
    pub record: AllocationRecord,

    /// Terminal frame-tree index of the managed stack at event time.
    pub stack_id: NodeIndex,

    /// Starts at 1; summed during aggregation.
    pub n_allocations: usize,
}

/// One row of a snapshot: live size and count under a stack (and thread).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub stack_id: NodeIndex,
    pub thread_id: u64,
    pub size: u64,
    pub n_allocations: usize,
}

/// Peak of the live-heap counter over a full pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HighWatermark {
    /// Index of the event at which the heap was maximal (the last such
    /// event when the peak is reached repeatedly).
    pub index: usize,

    /// Live heap size at that event.
    pub peak_memory: u64,
}

/// Replay state: the live heap at some point in the event stream.
pub(crate) struct LiveHeap {
    pointers: HashMap<u64, Allocation>,
    ranges: IntervalTree<Allocation>,
    current_memory: u64,
}

impl LiveHeap {
    pub(crate) fn new() -> Self {
        Self {
            pointers: HashMap::new(),
            ranges: IntervalTree::new(),
            current_memory: 0,
        }
    }

    pub(crate) fn current_memory(&self) -> u64 {
        self.current_memory
    }

    /// Apply one event.
    pub(crate) fn apply(&mut self, event: &Allocation) {
        let record = &event.record;
        match record.kind.class() {
            AllocatorClass::SimpleAlloc => {
                self.pointers.insert(record.address, event.clone());
                self.current_memory += record.size;
            }
            AllocatorClass::SimpleDealloc => {
                // Unknown addresses are legal: the matching allocation may
                // predate the capture.
                if let Some(freed) = self.pointers.remove(&record.address) {
                    self.current_memory =
                        self.current_memory.saturating_sub(freed.record.size);
                }
            }
            AllocatorClass::RangedAlloc => {
                self.ranges.add(record.address, record.size, event.clone());
                self.current_memory += record.size;
            }
            AllocatorClass::RangedDealloc => {
                let freed: u64 = self
                    .ranges
                    .remove(record.address, record.size)
                    .iter()
                    .map(|(range, _)| range.length())
                    .sum();
                self.current_memory = self.current_memory.saturating_sub(freed);
            }
        }
    }

    /// Reduce the live set by `(stack_id, thread_id)`.
    fn reduce(&self, merge_threads: bool) -> Vec<SnapshotEntry> {
        let mut groups: HashMap<(NodeIndex, u64), (u64, usize)> = HashMap::new();
        let key = |event: &Allocation| {
            let thread = if merge_threads { ALL_THREADS } else { event.record.thread_id };
            (event.stack_id, thread)
        };

        for event in self.pointers.values() {
            let slot = groups.entry(key(event)).or_insert((0, 0));
            slot.0 += event.record.size;
            slot.1 += event.n_allocations;
        }
        // Ranged entries contribute the lengths still live under the stack.
        for (range, event) in self.ranges.iter() {
            let slot = groups.entry(key(event)).or_insert((0, 0));
            slot.0 += range.length();
            slot.1 += event.n_allocations;
        }

        sorted_entries(groups)
    }
}

fn sorted_entries(groups: HashMap<(NodeIndex, u64), (u64, usize)>) -> Vec<SnapshotEntry> {
    let mut entries: Vec<SnapshotEntry> = groups
        .into_iter()
        .map(|((stack_id, thread_id), (size, n_allocations))| SnapshotEntry {
            stack_id,
            thread_id,
            size,
            n_allocations,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.size
            .cmp(&a.size)
            .then(a.stack_id.cmp(&b.stack_id))
            .then(a.thread_id.cmp(&b.thread_id))
    });
    entries
}

/// Single forward pass locating the heap's high-water mark.
pub fn find_high_watermark(events: &[Allocation]) -> HighWatermark {
    let mut heap = LiveHeap::new();
    let mut peak = HighWatermark { index: 0, peak_memory: 0 };
    for (index, event) in events.iter().enumerate() {
        heap.apply(event);
        if heap.current_memory() >= peak.peak_memory {
            peak = HighWatermark { index, peak_memory: heap.current_memory() };
        }
    }
    peak
}

/// Live allocations after replaying events `0..=index`, grouped by stack
/// (and thread unless merged).
pub fn snapshot_at(events: &[Allocation], index: usize, merge_threads: bool) -> Vec<SnapshotEntry> {
    let mut heap = LiveHeap::new();
    for event in events.iter().take(index.saturating_add(1)) {
        heap.apply(event);
    }
    heap.reduce(merge_threads)
}

/// Allocations never matched by a deallocation: the snapshot at the final
/// event.
pub fn leak_snapshot(events: &[Allocation], merge_threads: bool) -> Vec<SnapshotEntry> {
    if events.is_empty() {
        return Vec::new();
    }
    snapshot_at(events, events.len() - 1, merge_threads)
}

/// Allocations freed within `threshold` events of being made:
/// `dealloc_index - alloc_index <= threshold`.
pub fn temporary_allocations(
    events: &[Allocation],
    threshold: usize,
    merge_threads: bool,
) -> Vec<SnapshotEntry> {
    let mut pointers: HashMap<u64, (usize, Allocation)> = HashMap::new();
    let mut ranges: IntervalTree<(usize, Allocation)> = IntervalTree::new();
    let mut groups: HashMap<(NodeIndex, u64), (u64, usize)> = HashMap::new();

    let mut credit = |event: &Allocation, size: u64, count: usize| {
        let thread = if merge_threads { ALL_THREADS } else { event.record.thread_id };
        let slot = groups.entry((event.stack_id, thread)).or_insert((0, 0));
        slot.0 += size;
        slot.1 += count;
    };

    for (index, event) in events.iter().enumerate() {
        let record = &event.record;
        match record.kind.class() {
            AllocatorClass::SimpleAlloc => {
                pointers.insert(record.address, (index, event.clone()));
            }
            AllocatorClass::SimpleDealloc => {
                if let Some((born, source)) = pointers.remove(&record.address) {
                    if index - born <= threshold {
                        credit(&source, source.record.size, source.n_allocations);
                    }
                }
            }
            AllocatorClass::RangedAlloc => {
                ranges.add(record.address, record.size, (index, event.clone()));
            }
            AllocatorClass::RangedDealloc => {
                for (range, (born, source)) in ranges.remove(record.address, record.size) {
                    if index - born <= threshold {
                        credit(&source, range.length(), 1);
                    }
                }
            }
        }
    }

    sorted_entries(groups)
}

/// The aggregate view of an event-index window: events outside it are
/// invisible, so deallocations of older allocations fall through as
/// unknown addresses, exactly like deallocations predating a capture.
pub fn snapshot_between(
    events: &[Allocation],
    start: usize,
    end: usize,
    merge_threads: bool,
) -> Vec<SnapshotEntry> {
    if start > end || start >= events.len() {
        return Vec::new();
    }
    let end = end.min(events.len() - 1);
    leak_snapshot(&events[start..=end], merge_threads)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::AllocatorKind;

    fn event(
        thread_id: u64,
        address: u64,
        size: u64,
        kind: AllocatorKind,
        stack_id: NodeIndex,
    ) -> Allocation {
        Allocation {
            record: AllocationRecord {
                thread_id,
                address,
                size,
                kind,
                line: 0,
                native_frame_id: 0,
                generation: 0,
            },
            stack_id,
            n_allocations: 1,
        }
    }

    fn malloc(address: u64, size: u64) -> Allocation {
        event(1, address, size, AllocatorKind::Malloc, 1)
    }

    fn free(address: u64) -> Allocation {
        event(1, address, 0, AllocatorKind::Free, 1)
    }

    #[test]
    fn test_peak_of_alloc_then_free_sequence() {
        // Sizes 10, 20, 30 allocated then freed in order: peak 60 at index 2.
        let events = vec![
            malloc(0xa, 10),
            malloc(0xb, 20),
            malloc(0xc, 30),
            free(0xa),
            free(0xb),
            free(0xc),
        ];
        let peak = find_high_watermark(&events);
        assert_eq!(peak.peak_memory, 60);
        assert_eq!(peak.index, 2);
        assert!(leak_snapshot(&events, true).is_empty());
    }

    #[test]
    fn test_current_memory_never_underflows() {
        let mut heap = LiveHeap::new();
        heap.apply(&free(0x999)); // dealloc of an unknown address
        assert_eq!(heap.current_memory(), 0);
        heap.apply(&event(1, 0x5000, 100, AllocatorKind::Munmap, 1));
        assert_eq!(heap.current_memory(), 0);
    }

    #[test]
    fn test_snapshot_groups_by_stack_and_thread() {
        let events = vec![
            event(1, 0xa, 100, AllocatorKind::Malloc, 7),
            event(2, 0xb, 100, AllocatorKind::Malloc, 7),
        ];
        let merged = leak_snapshot(&events, true);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].size, 200);
        assert_eq!(merged[0].n_allocations, 2);
        assert_eq!(merged[0].thread_id, ALL_THREADS);

        let split = leak_snapshot(&events, false);
        assert_eq!(split.len(), 2);
        assert!(split.iter().all(|entry| entry.size == 100));
    }

    #[test]
    fn test_live_set_matches_unfreed_allocations() {
        let events = vec![
            malloc(0xa, 10),
            malloc(0xb, 20),
            free(0xa),
            malloc(0xc, 5),
        ];
        let mut heap = LiveHeap::new();
        for event in &events {
            heap.apply(event);
        }
        assert_eq!(heap.current_memory(), 25);
        let live: Vec<_> = heap.pointers.keys().copied().collect();
        assert_eq!(live.len(), 2);
        assert!(live.contains(&0xb) && live.contains(&0xc));
    }

    #[test]
    fn test_ranged_partial_unmap_snapshot() {
        // mmap a; mmap b; munmap half of a.
        let a = 0x10_000;
        let b = 0x20_000;
        let events = vec![
            event(1, a, 4096, AllocatorKind::Mmap, 3),
            event(1, b, 4096, AllocatorKind::Mmap, 3),
            event(1, a, 0, AllocatorKind::Free, 3), // unknown simple free, ignored
            event(1, a, 2048, AllocatorKind::Munmap, 3),
        ];
        let peak = find_high_watermark(&events);
        assert_eq!(peak.peak_memory, 8192);

        let mut heap = LiveHeap::new();
        for event in &events {
            heap.apply(event);
        }
        assert_eq!(heap.current_memory(), 6144);
        let live: Vec<_> = heap.ranges.iter().map(|(range, _)| range).collect();
        assert_eq!(live[0].start, a + 2048);
        assert_eq!(live[0].end, a + 4096);
        assert_eq!(live[1].start, b);
        assert_eq!(live[1].end, b + 4096);
    }

    #[test]
    fn test_temporary_threshold_law() {
        // malloc p0; free p0 (realloc's explicit free); malloc p1; free p1.
        let events = vec![malloc(0xa, 100), free(0xa), malloc(0xb, 200), free(0xb)];

        // Adjacent alloc/free pairs sit one index apart.
        assert!(temporary_allocations(&events, 0, true).is_empty());
        let at_one = temporary_allocations(&events, 1, true);
        assert_eq!(at_one.len(), 1);
        assert_eq!(at_one[0].size, 300);
        assert_eq!(at_one[0].n_allocations, 2);
    }

    #[test]
    fn test_temporaries_catch_growth_pattern() {
        // Growing container via realloc: ALLOC b1, then (FREE b_k, ALLOC
        // b_k+1) pairs; every intermediate buffer dies one index after the
        // event separating it from its successor.
        let mut events = vec![malloc(0x1, 16)];
        for step in 1..100u64 {
            events.push(free(step));
            events.push(malloc(step + 1, 16 << step.min(20)));
        }
        let with_one = temporary_allocations(&events, 1, true);
        let total: usize = with_one.iter().map(|entry| entry.n_allocations).sum();
        assert_eq!(total, 99);

        assert!(temporary_allocations(&events, 0, true).is_empty());
    }

    #[test]
    fn test_window_snapshot_ignores_outside_events() {
        let events = vec![
            malloc(0xa, 10), // index 0
            malloc(0xb, 20), // index 1
            free(0xa),       // index 2: inside the window, dangling alloc
            malloc(0xc, 40), // index 3
        ];
        // Window [1, 3]: the free of 0xa has no visible allocation.
        let entries = snapshot_between(&events, 1, 3, true);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].size, 60);
        assert_eq!(entries[0].n_allocations, 2);

        assert!(snapshot_between(&events, 3, 1, true).is_empty());
        assert!(snapshot_between(&events, 9, 12, true).is_empty());
    }
}
