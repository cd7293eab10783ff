//! Bounded native stack capture for the allocation hot path.
//!
//! Collects raw instruction pointers only; all symbol work is deferred to
//! read time so capture cost stays independent of DWARF complexity.

/// Upper bound on captured native frames per event.
pub const MAX_NATIVE_FRAMES: usize = 64;

/// Frames belonging to the tracker itself (this function and the intercept
/// machinery above it) that callers never want to see.
const SKIP_FRAMES: usize = 2;

/// Capture up to [`MAX_NATIVE_FRAMES`] instruction pointers, leaf-first.
///
/// Uses the unsynchronized walker: the caller already holds the
/// re-entrancy guard and the walk itself must not take locks, since it
/// runs inside arbitrary allocator calls.
pub fn capture(out: &mut [u64; MAX_NATIVE_FRAMES]) -> usize {
    let mut count = 0;
    let mut skipped = 0;
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if skipped < SKIP_FRAMES {
                skipped += 1;
                return true;
            }
            out[count] = frame.ip() as usize as u64;
            count += 1;
            count < MAX_NATIVE_FRAMES
        });
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_collects_bounded_frames() {
        let mut ips = [0u64; MAX_NATIVE_FRAMES];
        let count = capture(&mut ips);
        assert!(count > 0);
        assert!(count <= MAX_NATIVE_FRAMES);
        assert!(ips[..count].iter().all(|&ip| ip != 0));
    }

    #[test]
    fn test_deeper_stack_captures_more_frames() {
        fn recurse(depth: usize, ips: &mut [u64; MAX_NATIVE_FRAMES]) -> usize {
            if depth == 0 {
                capture(ips)
            } else {
                recurse(depth - 1, ips)
            }
        }
        let mut shallow = [0u64; MAX_NATIVE_FRAMES];
        let mut deep = [0u64; MAX_NATIVE_FRAMES];
        let shallow_count = capture(&mut shallow);
        let deep_count = std::hint::black_box(recurse(8, &mut deep));
        assert!(deep_count >= shallow_count.min(MAX_NATIVE_FRAMES));
    }
}
