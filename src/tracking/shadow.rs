//! Per-thread mirror of the managed call stack.
//!
//! The managed runtime's profile hook feeds CALL/RETURN/LINE events into a
//! thread-local stack so allocator intercepts can read the managed stack
//! tip without touching the runtime's global lock - allocators get called
//! from native threads that never hold it.
//!
//! Frames are interned and written as FRAME_PUSH/FRAME_POP deltas the
//! moment they happen; the allocation records between two deltas implicitly
//! share the stack the deltas describe.

use std::cell::{Cell, RefCell};

use crate::records::interner::FrameId;
use crate::records::ManagedFrame;
use crate::tracking::{guard, tracker};

/// One profile-hook event from the managed runtime.
#[derive(Debug, Clone)]
pub enum ProfileEvent<'a> {
    /// A function was entered.
    Call { function: &'a str, file: &'a str, line: u32 },
    /// The current function returned (or unwound).
    Return,
    /// Execution moved to a new line in the current function.
    Line { line: u32 },
}

struct MirrorFrame {
    frame: ManagedFrame,
    id: FrameId,
    line: u32,
}

thread_local! {
    static MIRROR: RefCell<Vec<MirrorFrame>> = const { RefCell::new(Vec::new()) };
    static HOOK_INSTALLED: Cell<bool> = const { Cell::new(false) };
    static THREAD_ID: Cell<u64> = const { Cell::new(0) };
}

/// Stable id of the calling OS thread.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|cached| {
        let id = cached.get();
        if id != 0 {
            return id;
        }
        #[cfg(target_os = "linux")]
        let id = unsafe { libc::syscall(libc::SYS_gettid) as u64 };
        #[cfg(not(target_os = "linux"))]
        let id = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            std::thread::current().id().hash(&mut hasher);
            hasher.finish() | 1
        };
        cached.set(id);
        id
    })
}

/// Feed one profile-hook event into the mirror.
///
/// Cheap no-op when no tracker is active or the calling thread is already
/// inside the tracker.
pub fn profile_event(event: ProfileEvent<'_>) {
    let Some(_token) = guard::enter() else { return };
    let tid = current_thread_id();

    tracker::with_active(|state| match &event {
        ProfileEvent::Call { function, file, line } => {
            let frame = ManagedFrame::new(*function, *file, *line);
            match state.writer.write_frame_push(tid, &frame) {
                Ok(id) => MIRROR.with(|mirror| {
                    mirror.borrow_mut().push(MirrorFrame { frame, id, line: *line });
                }),
                Err(err) => state.note_write_failure(err),
            }
        }
        ProfileEvent::Return => {
            let popped = MIRROR.with(|mirror| mirror.borrow_mut().pop());
            if let Some(top) = popped {
                if let Err(err) = state.writer.write_frame_pop(tid, top.id) {
                    state.note_write_failure(err);
                }
            }
        }
        ProfileEvent::Line { line } => {
            MIRROR.with(|mirror| {
                if let Some(top) = mirror.borrow_mut().last_mut() {
                    top.line = *line;
                }
            });
        }
    });
}

/// Prepopulate the mirror with the frames already on the managed stack at
/// profile-hook install time, outermost first. The caller walks the
/// runtime's frame list once, while it still holds the runtime lock.
pub fn prime_stack(frames: &[ManagedFrame]) {
    for frame in frames {
        profile_event(ProfileEvent::Call {
            function: &frame.function,
            file: &frame.file,
            line: frame.line,
        });
    }
}

/// Line currently executing in the innermost managed frame, 0 when the
/// thread has no managed frames. Read from intercepts; same-thread only.
pub(crate) fn current_line() -> u32 {
    MIRROR.with(|mirror| match mirror.try_borrow() {
        Ok(frames) => frames.last().map(|top| top.line).unwrap_or(0),
        Err(_) => 0,
    })
}

/// Depth of this thread's mirror. Used by tests and the fork handler.
pub fn stack_depth() -> usize {
    MIRROR.with(|mirror| mirror.borrow().len())
}

/// Mark the profile hook installed for this thread; returns whether it was
/// already installed. The runtime-lock intercept uses this to install the
/// hook exactly once per thread.
pub(crate) fn mark_hook_installed() -> bool {
    HOOK_INSTALLED.with(|flag| flag.replace(true))
}

/// Re-emit this thread's mirrored stack into a fresh capture.
///
/// After a follow-fork restart the new file has an empty interner, so every
/// mirrored frame is re-interned and re-pushed under its new id.
pub(crate) fn reemit_stack() {
    let Some(_token) = guard::enter() else { return };
    let tid = current_thread_id();
    tracker::with_active(|state| {
        MIRROR.with(|mirror| {
            for entry in mirror.borrow_mut().iter_mut() {
                match state.writer.write_frame_push(tid, &entry.frame) {
                    Ok(id) => entry.id = id,
                    Err(err) => state.note_write_failure(err),
                }
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_are_stable_and_distinct() {
        let here = current_thread_id();
        assert_eq!(here, current_thread_id());

        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(here, 0);
        assert_ne!(other, 0);
        assert_ne!(here, other);
    }

    #[test]
    fn test_mirror_ignores_events_without_tracker() {
        // No tracker active: events must not accumulate state.
        profile_event(ProfileEvent::Call { function: "f", file: "m.py", line: 1 });
        assert_eq!(stack_depth(), 0);
        assert_eq!(current_line(), 0);
        profile_event(ProfileEvent::Return);
    }
}
