//! Thread-local re-entrancy guard.
//!
//! Everything the tracker does on the hot path allocates (interning, the
//! writer buffer), and those allocations hit the very intercepts that
//! called us. The guard breaks the recursion: while it is held, intercepts
//! forward straight to the original allocator and record nothing.

use std::cell::Cell;

thread_local! {
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

/// Holds the guard for the current thread; released on drop.
pub struct GuardToken {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        IN_TRACKER.with(|flag| flag.set(false));
    }
}

/// Try to enter the tracker on this thread.
///
/// Returns `None` when the thread is already inside the tracker (or was
/// blocked across a fork); the caller must then stay out of tracking code.
pub fn enter() -> Option<GuardToken> {
    IN_TRACKER.with(|flag| {
        if flag.get() {
            None
        } else {
            flag.set(true);
            Some(GuardToken { _not_send: std::marker::PhantomData })
        }
    })
}

/// True when this thread currently holds the guard.
pub fn is_active() -> bool {
    IN_TRACKER.with(|flag| flag.get())
}

/// Set the guard without a token. Used by the fork handlers: pre-fork sets
/// it so allocations inside `fork()` itself are ignored, the parent clears
/// it afterwards, and the child leaves it set so tracking stays suspended
/// there until explicitly resumed.
pub fn block_thread() {
    IN_TRACKER.with(|flag| flag.set(true));
}

/// Clear the guard set by [`block_thread`].
pub fn unblock_thread() {
    IN_TRACKER.with(|flag| flag.set(false));
}
