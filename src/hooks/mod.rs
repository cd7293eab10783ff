//! Allocator interception: the process-wide hook table and its plumbing.
//!
//! Every intercepted symbol has one table entry pairing the intercept
//! function with the original resolved through the dynamic linker. The
//! originals are filled in once at session start; the patcher then rewrites
//! relocation slots so callers land on the intercepts. Both pointers are
//! valid callables at all times, so the unlocked slot swaps race benignly.

pub(crate) mod intercepts;
pub(crate) mod patcher;

use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::sync::mutex::Mutex;

/// Index of each intercepted symbol in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookId {
    Malloc = 0,
    Free,
    Calloc,
    Realloc,
    PosixMemalign,
    Memalign,
    Valloc,
    Pvalloc,
    Mmap,
    Mmap64,
    Munmap,
    Dlopen,
    Dlclose,
    RuntimeAcquire,
}

pub(crate) const HOOK_COUNT: usize = 14;

/// Symbol names, NUL-terminated, indexed by [`HookId`]. The runtime-acquire
/// slot has no fixed name; it comes from the tracker configuration.
static HOOK_NAMES: [&[u8]; HOOK_COUNT] = [
    b"malloc\0",
    b"free\0",
    b"calloc\0",
    b"realloc\0",
    b"posix_memalign\0",
    b"memalign\0",
    b"valloc\0",
    b"pvalloc\0",
    b"mmap\0",
    b"mmap64\0",
    b"munmap\0",
    b"dlopen\0",
    b"dlclose\0",
    b"\0",
];

#[allow(clippy::declare_interior_mutable_const)]
const NULL_SLOT: AtomicPtr<c_void> = AtomicPtr::new(std::ptr::null_mut());
static ORIGINALS: [AtomicPtr<c_void>; HOOK_COUNT] = [NULL_SLOT; HOOK_COUNT];

/// Runtime-acquire symbol chosen at start time, if any.
static RUNTIME_SYMBOL: Mutex<Option<CString>> = Mutex::new(None);

/// Resolve and remember the original implementation of every hooked symbol.
/// Idempotent; safe to call on every session start.
pub(crate) fn initialize(runtime_acquire_symbol: Option<&str>) {
    for (index, name) in HOOK_NAMES.iter().enumerate() {
        if name.len() <= 1 {
            continue;
        }
        let found =
            unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const c_char) };
        if !found.is_null() {
            ORIGINALS[index].store(found, Ordering::Release);
        }
    }

    let mut slot = RUNTIME_SYMBOL.lock();
    *slot = runtime_acquire_symbol.and_then(|name| CString::new(name).ok());
    if let Some(symbol) = slot.as_ref() {
        let found = unsafe { libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()) };
        if found.is_null() {
            log::warn!(
                "runtime acquire symbol {:?} is not loaded; per-thread hook install disabled",
                symbol
            );
        } else {
            ORIGINALS[HookId::RuntimeAcquire as usize].store(found, Ordering::Release);
        }
    }
}

/// The saved original for a hook, or null when it was never resolved.
pub(crate) fn original(id: HookId) -> *mut c_void {
    ORIGINALS[id as usize].load(Ordering::Acquire)
}

/// Match a relocation symbol name against the table.
///
/// Returns the hook id so the patcher can fetch either pointer direction.
pub(crate) fn find_by_name(name: &[u8]) -> Option<HookId> {
    for (index, table_name) in HOOK_NAMES.iter().enumerate() {
        let bare = &table_name[..table_name.len() - 1];
        if !bare.is_empty() && bare == name {
            return Some(match_id(index));
        }
    }
    let slot = RUNTIME_SYMBOL.lock();
    if let Some(symbol) = slot.as_ref() {
        if symbol.as_bytes() == name {
            return Some(HookId::RuntimeAcquire);
        }
    }
    None
}

fn match_id(index: usize) -> HookId {
    match index {
        0 => HookId::Malloc,
        1 => HookId::Free,
        2 => HookId::Calloc,
        3 => HookId::Realloc,
        4 => HookId::PosixMemalign,
        5 => HookId::Memalign,
        6 => HookId::Valloc,
        7 => HookId::Pvalloc,
        8 => HookId::Mmap,
        9 => HookId::Mmap64,
        10 => HookId::Munmap,
        11 => HookId::Dlopen,
        12 => HookId::Dlclose,
        _ => HookId::RuntimeAcquire,
    }
}

/// The intercept implementation for a hook.
pub(crate) fn intercept(id: HookId) -> *mut c_void {
    let address = match id {
        HookId::Malloc => intercepts::malloc as usize,
        HookId::Free => intercepts::free as usize,
        HookId::Calloc => intercepts::calloc as usize,
        HookId::Realloc => intercepts::realloc as usize,
        HookId::PosixMemalign => intercepts::posix_memalign as usize,
        HookId::Memalign => intercepts::memalign as usize,
        HookId::Valloc => intercepts::valloc as usize,
        HookId::Pvalloc => intercepts::pvalloc as usize,
        HookId::Mmap => intercepts::mmap as usize,
        HookId::Mmap64 => intercepts::mmap64 as usize,
        HookId::Munmap => intercepts::munmap as usize,
        HookId::Dlopen => intercepts::dlopen as usize,
        HookId::Dlclose => intercepts::dlclose as usize,
        HookId::RuntimeAcquire => intercepts::runtime_acquire as usize,
    };
    address as *mut c_void
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_name_matches_table() {
        assert_eq!(find_by_name(b"malloc"), Some(HookId::Malloc));
        assert_eq!(find_by_name(b"munmap"), Some(HookId::Munmap));
        assert_eq!(find_by_name(b"strlen"), None);
        assert_eq!(find_by_name(b""), None);
    }

    #[test]
    fn test_initialize_resolves_libc() {
        initialize(None);
        assert!(!original(HookId::Malloc).is_null());
        assert!(!original(HookId::Free).is_null());
        // No runtime symbol was configured.
        assert!(original(HookId::RuntimeAcquire).is_null());
    }
}
