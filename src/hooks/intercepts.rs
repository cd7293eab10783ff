//! The allocator intercepts.
//!
//! Every intercept keeps the exact C signature of the function it replaces
//! and never lets a tracker problem escape to the caller: with no original
//! resolved it degrades to the weakest legal answer (NULL / -1 / no-op) and
//! records nothing.
//!
//! Deallocation records are written *before* the original runs so a freed
//! address reappearing from the very next allocation can never produce an
//! alloc/free inversion in the stream.

use std::mem;
use std::os::raw::{c_char, c_int, c_void};

use crate::hooks::{self, HookId};
use crate::records::AllocatorKind;
use crate::tracking::{guard, tracker};

type MallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallocFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void;
type PosixMemalignFn =
    unsafe extern "C" fn(*mut *mut c_void, libc::size_t, libc::size_t) -> c_int;
type MemalignFn = unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void;
type VallocFn = unsafe extern "C" fn(libc::size_t) -> *mut c_void;
type MmapFn = unsafe extern "C" fn(
    *mut c_void,
    libc::size_t,
    c_int,
    c_int,
    c_int,
    libc::off_t,
) -> *mut c_void;
type Mmap64Fn = unsafe extern "C" fn(
    *mut c_void,
    libc::size_t,
    c_int,
    c_int,
    c_int,
    libc::off64_t,
) -> *mut c_void;
type MunmapFn = unsafe extern "C" fn(*mut c_void, libc::size_t) -> c_int;
type DlopenFn = unsafe extern "C" fn(*const c_char, c_int) -> *mut c_void;
type DlcloseFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type RuntimeAcquireFn = unsafe extern "C" fn() -> c_int;

/// Fetch the saved original with the right signature, or `None` if the
/// symbol was never resolved (callable this early only in exotic setups).
unsafe fn original<F>(id: HookId) -> Option<F> {
    let ptr = hooks::original(id);
    if ptr.is_null() {
        None
    } else {
        Some(mem::transmute_copy::<*mut c_void, F>(&ptr))
    }
}

pub(crate) unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
    let Some(orig) = original::<MallocFn>(HookId::Malloc) else {
        return std::ptr::null_mut();
    };
    let Some(_token) = guard::enter() else { return orig(size) };
    let ret = orig(size);
    if !ret.is_null() {
        tracker::record_allocation(AllocatorKind::Malloc, ret as u64, size as u64);
    }
    ret
}

pub(crate) unsafe extern "C" fn free(ptr: *mut c_void) {
    let Some(orig) = original::<FreeFn>(HookId::Free) else { return };
    let Some(_token) = guard::enter() else { return orig(ptr) };
    if !ptr.is_null() {
        tracker::record_allocation(AllocatorKind::Free, ptr as u64, 0);
    }
    orig(ptr)
}

pub(crate) unsafe extern "C" fn calloc(count: libc::size_t, size: libc::size_t) -> *mut c_void {
    let Some(orig) = original::<CallocFn>(HookId::Calloc) else {
        return std::ptr::null_mut();
    };
    let Some(_token) = guard::enter() else { return orig(count, size) };
    let ret = orig(count, size);
    if !ret.is_null() {
        let total = (count as u64).saturating_mul(size as u64);
        tracker::record_allocation(AllocatorKind::Calloc, ret as u64, total);
    }
    ret
}

pub(crate) unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    let Some(orig) = original::<ReallocFn>(HookId::Realloc) else {
        return std::ptr::null_mut();
    };
    let Some(_token) = guard::enter() else { return orig(ptr, size) };
    if !ptr.is_null() {
        tracker::record_allocation(AllocatorKind::Free, ptr as u64, 0);
    }
    let ret = orig(ptr, size);
    if !ret.is_null() {
        tracker::record_allocation(AllocatorKind::Realloc, ret as u64, size as u64);
    }
    ret
}

pub(crate) unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    alignment: libc::size_t,
    size: libc::size_t,
) -> c_int {
    let Some(orig) = original::<PosixMemalignFn>(HookId::PosixMemalign) else {
        return libc::ENOMEM;
    };
    let Some(_token) = guard::enter() else { return orig(memptr, alignment, size) };
    let ret = orig(memptr, alignment, size);
    if ret == 0 && !memptr.is_null() && !(*memptr).is_null() {
        tracker::record_allocation(AllocatorKind::PosixMemalign, *memptr as u64, size as u64);
    }
    ret
}

pub(crate) unsafe extern "C" fn memalign(
    alignment: libc::size_t,
    size: libc::size_t,
) -> *mut c_void {
    let Some(orig) = original::<MemalignFn>(HookId::Memalign) else {
        return std::ptr::null_mut();
    };
    let Some(_token) = guard::enter() else { return orig(alignment, size) };
    let ret = orig(alignment, size);
    if !ret.is_null() {
        tracker::record_allocation(AllocatorKind::Memalign, ret as u64, size as u64);
    }
    ret
}

pub(crate) unsafe extern "C" fn valloc(size: libc::size_t) -> *mut c_void {
    let Some(orig) = original::<VallocFn>(HookId::Valloc) else {
        return std::ptr::null_mut();
    };
    let Some(_token) = guard::enter() else { return orig(size) };
    let ret = orig(size);
    if !ret.is_null() {
        tracker::record_allocation(AllocatorKind::Valloc, ret as u64, size as u64);
    }
    ret
}

pub(crate) unsafe extern "C" fn pvalloc(size: libc::size_t) -> *mut c_void {
    let Some(orig) = original::<VallocFn>(HookId::Pvalloc) else {
        return std::ptr::null_mut();
    };
    let Some(_token) = guard::enter() else { return orig(size) };
    let ret = orig(size);
    if !ret.is_null() {
        // pvalloc rounds the request up to a whole page; record what was
        // actually reserved.
        let page = (libc::sysconf(libc::_SC_PAGESIZE) as u64).max(1);
        let rounded = (size as u64 + page - 1) / page * page;
        tracker::record_allocation(AllocatorKind::Pvalloc, ret as u64, rounded);
    }
    ret
}

pub(crate) unsafe extern "C" fn mmap(
    addr: *mut c_void,
    length: libc::size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off_t,
) -> *mut c_void {
    let Some(orig) = original::<MmapFn>(HookId::Mmap) else { return libc::MAP_FAILED };
    let Some(_token) = guard::enter() else {
        return orig(addr, length, prot, flags, fd, offset);
    };
    let ret = orig(addr, length, prot, flags, fd, offset);
    if ret != libc::MAP_FAILED {
        tracker::record_allocation(AllocatorKind::Mmap, ret as u64, length as u64);
    }
    ret
}

pub(crate) unsafe extern "C" fn mmap64(
    addr: *mut c_void,
    length: libc::size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: libc::off64_t,
) -> *mut c_void {
    let Some(orig) = original::<Mmap64Fn>(HookId::Mmap64) else { return libc::MAP_FAILED };
    let Some(_token) = guard::enter() else {
        return orig(addr, length, prot, flags, fd, offset);
    };
    let ret = orig(addr, length, prot, flags, fd, offset);
    if ret != libc::MAP_FAILED {
        tracker::record_allocation(AllocatorKind::Mmap, ret as u64, length as u64);
    }
    ret
}

pub(crate) unsafe extern "C" fn munmap(addr: *mut c_void, length: libc::size_t) -> c_int {
    let Some(orig) = original::<MunmapFn>(HookId::Munmap) else { return -1 };
    let Some(_token) = guard::enter() else { return orig(addr, length) };
    tracker::record_allocation(AllocatorKind::Munmap, addr as u64, length as u64);
    orig(addr, length)
}

pub(crate) unsafe extern "C" fn dlopen(filename: *const c_char, flags: c_int) -> *mut c_void {
    let Some(orig) = original::<DlopenFn>(HookId::Dlopen) else {
        return std::ptr::null_mut();
    };
    let Some(_token) = guard::enter() else { return orig(filename, flags) };
    let ret = orig(filename, flags);
    if !ret.is_null() {
        // A new object may carry unpatched relocations and new segments.
        tracker::on_module_change();
    }
    ret
}

pub(crate) unsafe extern "C" fn dlclose(handle: *mut c_void) -> c_int {
    let Some(orig) = original::<DlcloseFn>(HookId::Dlclose) else { return -1 };
    let Some(_token) = guard::enter() else { return orig(handle) };
    let ret = orig(handle);
    tracker::on_module_change();
    ret
}

pub(crate) unsafe extern "C" fn runtime_acquire() -> c_int {
    let Some(orig) = original::<RuntimeAcquireFn>(HookId::RuntimeAcquire) else { return 0 };
    let ret = orig();
    if let Some(_token) = guard::enter() {
        tracker::on_runtime_thread();
    }
    ret
}
