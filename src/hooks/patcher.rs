//! Relocation-table patching.
//!
//! Walks the dynamic linker's phdr list and, for every loaded object except
//! the linker itself and this library, overwrites the resolved GOT slots of
//! hooked symbols with the intercept pointers (or puts the originals back).
//! The dynamic section and relocation tables are read through `object`'s
//! ELF definitions; only the final slot write touches raw memory.
//!
//! A slot write takes effect immediately and is not synchronized with
//! callers; the race is benign because both values are valid callables.
//! Patched pages are widened to read+write and left that way - narrowing
//! could take writability away from unrelated data sharing the page.

use std::collections::HashSet;
use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

use object::elf;
use object::NativeEndian;

use crate::hooks;
use crate::sync::mutex::Mutex;

/// Direction of a patching pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatchMode {
    /// Redirect hooked symbols to the intercepts.
    Patch,
    /// Put the saved originals back.
    Restore,
}

#[cfg(target_arch = "x86_64")]
const RELOC_TYPES: [u32; 2] = [elf::R_X86_64_GLOB_DAT, elf::R_X86_64_JUMP_SLOT];
#[cfg(target_arch = "aarch64")]
const RELOC_TYPES: [u32; 2] = [elf::R_AARCH64_GLOB_DAT, elf::R_AARCH64_JUMP_SLOT];
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const RELOC_TYPES: [u32; 0] = [];

/// Load bases already patched, so repeated passes after dlopen only touch
/// new arrivals.
static PATCHED_BASES: Mutex<Option<HashSet<usize>>> = Mutex::new(None);

struct PatchContext {
    mode: PatchMode,
    self_base: usize,
    skip: HashSet<usize>,
    touched: Vec<usize>,
}

/// Run one patching pass over every loaded object.
pub(crate) fn patch_all(mode: PatchMode) {
    let previously_patched = {
        let guard = PATCHED_BASES.lock();
        guard.clone().unwrap_or_default()
    };
    let skip = match mode {
        // Already-patched objects are skipped; restore passes invert that.
        PatchMode::Patch => previously_patched,
        PatchMode::Restore => HashSet::new(),
    };

    let mut context = PatchContext {
        mode,
        self_base: own_load_base(),
        skip,
        touched: Vec::new(),
    };
    unsafe {
        libc::dl_iterate_phdr(Some(patch_object), &mut context as *mut _ as *mut c_void);
    }

    let mut guard = PATCHED_BASES.lock();
    let patched = guard.get_or_insert_with(HashSet::new);
    match mode {
        PatchMode::Patch => patched.extend(context.touched),
        PatchMode::Restore => patched.clear(),
    }
}

/// Load base of the object containing this library's code, so we never
/// patch our own relocations.
fn own_load_base() -> usize {
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    let probe = patch_all as usize as *mut c_void;
    if unsafe { libc::dladdr(probe, &mut info) } != 0 {
        info.dli_fbase as usize
    } else {
        0
    }
}

fn is_linker_or_vdso(name: &str) -> bool {
    name.contains("linux-vdso") || name.contains("/ld-") || name.starts_with("ld-")
}

unsafe extern "C" fn patch_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let context = &mut *(data as *mut PatchContext);
    let info = &*info;
    let base = info.dlpi_addr as usize;

    if base == context.self_base || context.skip.contains(&base) {
        return 0;
    }
    if !info.dlpi_name.is_null() {
        let name = CStr::from_ptr(info.dlpi_name).to_string_lossy();
        if is_linker_or_vdso(&name) {
            return 0;
        }
    }

    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    for phdr in phdrs {
        if phdr.p_type != libc::PT_DYNAMIC {
            continue;
        }

        let mut strtab: usize = 0;
        let mut symtab: usize = 0;
        let mut rela: usize = 0;
        let mut rela_size: usize = 0;
        let mut jmprel: usize = 0;
        let mut jmprel_size: usize = 0;

        let mut entry = (base + phdr.p_vaddr as usize) as *const elf::Dyn64<NativeEndian>;
        loop {
            let tag = (*entry).d_tag.get(NativeEndian);
            if tag == u64::from(elf::DT_NULL) {
                break;
            }
            let value = (*entry).d_val.get(NativeEndian);
            // glibc rewrites these to absolute addresses at load time;
            // other linkers leave them object-relative.
            let absolute = if (value as usize) < base { base + value as usize } else { value as usize };
            match tag as u32 {
                elf::DT_STRTAB => strtab = absolute,
                elf::DT_SYMTAB => symtab = absolute,
                elf::DT_RELA => rela = absolute,
                elf::DT_RELASZ => rela_size = value as usize,
                elf::DT_JMPREL => jmprel = absolute,
                elf::DT_PLTRELSZ => jmprel_size = value as usize,
                _ => {}
            }
            entry = entry.add(1);
        }

        if strtab == 0 || symtab == 0 {
            continue;
        }
        let mut wrote = false;
        if jmprel != 0 {
            wrote |= patch_table(context.mode, base, jmprel, jmprel_size, symtab, strtab);
        }
        if rela != 0 {
            wrote |= patch_table(context.mode, base, rela, rela_size, symtab, strtab);
        }
        if wrote {
            context.touched.push(base);
        }
    }
    0
}

/// Patch one relocation table; returns whether any slot was rewritten.
unsafe fn patch_table(
    mode: PatchMode,
    base: usize,
    table: usize,
    table_size: usize,
    symtab: usize,
    strtab: usize,
) -> bool {
    let count = table_size / std::mem::size_of::<elf::Rela64<NativeEndian>>();
    let entries = std::slice::from_raw_parts(table as *const elf::Rela64<NativeEndian>, count);
    let mut wrote = false;

    for entry in entries {
        let reloc_type = entry.r_type(NativeEndian, false);
        if !RELOC_TYPES.contains(&reloc_type) {
            continue;
        }
        let sym_index = entry.r_sym(NativeEndian, false) as usize;
        let sym = &*((symtab + sym_index * std::mem::size_of::<elf::Sym64<NativeEndian>>())
            as *const elf::Sym64<NativeEndian>);
        let name =
            CStr::from_ptr((strtab + sym.st_name.get(NativeEndian) as usize) as *const c_char);

        let Some(id) = hooks::find_by_name(name.to_bytes()) else { continue };
        let target = match mode {
            PatchMode::Patch => hooks::intercept(id),
            PatchMode::Restore => hooks::original(id),
        };
        if target.is_null() {
            continue;
        }

        let slot = (base + entry.r_offset.get(NativeEndian) as usize) as *const AtomicUsize;
        if (*slot).load(Ordering::Relaxed) == target as usize {
            continue;
        }
        make_writable(slot as usize);
        (*slot).store(target as usize, Ordering::Relaxed);
        wrote = true;
    }
    wrote
}

/// Widen the page(s) containing an 8-byte slot to read+write.
unsafe fn make_writable(address: usize) {
    let page = libc::sysconf(libc::_SC_PAGESIZE) as usize;
    let start = address & !(page - 1);
    let len = if address + std::mem::size_of::<usize>() > start + page { page * 2 } else { page };
    if libc::mprotect(start as *mut c_void, len, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        log::warn!("mprotect failed for relocation slot at {address:#x}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linker_and_vdso_are_skipped() {
        assert!(is_linker_or_vdso("linux-vdso.so.1"));
        assert!(is_linker_or_vdso("/lib64/ld-linux-x86-64.so.2"));
        assert!(is_linker_or_vdso("ld-musl-x86_64.so.1"));
        assert!(!is_linker_or_vdso("/usr/lib/libssl.so.3"));
        assert!(!is_linker_or_vdso(""));
    }

    #[test]
    fn test_own_load_base_is_found() {
        assert_ne!(own_load_base(), 0);
    }
}
