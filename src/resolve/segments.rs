//! Loaded-module segment tracking.
//!
//! Every `dlopen`/`dlclose` bumps a process-wide generation and the current
//! module layout is snapshotted into the capture. An instruction pointer is
//! only meaningful relative to the layout of the generation it was captured
//! under, so lookups are always generation-qualified.

use std::collections::BTreeMap;

/// Address ranges of one loaded shared object (or the main executable).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSegments {
    /// Path of the object; empty for the main executable.
    pub filename: String,

    /// Load base (link-time vaddr 0 maps here).
    pub base_address: u64,

    /// Executable `[start, end)` ranges, ascending.
    pub segments: Vec<(u64, u64)>,
}

/// The full module layout at one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSnapshot {
    pub generation: u32,
    pub modules: Vec<ModuleSegments>,
}

/// Where an instruction pointer landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLocation<'a> {
    /// Object file that covers the address.
    pub filename: &'a str,

    /// The object's load base in that generation.
    pub base_address: u64,
}

/// Reader-side index of every generation seen in a capture.
pub struct SegmentMap {
    generations: BTreeMap<u32, SegmentSnapshot>,
}

impl SegmentMap {
    pub fn new() -> Self {
        Self { generations: BTreeMap::new() }
    }

    /// Record one module's layout for a generation, creating the generation
    /// on first sight. Generations must arrive in non-decreasing order.
    pub fn add_module(&mut self, generation: u32, module: ModuleSegments) {
        self.generations
            .entry(generation)
            .or_insert_with(|| SegmentSnapshot { generation, modules: Vec::new() })
            .modules
            .push(module);
    }

    /// Number of distinct generations observed.
    pub fn generation_count(&self) -> usize {
        self.generations.len()
    }

    /// The highest generation observed, if any.
    pub fn latest_generation(&self) -> Option<u32> {
        self.generations.keys().next_back().copied()
    }

    /// Find the module covering `ip` in exactly `generation`.
    ///
    /// Never falls back to another generation: a stale layout would resolve
    /// the address against the wrong object.
    pub fn locate(&self, ip: u64, generation: u32) -> Option<IpLocation<'_>> {
        let snapshot = self.generations.get(&generation)?;
        for module in &snapshot.modules {
            for &(start, end) in &module.segments {
                if ip >= start && ip < end {
                    return Some(IpLocation {
                        filename: &module.filename,
                        base_address: module.base_address,
                    });
                }
            }
        }
        None
    }
}

impl Default for SegmentMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture the current process's module layout for `generation`.
///
/// Platforms without a dynamic-linker phdr walk yield an empty layout;
/// native IPs then simply resolve to nothing.
pub fn snapshot_current(generation: u32) -> SegmentSnapshot {
    #[cfg(target_os = "linux")]
    {
        snapshot_process(generation)
    }
    #[cfg(not(target_os = "linux"))]
    {
        SegmentSnapshot { generation, modules: Vec::new() }
    }
}

/// Capture the current process's executable segments via the dynamic
/// linker's phdr list.
#[cfg(target_os = "linux")]
pub fn snapshot_process(generation: u32) -> SegmentSnapshot {
    use std::ffi::CStr;
    use std::os::raw::{c_int, c_void};

    unsafe extern "C" fn collect(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let modules = &mut *(data as *mut Vec<ModuleSegments>);
        let info = &*info;

        let filename = if info.dlpi_name.is_null() {
            String::new()
        } else {
            CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
        };

        let mut segments = Vec::new();
        let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for phdr in phdrs {
            if phdr.p_type == libc::PT_LOAD && phdr.p_flags & libc::PF_X != 0 {
                let start = info.dlpi_addr + phdr.p_vaddr;
                segments.push((start, start + phdr.p_memsz));
            }
        }
        if !segments.is_empty() {
            segments.sort_unstable();
            modules.push(ModuleSegments {
                filename,
                base_address: info.dlpi_addr,
                segments,
            });
        }
        0
    }

    let mut modules: Vec<ModuleSegments> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(Some(collect), &mut modules as *mut _ as *mut c_void);
    }
    SegmentSnapshot { generation, modules }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(filename: &str, base: u64, ranges: &[(u64, u64)]) -> ModuleSegments {
        ModuleSegments {
            filename: filename.to_string(),
            base_address: base,
            segments: ranges.to_vec(),
        }
    }

    #[test]
    fn test_locate_within_generation() {
        let mut map = SegmentMap::new();
        map.add_module(0, module("/lib/liba.so", 0x1000, &[(0x1000, 0x2000)]));

        let loc = map.locate(0x1800, 0).unwrap();
        assert_eq!(loc.filename, "/lib/liba.so");
        assert_eq!(loc.base_address, 0x1000);
        assert!(map.locate(0x2800, 0).is_none());
    }

    #[test]
    fn test_generation_isolation() {
        let mut map = SegmentMap::new();
        map.add_module(0, module("/lib/liba.so", 0x1000, &[(0x1000, 0x2000)]));
        // Generation 1: liba unloaded, libb now covers the same addresses.
        map.add_module(1, module("/lib/libb.so", 0x1000, &[(0x1000, 0x2000)]));

        assert_eq!(map.locate(0x1800, 0).unwrap().filename, "/lib/liba.so");
        assert_eq!(map.locate(0x1800, 1).unwrap().filename, "/lib/libb.so");
        // An IP from a generation with no layout resolves to nothing.
        assert!(map.locate(0x1800, 7).is_none());
        assert_eq!(map.generation_count(), 2);
        assert_eq!(map.latest_generation(), Some(1));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_snapshot_sees_own_process() {
        let snapshot = snapshot_process(0);
        // At minimum the main executable and libc are mapped executable.
        assert!(snapshot.modules.len() >= 2);
        let mut map = SegmentMap::new();
        for module in snapshot.modules {
            map.add_module(0, module);
        }
        // This function's own address must be covered by some module.
        let here = test_snapshot_sees_own_process as usize as u64;
        assert!(map.locate(here, 0).is_some());
    }
}
