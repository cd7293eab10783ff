//! Deferred symbolification of captured instruction pointers.
//!
//! Nothing is resolved at capture time; the reader asks for `(ip,
//! generation)` pairs and results are cached per pair. The ladder:
//!
//! 1. Locate the segment covering the IP in exactly its generation.
//! 2. If the same object is still loaded at the same base in this process,
//!    resolve through the in-process symbolizer (full DWARF, inline
//!    expansion).
//! 3. Otherwise fall back to the object file's symbol table, fetching
//!    split debug info through debuginfod when it is configured.
//! 4. Failing everything, `<unknown>`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use object::{Object, ObjectSymbol};

use crate::resolve::segments::{SegmentMap, SegmentSnapshot};

/// Placeholder for anything that cannot be resolved.
pub const UNKNOWN: &str = "<unknown>";

/// One resolved native frame. A single IP may expand into several of these
/// when the compiler inlined calls through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNativeFrame {
    /// Demangled function name, or [`UNKNOWN`].
    pub symbol: Arc<str>,

    /// Source file when debug info knows it, else the object path.
    pub file: Arc<str>,

    /// Source line, 0 when unknown.
    pub line: u32,

    /// True for frames introduced by inline expansion.
    pub is_inlined: bool,
}

/// Standard debuginfod client environment, read once per resolver.
#[derive(Debug, Clone, Default)]
pub struct DebuginfodConfig {
    /// Space- or newline-separated server URLs; empty disables fetching.
    pub urls: String,
    pub cache_path: Option<PathBuf>,
    pub timeout: Option<String>,
    pub progress: bool,
    pub verbose: bool,
    pub max_size: Option<String>,
}

impl DebuginfodConfig {
    /// Read the `DEBUGINFOD_*` variables with their standard meanings.
    pub fn from_env() -> Self {
        Self {
            urls: std::env::var("DEBUGINFOD_URLS").unwrap_or_default(),
            cache_path: std::env::var_os("DEBUGINFOD_CACHE_PATH").map(PathBuf::from),
            timeout: std::env::var("DEBUGINFOD_TIMEOUT").ok(),
            progress: std::env::var_os("DEBUGINFOD_PROGRESS").is_some(),
            verbose: std::env::var_os("DEBUGINFOD_VERBOSE").is_some(),
            max_size: std::env::var("DEBUGINFOD_MAXSIZE").ok(),
        }
    }

    fn enabled(&self) -> bool {
        !self.urls.trim().is_empty()
    }
}

/// Function-table entry from an object file.
struct SymbolEntry {
    address: u64,
    size: u64,
    name: String,
}

/// Per-process intern pool for resolved names and paths; repeat
/// resolutions of hot frames cost one clone of an `Arc`.
struct StringPool {
    strings: HashSet<Arc<str>>,
}

impl StringPool {
    fn new() -> Self {
        Self { strings: HashSet::new() }
    }

    fn intern(&mut self, value: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(value) {
            return existing.clone();
        }
        let arc: Arc<str> = Arc::from(value);
        self.strings.insert(arc.clone());
        arc
    }
}

/// Lazy, caching resolver for `(ip, generation)` pairs.
pub struct SymbolResolver {
    cache: HashMap<(u64, u32), Vec<ResolvedNativeFrame>>,
    symtabs: HashMap<String, Option<Vec<SymbolEntry>>>,
    live_layout: Option<SegmentSnapshot>,
    pool: StringPool,
    debuginfod: DebuginfodConfig,
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self {
            cache: HashMap::new(),
            symtabs: HashMap::new(),
            live_layout: None,
            pool: StringPool::new(),
            debuginfod: DebuginfodConfig::from_env(),
        }
    }

    /// Resolve one IP against the segment layout of its generation.
    ///
    /// Always returns at least one frame; failures degrade to [`UNKNOWN`]
    /// placeholders rather than errors.
    pub fn resolve(
        &mut self,
        ip: u64,
        generation: u32,
        map: &SegmentMap,
    ) -> Vec<ResolvedNativeFrame> {
        if let Some(cached) = self.cache.get(&(ip, generation)) {
            return cached.clone();
        }

        let frames = self.resolve_uncached(ip, generation, map);
        self.cache.insert((ip, generation), frames.clone());
        frames
    }

    fn resolve_uncached(
        &mut self,
        ip: u64,
        generation: u32,
        map: &SegmentMap,
    ) -> Vec<ResolvedNativeFrame> {
        let Some(location) = map.locate(ip, generation) else {
            return vec![self.unknown_frame()];
        };
        let filename = location.filename.to_string();
        let base = location.base_address;

        if self.is_live_at_same_base(&filename, base, ip) {
            let frames = self.resolve_in_process(ip);
            if !frames.is_empty() {
                return frames;
            }
        }

        if let Some(frame) = self.resolve_from_file(&filename, base, ip) {
            return vec![frame];
        }
        vec![self.unknown_frame()]
    }

    fn unknown_frame(&mut self) -> ResolvedNativeFrame {
        ResolvedNativeFrame {
            symbol: self.pool.intern(UNKNOWN),
            file: self.pool.intern(UNKNOWN),
            line: 0,
            is_inlined: false,
        }
    }

    /// Whether the capture-time object is still mapped here, unchanged.
    /// Only then is the in-process symbolizer talking about the same code.
    fn is_live_at_same_base(&mut self, filename: &str, base: u64, ip: u64) -> bool {
        let layout = self
            .live_layout
            .get_or_insert_with(|| crate::resolve::segments::snapshot_current(0));
        layout.modules.iter().any(|module| {
            module.filename == filename
                && module.base_address == base
                && module.segments.iter().any(|&(start, end)| ip >= start && ip < end)
        })
    }

    /// In-process resolution: DWARF-backed, expands inlined calls. The
    /// innermost frame comes first; every frame above the outermost one is
    /// flagged inlined.
    fn resolve_in_process(&mut self, ip: u64) -> Vec<ResolvedNativeFrame> {
        let mut raw: Vec<(String, String, u32)> = Vec::new();
        backtrace::resolve(ip as *mut std::os::raw::c_void, |symbol| {
            let name = symbol
                .name()
                .map(|n| format!("{n:#}"))
                .unwrap_or_else(|| UNKNOWN.to_string());
            let file = symbol
                .filename()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| UNKNOWN.to_string());
            let line = symbol.lineno().unwrap_or(0);
            raw.push((name, file, line));
        });

        let outermost = raw.len().saturating_sub(1);
        raw.into_iter()
            .enumerate()
            .map(|(index, (name, file, line))| ResolvedNativeFrame {
                symbol: self.pool.intern(&name),
                file: self.pool.intern(&file),
                line,
                is_inlined: index < outermost,
            })
            .collect()
    }

    /// Symbol-table resolution against the on-disk object: function name
    /// only, attributed to the object path.
    fn resolve_from_file(&mut self, filename: &str, base: u64, ip: u64) -> Option<ResolvedNativeFrame> {
        if filename.is_empty() {
            return None;
        }
        if !self.symtabs.contains_key(filename) {
            let table = self.load_symtab(filename);
            self.symtabs.insert(filename.to_string(), table);
        }

        let symbol_name = {
            let table = self.symtabs.get(filename)?.as_ref()?;
            let vaddr = ip.checked_sub(base)?;
            let index = match table.binary_search_by_key(&vaddr, |entry| entry.address) {
                Ok(index) => index,
                Err(0) => return None,
                Err(next) => next - 1,
            };
            let entry = &table[index];
            if entry.size > 0 && vaddr >= entry.address + entry.size {
                return None;
            }
            entry.name.clone()
        };

        Some(ResolvedNativeFrame {
            symbol: self.pool.intern(&symbol_name),
            file: self.pool.intern(filename),
            line: 0,
            is_inlined: false,
        })
    }

    fn load_symtab(&self, filename: &str) -> Option<Vec<SymbolEntry>> {
        let entries = read_function_symbols(std::path::Path::new(filename));
        match entries {
            Some(entries) if !entries.is_empty() => Some(entries),
            // Stripped binary: try a debuginfod-served debug file.
            _ => {
                let debug_path = self.fetch_debuginfo(filename)?;
                read_function_symbols(&debug_path)
            }
        }
    }

    /// Fetch split debug info through the standard debuginfod client.
    fn fetch_debuginfo(&self, filename: &str) -> Option<PathBuf> {
        if !self.debuginfod.enabled() {
            return None;
        }
        let mut command = Command::new("debuginfod-find");
        command.arg("debuginfo").arg(filename);
        command.env("DEBUGINFOD_URLS", &self.debuginfod.urls);
        if let Some(cache) = &self.debuginfod.cache_path {
            command.env("DEBUGINFOD_CACHE_PATH", cache);
        }
        if let Some(timeout) = &self.debuginfod.timeout {
            command.env("DEBUGINFOD_TIMEOUT", timeout);
        }
        if let Some(max_size) = &self.debuginfod.max_size {
            command.env("DEBUGINFOD_MAXSIZE", max_size);
        }
        if self.debuginfod.verbose {
            command.env("DEBUGINFOD_VERBOSE", "1");
        }
        if self.debuginfod.progress {
            command.env("DEBUGINFOD_PROGRESS", "1");
        }

        let output = command.output().ok()?;
        if !output.status.success() {
            log::debug!("debuginfod-find failed for {filename}");
            return None;
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an object file's function symbols, sorted by address.
fn read_function_symbols(path: &std::path::Path) -> Option<Vec<SymbolEntry>> {
    let bytes = std::fs::read(path).ok()?;
    let file = object::File::parse(&*bytes).ok()?;

    let mut entries: Vec<SymbolEntry> = file
        .symbols()
        .chain(file.dynamic_symbols())
        .filter(|symbol| symbol.kind() == object::SymbolKind::Text && symbol.address() != 0)
        .filter_map(|symbol| {
            symbol.name().ok().map(|name| SymbolEntry {
                address: symbol.address(),
                size: symbol.size(),
                name: name.to_string(),
            })
        })
        .collect();
    entries.sort_by_key(|entry| entry.address);
    entries.dedup_by_key(|entry| entry.address);
    Some(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::segments::{ModuleSegments, SegmentMap};

    #[test]
    fn test_unresolvable_ip_degrades_to_unknown() {
        let map = SegmentMap::new();
        let mut resolver = SymbolResolver::new();

        let frames = resolver.resolve(0xdead_beef, 0, &map);
        assert_eq!(frames.len(), 1);
        assert_eq!(&*frames[0].symbol, UNKNOWN);
        assert!(!frames[0].is_inlined);
    }

    #[test]
    fn test_cache_returns_identical_interned_strings() {
        let map = SegmentMap::new();
        let mut resolver = SymbolResolver::new();

        let first = resolver.resolve(0x1000, 3, &map);
        let second = resolver.resolve(0x1000, 3, &map);
        assert!(Arc::ptr_eq(&first[0].symbol, &second[0].symbol));
    }

    #[test]
    fn test_generation_isolation_in_resolution() {
        let mut map = SegmentMap::new();
        map.add_module(
            5,
            ModuleSegments {
                filename: "/nonexistent/libx.so".to_string(),
                base_address: 0x7f00_0000_0000,
                segments: vec![(0x7f00_0000_1000, 0x7f00_0000_2000)],
            },
        );
        let mut resolver = SymbolResolver::new();

        // Covered in generation 5 (but unreadable file -> unknown symbol).
        let in_generation = resolver.resolve(0x7f00_0000_1800, 5, &map);
        assert_eq!(&*in_generation[0].symbol, UNKNOWN);
        // Same IP in a generation without that module also resolves to
        // unknown, proving no cross-generation fallback happens.
        let other_generation = resolver.resolve(0x7f00_0000_1800, 6, &map);
        assert_eq!(&*other_generation[0].symbol, UNKNOWN);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_in_process_resolution_finds_own_function() {
        let layout = crate::resolve::segments::snapshot_current(0);
        let mut map = SegmentMap::new();
        for module in layout.modules {
            map.add_module(0, module);
        }
        let mut resolver = SymbolResolver::new();

        let ip = test_in_process_resolution_finds_own_function as usize as u64;
        let frames = resolver.resolve(ip, 0, &map);
        assert!(!frames.is_empty());
        // The test binary carries symbols, so this must do better than the
        // unknown placeholder.
        assert_ne!(&*frames[0].symbol, UNKNOWN);
    }
}
