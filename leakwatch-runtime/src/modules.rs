//! Loaded-module enumeration.
//!
//! Global roots are the writable `PT_LOAD` segments (`.data`, `.bss` and
//! friends) of every module in the process.

/// A writable data segment of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSegment {
    /// First address.
    pub begin: usize,
    /// One past the last address.
    pub end: usize,
    /// Position of the owning module in load order.
    pub module_index: usize,
}

/// Source of global data segments.
pub trait ModuleProvider: Send + Sync {
    /// Append every writable data segment to `out`.
    fn global_segments(&self, out: &mut Vec<GlobalSegment>);
}

/// Enumerates the modules loaded into this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadedModules;

impl ModuleProvider for LoadedModules {
    #[cfg(target_os = "linux")]
    fn global_segments(&self, out: &mut Vec<GlobalSegment>) {
        let mut state = CollectState { out, module: 0 };
        // SAFETY: the callback only touches `state` through the pointer
        // passed here, and dl_iterate_phdr calls it synchronously.
        unsafe {
            libc::dl_iterate_phdr(
                Some(collect_segments),
                &mut state as *mut CollectState<'_> as *mut libc::c_void,
            );
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn global_segments(&self, _out: &mut Vec<GlobalSegment>) {}
}

#[cfg(target_os = "linux")]
struct CollectState<'a> {
    out: &'a mut Vec<GlobalSegment>,
    module: usize,
}

#[cfg(target_os = "linux")]
unsafe extern "C" fn collect_segments(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let state = &mut *(data as *mut CollectState<'_>);
    let module = state.module;
    state.module += 1;

    let Some(info) = info.as_ref() else {
        return 0;
    };
    if info.dlpi_phdr.is_null() {
        return 0;
    }
    let base = info.dlpi_addr as usize;
    for i in 0..info.dlpi_phnum as usize {
        let phdr = &*info.dlpi_phdr.add(i);
        if phdr.p_type != libc::PT_LOAD || phdr.p_flags & libc::PF_W == 0 {
            continue;
        }
        let begin = base.wrapping_add(phdr.p_vaddr as usize);
        let end = begin.wrapping_add(phdr.p_memsz as usize);
        if end > begin {
            state.out.push(GlobalSegment {
                begin,
                end,
                module_index: module,
            });
        }
    }
    0
}

/// A provider reporting no globals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoModules;

impl ModuleProvider for NoModules {
    fn global_segments(&self, _out: &mut Vec<GlobalSegment>) {}
}

/// A provider reporting a fixed list of segments.
#[derive(Debug, Default, Clone)]
pub struct FixedSegments {
    segments: Vec<GlobalSegment>,
}

impl FixedSegments {
    /// Create a provider from `(begin, end)` pairs.
    pub fn new(ranges: impl IntoIterator<Item = (usize, usize)>) -> Self {
        let segments = ranges
            .into_iter()
            .enumerate()
            .map(|(module_index, (begin, end))| GlobalSegment {
                begin,
                end,
                module_index,
            })
            .collect();
        Self { segments }
    }
}

impl ModuleProvider for FixedSegments {
    fn global_segments(&self, out: &mut Vec<GlobalSegment>) {
        out.extend_from_slice(&self.segments);
    }
}
