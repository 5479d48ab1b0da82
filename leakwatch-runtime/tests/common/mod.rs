//! Shared fixtures: a detector over a synthetic address space.

#![allow(dead_code)]

use std::cell::Cell;
use std::sync::Arc;

use leakwatch_runtime::memory::SnapshotMemory;
use leakwatch_runtime::modules::FixedSegments;
use leakwatch_runtime::stack::StackTraceProducer;
use leakwatch_runtime::suspend::NoopSuspender;
use leakwatch_runtime::symbolize::{SymbolizedFrame, Symbolizer};
use leakwatch_runtime::{ChunkState, ChunkTag, Detector, DetectorConfig, LeakReport};
use parking_lot::Mutex;

/// Start of the synthetic global segment.
pub const GLOBALS: usize = 0x10_0000;
/// Size of the synthetic global segment.
pub const GLOBALS_SIZE: usize = 0x1000;
/// Start of the synthetic heap.
pub const HEAP: usize = 0x100_0000;
/// Spacing between synthetic allocations.
const HEAP_ALIGN: usize = 16;
/// Pointer size.
pub const WORD: usize = std::mem::size_of::<usize>();

thread_local! {
    static SITE: Cell<usize> = const { Cell::new(0) };
}

/// Reports the allocation site set by [`Sim::alloc_at`] as a one-frame
/// stack.
pub struct SiteUnwinder;

impl StackTraceProducer for SiteUnwinder {
    fn capture(&self, _skip: usize, out: &mut [usize]) -> usize {
        let site = SITE.with(Cell::get);
        if site == 0 || out.is_empty() {
            return 0;
        }
        out[0] = site;
        1
    }
}

/// Names every address `site_<hex>`.
pub struct SiteSymbolizer;

impl Symbolizer for SiteSymbolizer {
    fn symbolize(&self, address: usize) -> Vec<SymbolizedFrame> {
        vec![SymbolizedFrame {
            function: Some(format!("site_{:x}", address)),
            file: Some("sim.rs".to_string()),
            line: Some(1),
            ..SymbolizedFrame::unknown(address)
        }]
    }
}

/// Scan globals and registered regions only.
pub fn sim_config() -> DetectorConfig {
    DetectorConfig::builder()
        .use_stacks(false)
        .use_registers(false)
        .use_tls(false)
        .leak_check_at_exit(false)
        .build()
        .unwrap()
}

/// A detector over [`SnapshotMemory`] with a bump-allocated heap.
pub struct Sim {
    pub detector: Detector,
    pub memory: SnapshotMemory,
    pub emitted: Arc<Mutex<Vec<LeakReport>>>,
    next: Cell<usize>,
}

impl Sim {
    pub fn new() -> Self {
        Self::with_config(sim_config())
    }

    pub fn with_config(config: DetectorConfig) -> Self {
        let memory = SnapshotMemory::new();
        memory.map_zeroed(GLOBALS, GLOBALS_SIZE).unwrap();
        let emitted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&emitted);
        let detector = Detector::builder(config)
            .memory(memory.clone())
            .suspender(NoopSuspender)
            .modules(FixedSegments::new([(GLOBALS, GLOBALS + GLOBALS_SIZE)]))
            .symbolizer(SiteSymbolizer)
            .unwinder(SiteUnwinder)
            .sink(move |report: &LeakReport| sink.lock().push(report.clone()))
            .build()
            .unwrap();
        Self {
            detector,
            memory,
            emitted,
            next: Cell::new(HEAP),
        }
    }

    /// Allocate `size` zeroed bytes from site 0x1.
    pub fn alloc(&self, size: usize) -> usize {
        self.alloc_at(size, 0x1)
    }

    /// Allocate `size` zeroed bytes attributed to `site`.
    pub fn alloc_at(&self, size: usize, site: usize) -> usize {
        self.alloc_with(size, site, ChunkState::Unmarked, ChunkTag::GENERIC)
    }

    pub fn alloc_with(&self, size: usize, site: usize, state: ChunkState, tag: ChunkTag) -> usize {
        let address = self.next.get();
        let mapped = size.max(1);
        self.next
            .set(address + (mapped + HEAP_ALIGN - 1) / HEAP_ALIGN * HEAP_ALIGN + HEAP_ALIGN);
        self.memory.map_zeroed(address, mapped).unwrap();
        SITE.with(|s| s.set(site));
        self.detector.record_allocation(address, size, state, tag);
        SITE.with(|s| s.set(0));
        address
    }

    pub fn free(&self, address: usize) -> bool {
        let freed = self.detector.record_free(address).is_some();
        if freed {
            self.memory.unmap(address);
        }
        freed
    }

    /// Store `value` in word `slot` of the global segment.
    pub fn set_global(&self, slot: usize, value: usize) {
        self.memory.write_word(GLOBALS + slot * WORD, value).unwrap();
    }

    /// Store `value` at `address`.
    pub fn store(&self, address: usize, value: usize) {
        self.memory.write_word(address, value).unwrap();
    }

    pub fn check(&self) -> LeakReport {
        self.detector.check_leaks().unwrap()
    }
}
