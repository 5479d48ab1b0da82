//! The leak detector.
//!
//! [`Detector`] owns every registry and collaborator and runs leak checks.
//! A check proceeds as:
//!
//! ```text
//! scan lock -> prepare memory -> chunk lock -> thread lock -> freeze
//!     -> enumerate roots -> mark -> classify
//! -> resume -> unlock -> symbolize, suppress, aggregate -> report
//! ```
//!
//! Every buffer used between freeze and resume is reserved before the
//! freeze. Nothing in that window allocates, logs or takes a lock.

use std::mem::size_of;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::chunk::{Chunk, ChunkRegistry, ChunkState, ChunkTag, IgnoreOutcome, RegistryError};
use crate::classify::classify;
use crate::config::{DetectorConfig, LeakPolicy, MAX_STACK_DEPTH};
use crate::hooks::InternalGuard;
use crate::memory::{MemorySource, ProcessMemory, ReadError};
use crate::modules::{LoadedModules, ModuleProvider};
use crate::report::{CheckSummary, LeakReport, ReportBuilder, ReportSink, StderrSink};
use crate::roots::{RootEnumerator, RootInputs, RootRegionError, RootRegionSet};
use crate::scan::{ConservativeDecoder, PointerDecoder, Scanner};
use crate::stack::{BacktraceUnwinder, StackDepot, StackId, StackTraceProducer};
use crate::suppression::{SuppressionContext, SuppressionError};
use crate::suspend::{CallerRegisters, SuspendError, Suspender};
use crate::symbolize::{BacktraceSymbolizer, Symbolizer};
use crate::thread::{self, ThreadId, ThreadRegistry};

/// Frames belonging to the allocator hook itself.
const HOOK_FRAMES: usize = 4;

/// Leak check errors.
#[derive(Debug, Error)]
pub enum LeakCheckError {
    /// Leak detection is switched off.
    #[error("leak detection is disabled")]
    Disabled,
    /// Threads could not be suspended.
    #[error("failed to stop the world: {0}")]
    Suspend(#[from] SuspendError),
    /// The address space could not be inspected.
    #[error("failed to prepare memory access: {0}")]
    Memory(#[from] ReadError),
}

/// Outcome of [`Detector::do_final_leak_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalCheck {
    /// Detection is disabled, or the check was disarmed.
    Skipped,
    /// The final check already ran.
    AlreadyRan,
    /// No unsuppressed leaks.
    Clean,
    /// Leaks were reported.
    Leaked {
        /// Status the process should exit with, under the `fail` policy.
        exit_code: Option<i32>,
    },
}

impl FinalCheck {
    /// Exit status to terminate with, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            FinalCheck::Leaked { exit_code } => *exit_code,
            _ => None,
        }
    }
}

/// Detector-wide counters.
#[derive(Debug, Default)]
pub struct DetectorStats {
    checks_run: AtomicU64,
    checks_with_leaks: AtomicU64,
    double_allocations: AtomicU64,
    untracked_frees: AtomicU64,
    skipped_ranges: AtomicU64,
}

/// A point-in-time copy of [`DetectorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DetectorStatsSnapshot {
    /// Completed leak checks.
    pub checks_run: u64,
    /// Checks that found unsuppressed leaks.
    pub checks_with_leaks: u64,
    /// Allocations rejected as already tracked or overlapping.
    pub double_allocations: u64,
    /// Frees of addresses that were not tracked.
    pub untracked_frees: u64,
    /// Unreadable ranges skipped across all checks.
    pub skipped_ranges: u64,
}

impl DetectorStats {
    /// Copy the counters.
    pub fn snapshot(&self) -> DetectorStatsSnapshot {
        DetectorStatsSnapshot {
            checks_run: self.checks_run.load(Ordering::Relaxed),
            checks_with_leaks: self.checks_with_leaks.load(Ordering::Relaxed),
            double_allocations: self.double_allocations.load(Ordering::Relaxed),
            untracked_frees: self.untracked_frees.load(Ordering::Relaxed),
            skipped_ranges: self.skipped_ranges.load(Ordering::Relaxed),
        }
    }
}

/// Builder for [`Detector`].
///
/// Every collaborator defaults to the one that inspects the current process.
pub struct DetectorBuilder {
    config: DetectorConfig,
    suppressions: SuppressionContext,
    memory: Option<Box<dyn MemorySource>>,
    suspender: Option<Box<dyn Suspender>>,
    modules: Option<Box<dyn ModuleProvider>>,
    symbolizer: Option<Box<dyn Symbolizer>>,
    unwinder: Option<Box<dyn StackTraceProducer>>,
    decoder: Option<Box<dyn PointerDecoder>>,
    sink: Option<Box<dyn ReportSink>>,
}

impl DetectorBuilder {
    /// Start from `config`.
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            suppressions: SuppressionContext::new(),
            memory: None,
            suspender: None,
            modules: None,
            symbolizer: None,
            unwinder: None,
            decoder: None,
            sink: None,
        }
    }

    /// The configuration the detector will start with.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Read memory through `memory`.
    pub fn memory(mut self, memory: impl MemorySource + 'static) -> Self {
        self.memory = Some(Box::new(memory));
        self
    }

    /// Stop the world with `suspender`.
    pub fn suspender(mut self, suspender: impl Suspender + 'static) -> Self {
        self.suspender = Some(Box::new(suspender));
        self
    }

    /// Discover global segments with `modules`.
    pub fn modules(mut self, modules: impl ModuleProvider + 'static) -> Self {
        self.modules = Some(Box::new(modules));
        self
    }

    /// Symbolize report stacks with `symbolizer`.
    pub fn symbolizer(mut self, symbolizer: impl Symbolizer + 'static) -> Self {
        self.symbolizer = Some(Box::new(symbolizer));
        self
    }

    /// Capture allocation stacks with `unwinder`.
    pub fn unwinder(mut self, unwinder: impl StackTraceProducer + 'static) -> Self {
        self.unwinder = Some(Box::new(unwinder));
        self
    }

    /// Decode candidate pointers with `decoder` instead of the conservative
    /// decoder selected by the scan config.
    pub fn decoder(mut self, decoder: impl PointerDecoder + 'static) -> Self {
        self.decoder = Some(Box::new(decoder));
        self
    }

    /// Deliver reports to `sink`.
    pub fn sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Use these suppressions in addition to the configured file.
    pub fn suppressions(mut self, suppressions: SuppressionContext) -> Self {
        self.suppressions = suppressions;
        self
    }

    /// Build the detector, loading the configured suppression file.
    pub fn build(self) -> Result<Detector, SuppressionError> {
        let mut suppressions = self.suppressions;
        if let Some(path) = &self.config.report.suppressions {
            let loaded = SuppressionContext::from_file(path)?;
            for rule in loaded.rules() {
                suppressions.add(rule.pattern.clone());
            }
        }

        Ok(Detector {
            tracking: AtomicBool::new(self.config.detect_leaks),
            stack_depth: AtomicUsize::new(self.config.stack.malloc_context_size.min(MAX_STACK_DEPTH)),
            config: RwLock::new(self.config),
            chunks: ChunkRegistry::new(),
            threads: ThreadRegistry::new(),
            depot: StackDepot::new(),
            root_regions: RootRegionSet::new(),
            suppressions: RwLock::new(suppressions),
            memory: Mutex::new(self.memory.unwrap_or_else(|| Box::new(ProcessMemory::new()))),
            suspender: self.suspender.unwrap_or_else(default_suspender),
            modules: self.modules.unwrap_or_else(|| Box::new(LoadedModules)),
            symbolizer: self.symbolizer.unwrap_or_else(|| Box::new(BacktraceSymbolizer)),
            unwinder: self.unwinder.unwrap_or_else(|| Box::new(BacktraceUnwinder)),
            decoder: self.decoder,
            sink: self.sink.unwrap_or_else(|| Box::new(StderrSink)),
            scan_lock: Mutex::new(()),
            final_check_done: AtomicBool::new(false),
            fork_owner: AtomicU64::new(0),
            stats: DetectorStats::default(),
        })
    }
}

#[cfg(target_os = "linux")]
fn default_suspender() -> Box<dyn Suspender> {
    Box::new(crate::suspend::SignalSuspender::new())
}

#[cfg(not(target_os = "linux"))]
fn default_suspender() -> Box<dyn Suspender> {
    Box::new(crate::suspend::NoopSuspender)
}

/// Process-wide leak detection state.
pub struct Detector {
    config: RwLock<DetectorConfig>,
    chunks: ChunkRegistry,
    threads: ThreadRegistry,
    depot: StackDepot,
    root_regions: RootRegionSet,
    suppressions: RwLock<SuppressionContext>,
    memory: Mutex<Box<dyn MemorySource>>,
    suspender: Box<dyn Suspender>,
    modules: Box<dyn ModuleProvider>,
    symbolizer: Box<dyn Symbolizer>,
    unwinder: Box<dyn StackTraceProducer>,
    decoder: Option<Box<dyn PointerDecoder>>,
    sink: Box<dyn ReportSink>,
    scan_lock: Mutex<()>,
    tracking: AtomicBool,
    stack_depth: AtomicUsize,
    final_check_done: AtomicBool,
    fork_owner: AtomicU64,
    stats: DetectorStats,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector")
            .field("tracking", &self.is_tracking())
            .field("chunks", &self.chunks.len())
            .field("threads", &self.threads.len())
            .field("stacks", &self.depot.len())
            .finish_non_exhaustive()
    }
}

impl Detector {
    /// Start building a detector.
    pub fn builder(config: DetectorConfig) -> DetectorBuilder {
        DetectorBuilder::new(config)
    }

    /// Whether new allocations are being tracked.
    #[inline]
    pub fn is_tracking(&self) -> bool {
        self.tracking.load(Ordering::Relaxed)
    }

    /// The chunk registry.
    pub fn chunks(&self) -> &ChunkRegistry {
        &self.chunks
    }

    /// The thread registry.
    pub fn threads(&self) -> &ThreadRegistry {
        &self.threads
    }

    /// The allocation-stack depot.
    pub fn depot(&self) -> &StackDepot {
        &self.depot
    }

    /// Registered root regions.
    pub fn root_regions(&self) -> &RootRegionSet {
        &self.root_regions
    }

    /// Current configuration.
    pub fn config(&self) -> DetectorConfig {
        self.config.read().clone()
    }

    /// Replace the configuration. Suppressions are not reloaded.
    pub fn set_config(&self, config: DetectorConfig) {
        self.tracking.store(config.detect_leaks, Ordering::Relaxed);
        self.stack_depth.store(
            config.stack.malloc_context_size.min(MAX_STACK_DEPTH),
            Ordering::Relaxed,
        );
        *self.config.write() = config;
    }

    /// Counters.
    pub fn stats(&self) -> DetectorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Append the rules in `text`.
    pub fn add_suppressions(&self, text: &str) -> Result<(), SuppressionError> {
        let _guard = InternalGuard::enter();
        self.suppressions.write().add_text(text)
    }

    /// Append the rules in the file at `path`.
    pub fn load_suppressions(&self, path: impl AsRef<Path>) -> Result<(), SuppressionError> {
        let _guard = InternalGuard::enter();
        let loaded = SuppressionContext::from_file(path)?;
        let mut suppressions = self.suppressions.write();
        for rule in loaded.rules() {
            suppressions.add(rule.pattern.clone());
        }
        Ok(())
    }

    /// Register an allocation made by the calling thread.
    ///
    /// Inconsistencies are logged and counted, never fatal.
    pub fn record_allocation(&self, address: usize, size: usize, state: ChunkState, tag: ChunkTag) {
        let _guard = InternalGuard::enter();
        let stack_id = self.capture_stack();
        let chunk = Chunk::new(address, size, stack_id, ThreadId::current(), tag).with_state(state);
        if let Err(err) = self.chunks.register(chunk) {
            self.stats.double_allocations.fetch_add(1, Ordering::Relaxed);
            warn!(%err, "allocation tracking inconsistency");
        }
    }

    /// Unregister the allocation at `address`, returning its chunk.
    pub fn record_free(&self, address: usize) -> Option<Chunk> {
        let _guard = InternalGuard::enter();
        match self.chunks.on_free(address) {
            Ok(chunk) => Some(chunk),
            Err(RegistryError::UntrackedFree { address }) => {
                self.stats.untracked_frees.fetch_add(1, Ordering::Relaxed);
                debug!(address = format_args!("{:#x}", address), "free of untracked pointer");
                None
            }
            Err(err) => {
                warn!(%err, "free tracking inconsistency");
                None
            }
        }
    }

    /// Exempt the chunk containing `ptr` from leak reports.
    pub fn ignore_object(&self, ptr: usize) -> Result<IgnoreOutcome, RegistryError> {
        let _guard = InternalGuard::enter();
        let outcome = self.chunks.ignore(ptr);
        match &outcome {
            Ok(IgnoreOutcome::AlreadyIgnored) => {
                debug!(ptr = format_args!("{:#x}", ptr), "object already ignored")
            }
            Ok(IgnoreOutcome::Ignored) => {}
            Err(err) => warn!(%err, "ignore_object failed"),
        }
        outcome
    }

    /// Treat `[begin, begin + size)` as a root.
    pub fn register_root_region(&self, begin: usize, size: usize) -> Result<(), RootRegionError> {
        self.root_regions.register(begin, size)
    }

    /// Undo one [`Detector::register_root_region`] with the same bounds.
    pub fn unregister_root_region(&self, begin: usize, size: usize) -> Result<(), RootRegionError> {
        self.root_regions.unregister(begin, size)
    }

    fn capture_stack(&self) -> StackId {
        let depth = self.stack_depth.load(Ordering::Relaxed);
        let mut frames = [0usize; MAX_STACK_DEPTH];
        let captured = self.unwinder.capture(HOOK_FRAMES, &mut frames[..depth]);
        self.depot.intern(&frames[..captured])
    }

    /// Run a leak check and return the report without emitting it.
    #[inline(never)]
    pub fn check_leaks(&self) -> Result<LeakReport, LeakCheckError> {
        // Frames below this one belong to the checker and are not scanned.
        let anchor = 0usize;
        let anchor = std::hint::black_box(&anchor) as *const usize as usize;
        let registers = CallerRegisters::capture();
        self.run_check(anchor, &registers)
    }

    fn run_check(&self, anchor: usize, registers: &CallerRegisters) -> Result<LeakReport, LeakCheckError> {
        if !self.is_tracking() {
            return Err(LeakCheckError::Disabled);
        }
        let _internal = InternalGuard::enter();
        let _scan = self.scan_lock.lock();
        let config = self.config.read().clone();
        let caller = ThreadId::current();
        let caller_record = if self.threads.contains(caller) {
            None
        } else {
            thread::current_record().ok()
        };

        let mut memory = self.memory.lock();
        memory.prepare()?;

        let mut globals = Vec::new();
        if config.scan.use_globals {
            self.modules.global_segments(&mut globals);
        }
        let exclusions = [self.footprint()];
        let user_regions = self.root_regions.snapshot();
        let fallback_decoder = ConservativeDecoder::from_config(&config.scan);
        let decoder: &dyn PointerDecoder = match &self.decoder {
            Some(decoder) => decoder.as_ref(),
            None => &fallback_decoder,
        };

        let mut table = self.chunks.lock();
        table.reset_marks();
        let mut ignored = Vec::with_capacity(table.ignored_count());
        table.collect_ignored(&mut ignored);
        let mut mark_work = Vec::with_capacity(table.len());
        let mut classify_work = Vec::with_capacity(table.len());
        let mut leaked = Vec::with_capacity(table.len());
        let live_chunks = table.len();

        let thread_table = self.threads.lock();
        let mut records = thread_table.snapshot();
        records.extend(caller_record);
        let caller_registers: Box<[usize]> = if config.scan.use_registers {
            registers.words().into()
        } else {
            Box::new([])
        };
        let mut roots = Vec::with_capacity(
            globals.len() * (1 + exclusions.len())
                + records.len() * 3
                + user_regions.len()
                + ignored.len(),
        );

        let mut world = match self.suspender.freeze_all(records, caller) {
            Ok(world) => world,
            Err(err) => {
                drop(thread_table);
                drop(table);
                return Err(err.into());
            }
        };

        // Frozen: no allocation, logging or locking until resume_all.
        let started = Instant::now();
        let displaced_registers = world.attach_caller_registers(caller_registers);
        memory.refresh_frozen();
        let inputs = RootInputs {
            globals: &globals,
            exclusions: &exclusions,
            world: &world,
            caller_anchor: Some(anchor),
            user_regions: &user_regions,
            ignored: &ignored,
        };
        let roots_complete = RootEnumerator::new(&config.scan).enumerate(&inputs, &mut roots);
        let scan = Scanner::new(
            &mut table,
            &**memory,
            decoder,
            &mut mark_work,
            config.scan.ignored_objects_are_roots,
        )
        .mark_from_roots(&roots, Some(&world));
        let classification = classify(&mut table, &**memory, decoder, &mut classify_work, &mut leaked);
        let stopped_for = started.elapsed();
        self.suspender.resume_all(world);
        drop(displaced_registers);

        drop(thread_table);
        drop(table);
        drop(memory);

        if !roots_complete {
            warn!(roots = roots.len(), "root buffer exhausted, some roots were not scanned");
        }
        let skipped = scan.ranges_skipped + classification.unreadable;
        if skipped > 0 {
            self.stats.skipped_ranges.fetch_add(skipped as u64, Ordering::Relaxed);
            warn!(skipped, "unreadable ranges skipped during scan");
        }

        let summary = CheckSummary {
            live_chunks,
            reachable_chunks: classification.reachable,
            ignored_chunks: classification.ignored,
            direct_leaks: classification.direct,
            indirect_leaks: classification.indirect,
            root_ranges: scan.roots_scanned,
            skipped_ranges: skipped,
            bytes_scanned: scan.bytes_scanned,
            stopped_for,
        };
        let report = {
            let suppressions = self.suppressions.read();
            ReportBuilder::new(&self.depot, self.symbolizer.as_ref(), &suppressions, &config.report)
                .build(&leaked, summary)
        };

        self.stats.checks_run.fetch_add(1, Ordering::Relaxed);
        if report.has_leaks() {
            self.stats.checks_with_leaks.fetch_add(1, Ordering::Relaxed);
        }
        info!(
            live = live_chunks,
            reachable = classification.reachable,
            direct = classification.direct,
            indirect = classification.indirect,
            leaked_bytes = report.total_leaked_bytes,
            suppressed_bytes = report.suppressed_bytes,
            stopped_us = stopped_for.as_micros() as u64,
            "leak check complete"
        );
        Ok(report)
    }

    /// Run a leak check, emit the report, and return whether unsuppressed
    /// leaks were found. May be called any number of times.
    #[inline(never)]
    pub fn do_leak_check(&self) -> bool {
        let anchor = 0usize;
        let anchor = std::hint::black_box(&anchor) as *const usize as usize;
        let registers = CallerRegisters::capture();
        match self.run_check(anchor, &registers) {
            Ok(report) => {
                self.emit(&report);
                report.has_leaks()
            }
            Err(LeakCheckError::Disabled) => false,
            Err(err) => {
                error!(%err, "leak check failed");
                false
            }
        }
    }

    /// Run the one final leak check of the process.
    ///
    /// The caller is responsible for exiting with the returned status.
    pub fn do_final_leak_check(&self) -> FinalCheck {
        if self.final_check_done.swap(true, Ordering::AcqRel) {
            return FinalCheck::AlreadyRan;
        }
        if !self.is_tracking() {
            return FinalCheck::Skipped;
        }
        if !self.do_leak_check() {
            return FinalCheck::Clean;
        }
        let report = self.config.read().report.clone();
        match report.policy {
            LeakPolicy::Fail => FinalCheck::Leaked {
                exit_code: Some(report.exitcode),
            },
            LeakPolicy::ReportOnly => FinalCheck::Leaked { exit_code: None },
        }
    }

    /// Prevent the final check from running. Returns whether it was still
    /// pending.
    pub fn disarm_final_check(&self) -> bool {
        !self.final_check_done.swap(true, Ordering::AcqRel)
    }

    /// Whether the final check has run or been disarmed.
    pub fn final_check_done(&self) -> bool {
        self.final_check_done.load(Ordering::Acquire)
    }

    fn emit(&self, report: &LeakReport) {
        if report.has_leaks() || (report.print_suppressions && !report.suppressed.is_empty()) {
            let _guard = InternalGuard::enter();
            self.sink.emit(report);
        }
    }

    /// The detector's own memory, which is never a root.
    fn footprint(&self) -> (usize, usize) {
        let begin = self as *const Self as usize;
        (begin, begin + size_of::<Self>())
    }

    /// Take every lock a check needs, for the duration of a `fork`.
    pub fn before_fork(&self) {
        let me = ThreadId::current().as_u64();
        if self.fork_owner.load(Ordering::Acquire) == me {
            return;
        }
        std::mem::forget(self.scan_lock.lock());
        self.chunks.lock_for_fork();
        self.threads.lock_for_fork();
        self.fork_owner.store(me, Ordering::Release);
    }

    /// Release the locks taken by [`Detector::before_fork`] in the parent.
    pub fn after_fork_parent(&self) {
        self.release_fork_locks();
    }

    /// Release the locks taken by [`Detector::before_fork`] in the child and
    /// forget every thread except the caller.
    pub fn after_fork_child(&self) {
        if self.release_fork_locks() {
            let _guard = InternalGuard::enter();
            self.threads.retain_only(
                ThreadId::current(),
                thread::current_os_tid(),
                current_os_handle(),
            );
        }
    }

    fn release_fork_locks(&self) -> bool {
        let me = ThreadId::current().as_u64();
        if self
            .fork_owner
            .compare_exchange(me, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        // SAFETY: all three guards were forgotten by before_fork on this
        // thread, and fork_owner proves they are still held.
        unsafe {
            self.threads.unlock_after_fork();
            self.chunks.unlock_after_fork();
            self.scan_lock.force_unlock();
        }
        true
    }
}

#[cfg(unix)]
fn current_os_handle() -> usize {
    // SAFETY: pthread_self has no preconditions.
    unsafe { libc::pthread_self() as usize }
}

#[cfg(not(unix))]
fn current_os_handle() -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::LeakKind;
    use crate::memory::SnapshotMemory;
    use crate::modules::FixedSegments;
    use crate::suspend::NoopSuspender;
    use crate::symbolize::{NullSymbolizer, SymbolizedFrame};
    use std::sync::Arc;

    const GLOBALS: usize = 0x10_0000;
    const HEAP: usize = 0x20_0000;

    struct Fixture {
        detector: Detector,
        memory: SnapshotMemory,
        reports: Arc<Mutex<Vec<LeakReport>>>,
    }

    fn fixture(config: DetectorConfig) -> Fixture {
        fixture_with(config, |builder| builder)
    }

    fn fixture_with(
        config: DetectorConfig,
        customize: impl FnOnce(DetectorBuilder) -> DetectorBuilder,
    ) -> Fixture {
        let memory = SnapshotMemory::new();
        memory.map_zeroed(GLOBALS, 0x100).unwrap();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink_reports = Arc::clone(&reports);
        let builder = Detector::builder(config)
            .memory(memory.clone())
            .suspender(NoopSuspender)
            .modules(FixedSegments::new([(GLOBALS, GLOBALS + 0x100)]))
            .symbolizer(NullSymbolizer)
            .sink(move |report: &LeakReport| sink_reports.lock().push(report.clone()));
        let detector = customize(builder).build().unwrap();
        Fixture {
            detector,
            memory,
            reports,
        }
    }

    fn config() -> DetectorConfig {
        DetectorConfig::builder()
            .use_stacks(false)
            .use_tls(false)
            .use_registers(false)
            .build()
            .unwrap()
    }

    impl Fixture {
        fn alloc(&self, offset: usize, size: usize) -> usize {
            let address = HEAP + offset;
            self.memory.map_zeroed(address, size).unwrap();
            self.detector
                .record_allocation(address, size, ChunkState::Unmarked, ChunkTag::GENERIC);
            address
        }
    }

    #[test]
    fn test_global_pointer_keeps_chunk_alive() {
        let f = fixture(config());
        let a = f.alloc(0, 64);
        f.memory.write_word(GLOBALS, a).unwrap();
        let report = f.detector.check_leaks().unwrap();
        assert!(!report.has_leaks());
        assert_eq!(report.summary.reachable_chunks, 1);
    }

    #[test]
    fn test_direct_and_indirect() {
        let f = fixture(config());
        let a = f.alloc(0, 32);
        let b = f.alloc(0x100, 48);
        f.memory.write_word(a, b).unwrap();
        let report = f.detector.check_leaks().unwrap();
        assert_eq!(report.bytes_of(LeakKind::Direct), 32);
        assert_eq!(report.bytes_of(LeakKind::Indirect), 48);
        assert_eq!(report.total_leaked_objects, 2);
    }

    #[test]
    fn test_repeated_checks_are_consistent() {
        let f = fixture(config());
        let a = f.alloc(0, 16);
        f.memory.write_word(GLOBALS, a).unwrap();
        assert!(!f.detector.check_leaks().unwrap().has_leaks());
        f.memory.write_word(GLOBALS, 0).unwrap();
        assert!(f.detector.check_leaks().unwrap().has_leaks());
        f.memory.write_word(GLOBALS, a).unwrap();
        assert!(!f.detector.check_leaks().unwrap().has_leaks());
        assert_eq!(f.detector.stats().checks_run, 3);
        assert_eq!(f.detector.stats().checks_with_leaks, 1);
    }

    #[test]
    fn test_free_removes_chunk() {
        let f = fixture(config());
        let a = f.alloc(0, 16);
        assert!(f.detector.record_free(a).is_some());
        assert!(f.detector.record_free(a).is_none());
        assert_eq!(f.detector.stats().untracked_frees, 1);
        assert!(!f.detector.check_leaks().unwrap().has_leaks());
    }

    #[test]
    fn test_double_allocation_is_counted() {
        let f = fixture(config());
        let a = f.alloc(0, 16);
        f.detector
            .record_allocation(a, 16, ChunkState::Unmarked, ChunkTag::GENERIC);
        assert_eq!(f.detector.stats().double_allocations, 1);
        assert_eq!(f.detector.chunks().len(), 1);
    }

    #[test]
    fn test_ignore_object_and_disabled_allocation() {
        let f = fixture(config());
        let a = f.alloc(0, 16);
        assert_eq!(f.detector.ignore_object(a + 4), Ok(IgnoreOutcome::Ignored));
        assert_eq!(f.detector.ignore_object(a), Ok(IgnoreOutcome::AlreadyIgnored));
        assert!(f.detector.ignore_object(HEAP + 0x5000).is_err());

        let b = HEAP + 0x100;
        f.memory.map_zeroed(b, 16).unwrap();
        f.detector
            .record_allocation(b, 16, ChunkState::IgnoreRequested, ChunkTag::GENERIC);
        let report = f.detector.check_leaks().unwrap();
        assert!(!report.has_leaks());
        assert_eq!(report.summary.ignored_chunks, 2);
    }

    #[test]
    fn test_root_region() {
        let f = fixture(config());
        let a = f.alloc(0, 16);
        let region = HEAP + 0x1000;
        f.memory.map_zeroed(region, 64).unwrap();
        f.memory.write_word(region + 8, a).unwrap();
        assert!(f.detector.check_leaks().unwrap().has_leaks());
        f.detector.register_root_region(region, 64).unwrap();
        assert!(!f.detector.check_leaks().unwrap().has_leaks());
        f.detector.unregister_root_region(region, 64).unwrap();
        assert!(f.detector.check_leaks().unwrap().has_leaks());
    }

    #[test]
    fn test_disabled_detector() {
        let f = fixture(DetectorConfig::builder().detect_leaks(false).build().unwrap());
        assert!(!f.detector.is_tracking());
        assert!(matches!(f.detector.check_leaks(), Err(LeakCheckError::Disabled)));
        assert!(!f.detector.do_leak_check());
        assert_eq!(f.detector.do_final_leak_check(), FinalCheck::Skipped);
    }

    #[test]
    fn test_do_leak_check_emits_only_with_leaks() {
        let f = fixture(config());
        let a = f.alloc(0, 16);
        f.memory.write_word(GLOBALS, a).unwrap();
        assert!(!f.detector.do_leak_check());
        assert!(f.reports.lock().is_empty());
        f.memory.write_word(GLOBALS, 0).unwrap();
        assert!(f.detector.do_leak_check());
        assert_eq!(f.reports.lock().len(), 1);
    }

    #[test]
    fn test_final_check_runs_once() {
        let f = fixture(config());
        f.alloc(0, 16);
        assert_eq!(
            f.detector.do_final_leak_check(),
            FinalCheck::Leaked { exit_code: Some(23) }
        );
        assert_eq!(f.detector.do_final_leak_check(), FinalCheck::AlreadyRan);
        assert_eq!(f.reports.lock().len(), 1);
    }

    #[test]
    fn test_final_check_report_only_policy() {
        let mut cfg = config();
        cfg.report.policy = LeakPolicy::ReportOnly;
        let f = fixture(cfg);
        f.alloc(0, 16);
        let outcome = f.detector.do_final_leak_check();
        assert_eq!(outcome, FinalCheck::Leaked { exit_code: None });
        assert_eq!(outcome.exit_code(), None);
    }

    #[test]
    fn test_disarmed_final_check() {
        let f = fixture(config());
        f.alloc(0, 16);
        assert!(f.detector.disarm_final_check());
        assert!(!f.detector.disarm_final_check());
        assert_eq!(f.detector.do_final_leak_check(), FinalCheck::AlreadyRan);
        assert!(f.reports.lock().is_empty());
    }

    #[test]
    fn test_nonmatching_suppression_keeps_leak() {
        let f = fixture(config());
        f.alloc(0, 16);
        // NullSymbolizer frames have no names, so match nothing.
        f.detector.add_suppressions("leak:never_matches").unwrap();
        let report = f.detector.check_leaks().unwrap();
        assert!(report.has_leaks());
        assert_eq!(report.suppressed_objects, 0);
        assert!(report.suppressed.is_empty());
    }

    /// Every allocation comes from the single frame 0xa.
    struct OneFrame;

    impl StackTraceProducer for OneFrame {
        fn capture(&self, _skip: usize, out: &mut [usize]) -> usize {
            match out.first_mut() {
                Some(slot) => {
                    *slot = 0xa;
                    1
                }
                None => 0,
            }
        }
    }

    struct SiteSymbolizer;

    impl Symbolizer for SiteSymbolizer {
        fn symbolize(&self, address: usize) -> Vec<SymbolizedFrame> {
            vec![SymbolizedFrame {
                function: Some(format!("make_cache_{:x}", address)),
                ..SymbolizedFrame::unknown(address)
            }]
        }
    }

    #[test]
    fn test_matching_suppression_hides_leak() {
        let f = fixture_with(config(), |builder| builder.unwinder(OneFrame).symbolizer(SiteSymbolizer));
        f.alloc(0, 16);
        f.alloc(0x100, 24);
        f.detector.add_suppressions("leak:make_cache_a").unwrap();

        let report = f.detector.check_leaks().unwrap();
        assert!(!report.has_leaks());
        assert!(report.entries.is_empty());
        assert_eq!(report.total_leaked_bytes, 0);
        assert_eq!(report.summary.direct_leaks, 2);
        assert_eq!(report.suppressed_objects, 2);
        assert_eq!(report.suppressed_bytes, 40);
        assert_eq!(report.suppressed.len(), 1);
        assert_eq!(report.suppressed[0].pattern, "make_cache_a");
        assert_eq!(report.suppressed[0].object_count, 2);
        assert_eq!(report.suppressed[0].total_bytes, 40);

        // Suppression statistics are still emitted.
        assert!(!f.detector.do_leak_check());
        assert_eq!(f.reports.lock().len(), 1);
    }

    #[cfg(all(
        target_os = "linux",
        target_env = "gnu",
        any(target_arch = "x86_64", target_arch = "aarch64")
    ))]
    #[test]
    fn test_checking_thread_registers_are_roots() {
        let without = fixture(config()).detector.check_leaks().unwrap();
        assert_eq!(without.summary.root_ranges, 1);

        let mut cfg = config();
        cfg.scan.use_registers = true;
        let with = fixture(cfg).detector.check_leaks().unwrap();
        assert_eq!(with.summary.root_ranges, 2);
    }

    #[test]
    fn test_set_config_toggles_tracking() {
        let f = fixture(config());
        let mut cfg = f.detector.config();
        cfg.detect_leaks = false;
        f.detector.set_config(cfg);
        assert!(!f.detector.is_tracking());
    }

    #[test]
    fn test_fork_hooks_are_idempotent() {
        let f = fixture(config());
        f.detector.before_fork();
        f.detector.before_fork();
        f.detector.after_fork_parent();
        f.detector.after_fork_parent();
        // Locks are free again.
        f.alloc(0, 16);
        assert!(f.detector.check_leaks().unwrap().has_leaks());
    }
}
