//! # Leakwatch Runtime
//!
//! A conservative, stop-the-world heap leak detector for native processes.
//!
//! - **Allocation tracking**: a [`GlobalAlloc`](std::alloc::GlobalAlloc)
//!   wrapper records every live allocation with its allocation-site stack
//! - **Root enumeration**: globals, thread stacks, registers, static TLS and
//!   registered root regions
//! - **Reachability scan**: every pointer-sized word is a candidate pointer;
//!   interior pointers count
//! - **Classification**: unreachable chunks are direct or indirect leaks,
//!   filtered through suppressions and grouped by allocation site
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        LEAKWATCH RUNTIME                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Alloc hooks  │  │    Chunk     │  │    Thread    │          │
//! │  │  (hooks.rs)  │─▶│  registry    │  │   registry   │          │
//! │  └──────────────┘  │  (chunk.rs)  │  │ (thread.rs)  │          │
//! │                    └──────────────┘  └──────────────┘          │
//! │                           │                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Suspender   │─▶│    Roots     │─▶│   Scanner    │          │
//! │  │ (suspend.rs) │  │  (roots.rs)  │  │  (scan.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                             │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Report    │◀─│ Suppressions │◀─│  Classifier  │          │
//! │  │ (report.rs)  │  │(suppression) │  │(classify.rs) │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use leakwatch_runtime::LeakCheckAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: LeakCheckAllocator = LeakCheckAllocator::new();
//!
//! fn main() {
//!     leakwatch_runtime::init().expect("leakwatch init");
//!     // ...
//!     if leakwatch_runtime::do_leak_check() {
//!         eprintln!("leaks found");
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod chunk;
pub mod classify;
pub mod config;
pub mod detector;
pub mod ffi_exports;
pub mod hooks;
pub mod lifecycle;
pub mod maps;
pub mod memory;
pub mod modules;
pub mod report;
pub mod roots;
pub mod scan;
pub mod stack;
pub mod suppression;
pub mod suspend;
pub mod symbolize;
pub mod thread;

use std::cell::{Cell, RefCell};
use std::sync::{Once, OnceLock};

use thiserror::Error;
use tracing::{info, warn};

use crate::thread::ThreadRegistration;

// Re-exports
pub use chunk::{Chunk, ChunkRegistry, ChunkState, ChunkTag, IgnoreOutcome, RegistryError};
pub use classify::{LeakKind, LeakedChunk};
pub use config::{ConfigError, DetectorConfig, DetectorConfigBuilder, LeakPolicy};
pub use detector::{Detector, DetectorBuilder, DetectorStatsSnapshot, FinalCheck, LeakCheckError};
pub use hooks::{disable_in_scope, tag_scope, DisabledScope, LeakCheckAllocator, ScopeError, TagScope};
pub use report::{LeakReport, LeakReportEntry, ReportSink};
pub use roots::RootRegionError;
pub use suppression::{SuppressionContext, SuppressionError};
pub use thread::{spawn, ThreadId};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static DETECTOR: OnceLock<Detector> = OnceLock::new();
static SETUP: Once = Once::new();

thread_local! {
    static INITIALIZING: Cell<bool> = const { Cell::new(false) };
    /// Registration of the thread that ran `init`, dropped when it exits.
    static INIT_REGISTRATION: RefCell<Option<ThreadRegistration<'static>>> = const { RefCell::new(None) };
}

/// Initialization errors.
#[derive(Debug, Error)]
pub enum InitError {
    /// The configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    /// The suppression file could not be loaded.
    #[error(transparent)]
    Suppressions(#[from] SuppressionError),
    /// `init` was re-entered on the thread that is running it.
    #[error("initialization is already in progress on this thread")]
    InProgress,
}

/// The process-wide detector, once initialized.
#[inline]
pub fn detector() -> Option<&'static Detector> {
    DETECTOR.get()
}

/// Initialize from `LEAKWATCH_OPTIONS`.
///
/// See [`init_with_builder`] for which threads are scanned.
pub fn init() -> Result<&'static Detector, InitError> {
    let config = hooks::untracked(DetectorConfig::from_env);
    init_with(config)
}

/// Initialize with an explicit configuration.
pub fn init_with(config: DetectorConfig) -> Result<&'static Detector, InitError> {
    init_with_builder(Detector::builder(config))
}

/// Initialize with a fully customized detector.
///
/// The first successful call wins; later calls return the existing detector.
/// The calling thread stays registered until it exits, and the exit-time
/// check and fork hooks are installed.
///
/// Only registered threads are suspended and have their stacks, registers
/// and TLS scanned. Threads started with plain [`std::thread::spawn`] are
/// not, so heap objects reachable only from them are reported as leaks; start
/// them with [`spawn`] or register them with [`thread::register_current`].
pub fn init_with_builder(builder: DetectorBuilder) -> Result<&'static Detector, InitError> {
    if let Some(detector) = DETECTOR.get() {
        return Ok(detector);
    }
    if INITIALIZING.try_with(|flag| flag.replace(true)).unwrap_or(true) {
        return Err(InitError::InProgress);
    }
    let result = hooks::untracked(|| build_and_install(builder));
    let _ = INITIALIZING.try_with(|flag| flag.set(false));
    result
}

fn build_and_install(builder: DetectorBuilder) -> Result<&'static Detector, InitError> {
    let config = builder.config().clone();
    config.validate()?;
    let built = builder.build()?;
    let detector = DETECTOR.get_or_init(|| built);

    SETUP.call_once(|| {
        match thread::register_current(detector.threads()) {
            Ok(registration) => {
                let kept = INIT_REGISTRATION.try_with(|slot| *slot.borrow_mut() = Some(registration));
                if kept.is_err() {
                    warn!("initializing thread is exiting, left unregistered");
                }
            }
            Err(err) => warn!(%err, "initializing thread runs unregistered"),
        }
        if config.leak_check_at_exit && config.detect_leaks {
            lifecycle::install_at_exit_check();
        }
        if let Err(err) = lifecycle::install_fork_hooks() {
            warn!(%err, "failed to install fork hooks");
        }
        info!(
            detect_leaks = config.detect_leaks,
            at_exit = config.leak_check_at_exit,
            "leakwatch initialized"
        );
    });
    Ok(detector)
}

/// Run a leak check and emit its report. Returns whether unsuppressed leaks
/// were found; `false` before initialization.
pub fn do_leak_check() -> bool {
    detector().map_or(false, Detector::do_leak_check)
}

/// Run a leak check and return the report without emitting it.
pub fn check_leaks() -> Result<LeakReport, LeakCheckError> {
    detector().ok_or(LeakCheckError::Disabled)?.check_leaks()
}

/// Exempt the heap object containing `ptr` from leak reports.
pub fn ignore_object<T: ?Sized>(ptr: *const T) -> Result<IgnoreOutcome, RegistryError> {
    let address = ptr as *const u8 as usize;
    match detector() {
        Some(detector) => detector.ignore_object(address),
        None => Err(RegistryError::NotFound { address }),
    }
}

/// Treat `[begin, begin + size)` as a root.
pub fn register_root_region(begin: *const u8, size: usize) -> Result<(), RootRegionError> {
    match detector() {
        Some(detector) => detector.register_root_region(begin as usize, size),
        None => Err(RootRegionError::NotRegistered {
            begin: begin as usize,
            size,
        }),
    }
}

/// Undo one [`register_root_region`] with the same bounds.
pub fn unregister_root_region(begin: *const u8, size: usize) -> Result<(), RootRegionError> {
    match detector() {
        Some(detector) => detector.unregister_root_region(begin as usize, size),
        None => Err(RootRegionError::NotRegistered {
            begin: begin as usize,
            size,
        }),
    }
}
