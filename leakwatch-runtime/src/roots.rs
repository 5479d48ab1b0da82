//! Root enumeration.
//!
//! A root is memory that is live by definition: global data, thread stacks,
//! captured registers, static TLS, regions registered by the program, and
//! (by default) the contents of ignored objects. The enumerator produces them
//! in a fixed order so that repeated checks scan identically:
//!
//! ```text
//! globals -> per thread (by id): stack, registers, TLS -> user regions -> ignored objects
//! ```
//!
//! Enumeration runs while the world is frozen and only pushes into a vector
//! whose capacity was reserved beforehand.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use thiserror::Error;

use crate::config::ScanConfig;
use crate::hooks::untracked;
use crate::modules::GlobalSegment;
use crate::suspend::FrozenWorld;
use crate::thread::ThreadId;

/// Where a root range came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RootOrigin {
    /// Writable data segment of a loaded module.
    Global,
    /// Thread stack.
    Stack,
    /// Captured register file.
    Registers,
    /// Static TLS block.
    Tls,
    /// Region registered by the program.
    UserRegion,
    /// Contents of an ignored object.
    IgnoredObject,
}

impl RootOrigin {
    /// Short name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RootOrigin::Global => "globals",
            RootOrigin::Stack => "stack",
            RootOrigin::Registers => "registers",
            RootOrigin::Tls => "tls",
            RootOrigin::UserRegion => "root region",
            RootOrigin::IgnoredObject => "ignored object",
        }
    }
}

impl fmt::Display for RootOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The memory a root covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootSpan {
    /// Addresses `[begin, end)` of the live address space.
    Memory {
        /// First address.
        begin: usize,
        /// One past the last address.
        end: usize,
    },
    /// Registers captured for the thread at this index of the frozen world.
    Registers {
        /// Index into [`FrozenWorld::threads`].
        thread_index: usize,
    },
}

/// One root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootRange {
    /// Source category.
    pub origin: RootOrigin,
    /// Owning thread, for per-thread roots.
    pub thread: Option<ThreadId>,
    /// Covered memory.
    pub span: RootSpan,
}

impl RootRange {
    /// A root over live memory.
    pub fn memory(origin: RootOrigin, begin: usize, end: usize) -> Self {
        Self {
            origin,
            thread: None,
            span: RootSpan::Memory { begin, end },
        }
    }

    fn owned_by(mut self, thread: ThreadId) -> Self {
        self.thread = Some(thread);
        self
    }
}

/// A registered root region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RootRegion {
    /// First address.
    pub begin: usize,
    /// Size in bytes.
    pub size: usize,
}

impl RootRegion {
    /// One past the last address.
    pub fn end(&self) -> usize {
        self.begin.saturating_add(self.size)
    }
}

/// Root region errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RootRegionError {
    /// The region is empty.
    #[error("root region at {begin:#x} is empty")]
    Empty {
        /// Start address.
        begin: usize,
    },
    /// The region wraps around the address space.
    #[error("root region at {begin:#x} with size {size} overflows")]
    Overflow {
        /// Start address.
        begin: usize,
        /// Size.
        size: usize,
    },
    /// No region with exactly these bounds is registered.
    #[error("root region [{begin:#x}, +{size}) is not registered")]
    NotRegistered {
        /// Start address.
        begin: usize,
        /// Size.
        size: usize,
    },
}

/// Program-registered root regions.
///
/// Registering the same region twice requires unregistering it twice.
#[derive(Debug, Default)]
pub struct RootRegionSet {
    regions: Mutex<BTreeMap<RootRegion, usize>>,
}

impl RootRegionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `[begin, begin + size)`.
    pub fn register(&self, begin: usize, size: usize) -> Result<(), RootRegionError> {
        if size == 0 {
            return Err(RootRegionError::Empty { begin });
        }
        if begin.checked_add(size).is_none() {
            return Err(RootRegionError::Overflow { begin, size });
        }
        untracked(|| {
            *self.regions.lock().entry(RootRegion { begin, size }).or_insert(0) += 1;
        });
        Ok(())
    }

    /// Unregister a region with exactly these bounds.
    pub fn unregister(&self, begin: usize, size: usize) -> Result<(), RootRegionError> {
        let key = RootRegion { begin, size };
        untracked(|| {
            let mut regions = self.regions.lock();
            match regions.get_mut(&key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    Ok(())
                }
                Some(_) => {
                    regions.remove(&key);
                    Ok(())
                }
                None => Err(RootRegionError::NotRegistered { begin, size }),
            }
        })
    }

    /// Distinct registered regions, sorted.
    pub fn snapshot(&self) -> Vec<RootRegion> {
        untracked(|| self.regions.lock().keys().copied().collect())
    }

    /// Number of distinct registered regions.
    pub fn len(&self) -> usize {
        self.regions.lock().len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.regions.lock().is_empty()
    }
}

/// Everything the enumerator reads.
#[derive(Debug, Clone, Copy)]
pub struct RootInputs<'a> {
    /// Writable data segments.
    pub globals: &'a [GlobalSegment],
    /// Ranges to cut out of global segments, sorted by start.
    pub exclusions: &'a [(usize, usize)],
    /// The frozen world.
    pub world: &'a FrozenWorld,
    /// Address of a local in the checking frame; the caller's stack is
    /// scanned from here upward.
    pub caller_anchor: Option<usize>,
    /// Registered root regions.
    pub user_regions: &'a [RootRegion],
    /// Spans of ignored objects.
    pub ignored: &'a [(usize, usize)],
}

impl RootInputs<'_> {
    /// Upper bound on the number of ranges [`RootEnumerator::enumerate`]
    /// can produce.
    pub fn max_ranges(&self) -> usize {
        self.globals.len() * (1 + self.exclusions.len())
            + self.world.threads().len() * 3
            + self.user_regions.len()
            + self.ignored.len()
    }
}

/// Collects roots according to a [`ScanConfig`].
#[derive(Debug, Clone, Copy)]
pub struct RootEnumerator<'c> {
    config: &'c ScanConfig,
}

impl<'c> RootEnumerator<'c> {
    /// Create an enumerator.
    pub fn new(config: &'c ScanConfig) -> Self {
        Self { config }
    }

    /// Append every root to `out`, never growing it past its capacity.
    ///
    /// Returns `false` if some roots were dropped for lack of capacity.
    pub fn enumerate(&self, inputs: &RootInputs<'_>, out: &mut Vec<RootRange>) -> bool {
        let mut sink = BoundedSink { out, complete: true };

        if self.config.use_globals {
            for segment in inputs.globals {
                subtract_exclusions(segment.begin, segment.end, inputs.exclusions, |begin, end| {
                    sink.push(RootRange::memory(RootOrigin::Global, begin, end))
                });
            }
        }

        for (index, thread) in inputs.world.threads().iter().enumerate() {
            let id = thread.record.thread_id;
            if self.config.use_stacks {
                let (begin, end) = if id == inputs.world.caller() {
                    caller_stack(thread.record.stack_begin, thread.record.stack_end, inputs.caller_anchor)
                } else {
                    thread.live_stack()
                };
                if begin < end {
                    sink.push(RootRange::memory(RootOrigin::Stack, begin, end).owned_by(id));
                }
            }
            if self.config.use_registers && !thread.registers().is_empty() {
                sink.push(
                    RootRange {
                        origin: RootOrigin::Registers,
                        thread: None,
                        span: RootSpan::Registers { thread_index: index },
                    }
                    .owned_by(id),
                );
            }
            if self.config.use_tls && thread.record.has_tls() {
                sink.push(
                    RootRange::memory(RootOrigin::Tls, thread.record.tls_begin, thread.record.tls_end)
                        .owned_by(id),
                );
            }
        }

        if self.config.use_root_regions {
            for region in inputs.user_regions {
                sink.push(RootRange::memory(RootOrigin::UserRegion, region.begin, region.end()));
            }
        }

        if self.config.ignored_objects_are_roots {
            for &(begin, end) in inputs.ignored {
                if begin < end {
                    sink.push(RootRange::memory(RootOrigin::IgnoredObject, begin, end));
                }
            }
        }

        sink.complete
    }
}

struct BoundedSink<'v> {
    out: &'v mut Vec<RootRange>,
    complete: bool,
}

impl BoundedSink<'_> {
    fn push(&mut self, root: RootRange) {
        if self.out.len() < self.out.capacity() {
            self.out.push(root);
        } else {
            self.complete = false;
        }
    }
}

/// The calling thread's stack is scanned from `anchor` upward, so frames of
/// the checker itself are skipped.
fn caller_stack(begin: usize, end: usize, anchor: Option<usize>) -> (usize, usize) {
    match anchor {
        Some(anchor) if anchor >= begin && anchor < end => (anchor, end),
        _ => (begin, end),
    }
}

/// Emit the parts of `[begin, end)` not covered by `exclusions`.
///
/// `exclusions` must be sorted by start address.
pub fn subtract_exclusions(
    begin: usize,
    end: usize,
    exclusions: &[(usize, usize)],
    mut emit: impl FnMut(usize, usize),
) {
    let mut cursor = begin;
    for &(ex_begin, ex_end) in exclusions {
        if ex_end <= cursor || ex_begin >= ex_end {
            continue;
        }
        if ex_begin >= end {
            break;
        }
        if ex_begin > cursor {
            emit(cursor, ex_begin);
        }
        cursor = cursor.max(ex_end);
        if cursor >= end {
            return;
        }
    }
    if cursor < end {
        emit(cursor, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suspend::{FrozenThread, NoopSuspender, Suspender};
    use crate::thread::ThreadRecord;

    fn collect(begin: usize, end: usize, exclusions: &[(usize, usize)]) -> Vec<(usize, usize)> {
        let mut parts = Vec::new();
        subtract_exclusions(begin, end, exclusions, |b, e| parts.push((b, e)));
        parts
    }

    #[test]
    fn test_subtract_exclusions() {
        assert_eq!(collect(0, 100, &[]), vec![(0, 100)]);
        assert_eq!(collect(0, 100, &[(10, 20)]), vec![(0, 10), (20, 100)]);
        assert_eq!(collect(0, 100, &[(0, 20), (90, 200)]), vec![(20, 90)]);
        assert_eq!(collect(0, 100, &[(0, 100)]), Vec::<(usize, usize)>::new());
        assert_eq!(collect(50, 100, &[(10, 20), (200, 300)]), vec![(50, 100)]);
        assert_eq!(collect(0, 100, &[(10, 20), (15, 30), (40, 50)]), vec![(0, 10), (30, 40), (50, 100)]);
    }

    #[test]
    fn test_root_region_refcount() {
        let set = RootRegionSet::new();
        set.register(0x1000, 64).unwrap();
        set.register(0x1000, 64).unwrap();
        set.register(0x2000, 8).unwrap();
        assert_eq!(set.len(), 2);

        set.unregister(0x1000, 64).unwrap();
        assert_eq!(set.len(), 2);
        set.unregister(0x1000, 64).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.unregister(0x1000, 64),
            Err(RootRegionError::NotRegistered { begin: 0x1000, size: 64 })
        );
        // Bounds must match exactly.
        assert!(set.unregister(0x2000, 4).is_err());
        assert_eq!(set.snapshot(), vec![RootRegion { begin: 0x2000, size: 8 }]);
    }

    #[test]
    fn test_root_region_validation() {
        let set = RootRegionSet::new();
        assert_eq!(set.register(0x1000, 0), Err(RootRegionError::Empty { begin: 0x1000 }));
        assert!(matches!(
            set.register(usize::MAX - 4, 8),
            Err(RootRegionError::Overflow { .. })
        ));
        assert!(set.is_empty());
    }

    fn world() -> FrozenWorld {
        let caller = ThreadRecord::new(ThreadId(1), 0x10000, 0x20000, 0x30000, 0x30100);
        let other = ThreadRecord::new(ThreadId(2), 0x40000, 0x50000, 0, 0);
        FrozenWorld::new(
            vec![
                FrozenThread::with_registers(other, vec![0xdead, 0xbeef], Some(0x48000)),
                FrozenThread::new(caller),
            ],
            ThreadId(1),
        )
    }

    #[test]
    fn test_enumerate_order() {
        let world = world();
        let globals = [GlobalSegment { begin: 0x100, end: 0x200, module_index: 0 }];
        let exclusions = [(0x150, 0x160)];
        let regions = [RootRegion { begin: 0x900, size: 16 }];
        let ignored = [(0xa00, 0xa10)];
        let inputs = RootInputs {
            globals: &globals,
            exclusions: &exclusions,
            world: &world,
            caller_anchor: Some(0x18000),
            user_regions: &regions,
            ignored: &ignored,
        };
        let config = ScanConfig::default();
        let mut roots = Vec::with_capacity(inputs.max_ranges());
        assert!(RootEnumerator::new(&config).enumerate(&inputs, &mut roots));

        let origins: Vec<RootOrigin> = roots.iter().map(|r| r.origin).collect();
        assert_eq!(
            origins,
            vec![
                RootOrigin::Global,
                RootOrigin::Global,
                RootOrigin::Stack,
                RootOrigin::Tls,
                RootOrigin::Stack,
                RootOrigin::Registers,
                RootOrigin::UserRegion,
                RootOrigin::IgnoredObject,
            ]
        );
        assert_eq!(roots[0].span, RootSpan::Memory { begin: 0x100, end: 0x150 });
        assert_eq!(roots[1].span, RootSpan::Memory { begin: 0x160, end: 0x200 });
        // Caller stack clipped at the anchor.
        assert_eq!(roots[2].span, RootSpan::Memory { begin: 0x18000, end: 0x20000 });
        assert_eq!(roots[2].thread, Some(ThreadId(1)));
        // Other thread scanned from its stack pointer.
        assert_eq!(
            roots[4].span,
            RootSpan::Memory { begin: world.threads()[1].live_stack().0, end: 0x50000 }
        );
        assert_eq!(roots[5].span, RootSpan::Registers { thread_index: 1 });
        assert_eq!(roots[6].span, RootSpan::Memory { begin: 0x900, end: 0x910 });
    }

    #[test]
    fn test_caller_registers_are_enumerated() {
        let mut world = world();
        let displaced = world.attach_caller_registers(vec![0x1234].into_boxed_slice());
        assert!(displaced.is_empty());
        let inputs = RootInputs {
            globals: &[],
            exclusions: &[],
            world: &world,
            caller_anchor: None,
            user_regions: &[],
            ignored: &[],
        };
        let config = ScanConfig {
            use_stacks: false,
            use_tls: false,
            ..ScanConfig::default()
        };
        let mut roots = Vec::with_capacity(inputs.max_ranges());
        RootEnumerator::new(&config).enumerate(&inputs, &mut roots);
        let registers: Vec<(Option<ThreadId>, RootSpan)> = roots
            .iter()
            .filter(|root| root.origin == RootOrigin::Registers)
            .map(|root| (root.thread, root.span))
            .collect();
        assert_eq!(
            registers,
            vec![
                (Some(ThreadId(1)), RootSpan::Registers { thread_index: 0 }),
                (Some(ThreadId(2)), RootSpan::Registers { thread_index: 1 }),
            ]
        );
        assert_eq!(world.threads()[0].registers(), &[0x1234]);
    }

    #[test]
    fn test_enumerate_respects_config() {
        let world = world();
        let globals = [GlobalSegment { begin: 0x100, end: 0x200, module_index: 0 }];
        let ignored = [(0xa00, 0xa10)];
        let inputs = RootInputs {
            globals: &globals,
            exclusions: &[],
            world: &world,
            caller_anchor: None,
            user_regions: &[],
            ignored: &ignored,
        };
        let config = ScanConfig {
            use_globals: false,
            use_stacks: false,
            use_registers: true,
            use_tls: false,
            use_root_regions: true,
            use_unaligned: false,
            ignored_objects_are_roots: false,
        };
        let mut roots = Vec::with_capacity(inputs.max_ranges());
        RootEnumerator::new(&config).enumerate(&inputs, &mut roots);
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].origin, RootOrigin::Registers);
    }

    #[test]
    fn test_enumerate_never_grows_output() {
        let world = NoopSuspender
            .freeze_all(vec![ThreadRecord::new(ThreadId(1), 0x1000, 0x2000, 0, 0)], ThreadId(9))
            .unwrap();
        let regions = [RootRegion { begin: 0x900, size: 16 }, RootRegion { begin: 0x990, size: 16 }];
        let inputs = RootInputs {
            globals: &[],
            exclusions: &[],
            world: &world,
            caller_anchor: None,
            user_regions: &regions,
            ignored: &[],
        };
        let config = ScanConfig::default();
        let mut roots = Vec::with_capacity(2);
        let capacity = roots.capacity();
        assert!(!RootEnumerator::new(&config).enumerate(&inputs, &mut roots));
        assert_eq!(roots.len(), capacity);
        assert_eq!(roots.capacity(), capacity);
    }
}
