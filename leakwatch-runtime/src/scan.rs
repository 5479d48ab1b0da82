//! Reachability scanning.
//!
//! Conservative mark phase. Every pointer-sized word in a root is treated as
//! a potential pointer; a word that lands inside a tracked chunk (interior
//! pointers included) marks that chunk reachable and queues its contents for
//! scanning. Marking uses an explicit work stack, so arbitrarily long chains
//! and cycles are handled without recursion, and each chunk is queued at most
//! once per check.
//!
//! Memory is read in fixed-size blocks through a [`MemorySource`]; a block
//! that cannot be read ends the scan of its range and is counted as skipped.

use std::mem::size_of;

use crate::chunk::{ChunkState, ChunkTable};
use crate::config::ScanConfig;
use crate::memory::{MemorySource, ReadError};
use crate::roots::{RootRange, RootSpan};
use crate::suspend::FrozenWorld;

/// Bytes read from a memory source at a time.
pub const SCAN_BLOCK: usize = 4096;

const WORD: usize = size_of::<usize>();

/// Turns raw bytes into candidate pointer values.
pub trait PointerDecoder: Send + Sync {
    /// Alignment required of the first candidate in a range.
    fn alignment(&self) -> usize;

    /// Feed every candidate fully contained in `bytes` to `sink`.
    ///
    /// Returns the offset at which decoding of the following block must
    /// resume.
    fn decode(&self, bytes: &[u8], sink: &mut dyn FnMut(usize)) -> usize;
}

/// Native-endian words at aligned (or, optionally, every) byte offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConservativeDecoder {
    unaligned: bool,
}

impl ConservativeDecoder {
    /// Candidates at pointer-aligned offsets only.
    pub const fn aligned() -> Self {
        Self { unaligned: false }
    }

    /// Candidates at every byte offset.
    pub const fn unaligned() -> Self {
        Self { unaligned: true }
    }

    /// Decoder matching `config.use_unaligned`.
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            unaligned: config.use_unaligned,
        }
    }
}

impl PointerDecoder for ConservativeDecoder {
    fn alignment(&self) -> usize {
        if self.unaligned {
            1
        } else {
            WORD
        }
    }

    fn decode(&self, bytes: &[u8], sink: &mut dyn FnMut(usize)) -> usize {
        if bytes.len() < WORD {
            return 0;
        }
        let mut word = [0u8; WORD];
        if self.unaligned {
            for window in bytes.windows(WORD) {
                word.copy_from_slice(window);
                sink(usize::from_ne_bytes(word));
            }
            bytes.len() - WORD + 1
        } else {
            let chunks = bytes.chunks_exact(WORD);
            let consumed = bytes.len() - chunks.remainder().len();
            for chunk in chunks {
                word.copy_from_slice(chunk);
                sink(usize::from_ne_bytes(word));
            }
            consumed
        }
    }
}

/// Decode every candidate in `[begin, end)`.
///
/// Returns the number of bytes read, or the first read error. Candidates
/// decoded before the error have already been delivered.
pub fn for_each_candidate(
    memory: &dyn MemorySource,
    decoder: &dyn PointerDecoder,
    begin: usize,
    end: usize,
    visit: &mut dyn FnMut(usize),
) -> Result<usize, ReadError> {
    let align = decoder.alignment().max(1);
    let mut cursor = match begin.checked_add(align - 1) {
        Some(rounded) => rounded & !(align - 1),
        None => return Ok(0),
    };
    let mut block = [0u8; SCAN_BLOCK];
    let mut total = 0;
    while cursor < end && end - cursor >= WORD {
        let len = (end - cursor).min(SCAN_BLOCK);
        let bytes = &mut block[..len];
        memory.read(cursor, bytes)?;
        total += len;
        let consumed = decoder.decode(bytes, visit);
        if consumed == 0 {
            break;
        }
        cursor += consumed;
    }
    Ok(total)
}

/// Counters for one mark phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ScanStats {
    /// Root ranges processed.
    pub roots_scanned: usize,
    /// Ranges (roots or chunks) abandoned because they could not be read.
    pub ranges_skipped: usize,
    /// Bytes read.
    pub bytes_scanned: usize,
    /// Chunks newly marked reachable.
    pub chunks_marked: usize,
}

/// Mark phase over a locked chunk table.
pub struct Scanner<'a> {
    table: &'a mut ChunkTable,
    memory: &'a dyn MemorySource,
    decoder: &'a dyn PointerDecoder,
    work: &'a mut Vec<(usize, usize)>,
    ignored_are_roots: bool,
    stats: ScanStats,
}

impl<'a> Scanner<'a> {
    /// Create a scanner.
    ///
    /// `work` must have capacity for every chunk in `table`; it is never
    /// grown.
    pub fn new(
        table: &'a mut ChunkTable,
        memory: &'a dyn MemorySource,
        decoder: &'a dyn PointerDecoder,
        work: &'a mut Vec<(usize, usize)>,
        ignored_are_roots: bool,
    ) -> Self {
        work.clear();
        Self {
            table,
            memory,
            decoder,
            work,
            ignored_are_roots,
            stats: ScanStats::default(),
        }
    }

    /// Mark everything reachable from `roots`.
    ///
    /// Register roots are resolved against `world`.
    pub fn mark_from_roots(mut self, roots: &[RootRange], world: Option<&FrozenWorld>) -> ScanStats {
        for root in roots {
            self.stats.roots_scanned += 1;
            match root.span {
                RootSpan::Memory { begin, end } => self.scan_range(begin, end),
                RootSpan::Registers { thread_index } => {
                    let words = world
                        .and_then(|world| world.threads().get(thread_index))
                        .map(|thread| thread.registers())
                        .unwrap_or(&[]);
                    for &word in words {
                        self.visit(word);
                    }
                }
            }
            self.drain();
        }
        self.stats
    }

    fn drain(&mut self) {
        while let Some((begin, end)) = self.work.pop() {
            self.scan_range(begin, end);
        }
    }

    fn scan_range(&mut self, begin: usize, end: usize) {
        let table = &mut *self.table;
        let work = &mut *self.work;
        let stats = &mut self.stats;
        let ignored_are_roots = self.ignored_are_roots;
        let result = for_each_candidate(self.memory, self.decoder, begin, end, &mut |value| {
            if mark_candidate(table, work, ignored_are_roots, value) {
                stats.chunks_marked += 1;
            }
        });
        match result {
            Ok(bytes) => self.stats.bytes_scanned += bytes,
            Err(_) => self.stats.ranges_skipped += 1,
        }
    }

    fn visit(&mut self, value: usize) {
        if mark_candidate(self.table, self.work, self.ignored_are_roots, value) {
            self.stats.chunks_marked += 1;
        }
    }
}

/// Apply one candidate value. Returns whether a chunk became reachable.
fn mark_candidate(
    table: &mut ChunkTable,
    work: &mut Vec<(usize, usize)>,
    ignored_are_roots: bool,
    value: usize,
) -> bool {
    let Some(chunk) = table.find_containing_mut(value) else {
        return false;
    };
    match chunk.state {
        ChunkState::Unmarked => {
            chunk.state = ChunkState::Reachable;
            push_bounded(work, chunk.span());
            true
        }
        // An ignored chunk that is not itself a root is scanned the first
        // time something reaches it.
        ChunkState::IgnoreRequested if !ignored_are_roots && !chunk.scanned => {
            chunk.scanned = true;
            push_bounded(work, chunk.span());
            false
        }
        _ => false,
    }
}

fn push_bounded(work: &mut Vec<(usize, usize)>, span: (usize, usize)) {
    // Each chunk is queued at most once, so a stack sized to the table never
    // overflows.
    debug_assert!(work.len() < work.capacity());
    if work.len() < work.capacity() {
        work.push(span);
    }
}
