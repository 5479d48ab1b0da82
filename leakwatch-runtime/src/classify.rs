//! Leak classification.
//!
//! After marking, every chunk still `Unmarked` is leaked. A leaked chunk is
//! *indirect* when another leaked chunk points into it and *direct*
//! otherwise. A leaked cycle with no outside reference therefore yields only
//! indirect leaks; that matches what the user sees (every member is owned by
//! something else that also leaked).

use std::fmt;

use crate::chunk::{ChunkState, ChunkTable, ChunkTag};
use crate::memory::MemorySource;
use crate::scan::{for_each_candidate, PointerDecoder};
use crate::stack::StackId;
use crate::thread::ThreadId;

/// Direct or indirect leak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum LeakKind {
    /// No other leaked chunk refers to this one.
    Direct,
    /// Referenced only from other leaked chunks.
    Indirect,
}

impl fmt::Display for LeakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeakKind::Direct => f.write_str("Direct"),
            LeakKind::Indirect => f.write_str("Indirect"),
        }
    }
}

/// A leaked chunk, copied out of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakedChunk {
    /// Start address.
    pub address: usize,
    /// Size in bytes.
    pub size: usize,
    /// Allocation-site stack.
    pub stack_id: StackId,
    /// Allocating thread.
    pub thread_id: ThreadId,
    /// Tag at allocation.
    pub tag: ChunkTag,
    /// Classification.
    pub kind: LeakKind,
}

/// Chunk counts for one check. Every live chunk is in exactly one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Classification {
    /// Reachable chunks.
    pub reachable: usize,
    /// Ignored chunks.
    pub ignored: usize,
    /// Direct leaks.
    pub direct: usize,
    /// Indirect leaks.
    pub indirect: usize,
    /// Leaked chunks whose contents could not be read.
    pub unreadable: usize,
}

impl Classification {
    /// Total chunks classified.
    pub fn total(&self) -> usize {
        self.reachable + self.ignored + self.direct + self.indirect
    }
}

/// Classify every chunk left unmarked by the scanner.
///
/// `work` and `out` must have capacity for every chunk in `table`; neither
/// is grown.
pub fn classify(
    table: &mut ChunkTable,
    memory: &dyn MemorySource,
    decoder: &dyn PointerDecoder,
    work: &mut Vec<(usize, usize)>,
    out: &mut Vec<LeakedChunk>,
) -> Classification {
    let mut summary = Classification::default();

    work.clear();
    table.for_each(
        |chunk| chunk.state == ChunkState::Unmarked,
        |chunk| {
            if work.len() < work.capacity() {
                work.push(chunk.span());
            }
        },
    );

    for &(begin, end) in work.iter() {
        let result = for_each_candidate(memory, decoder, begin, end, &mut |value| {
            if let Some(target) = table.find_containing_mut(value) {
                if target.state == ChunkState::Unmarked && target.address != begin {
                    target.incoming = target.incoming.saturating_add(1);
                }
            }
        });
        if result.is_err() {
            summary.unreadable += 1;
        }
    }

    for chunk in table.iter() {
        match chunk.state {
            ChunkState::Reachable => summary.reachable += 1,
            ChunkState::IgnoreRequested => summary.ignored += 1,
            ChunkState::Unmarked => {
                let kind = if chunk.incoming == 0 {
                    summary.direct += 1;
                    LeakKind::Direct
                } else {
                    summary.indirect += 1;
                    LeakKind::Indirect
                };
                if out.len() < out.capacity() {
                    out.push(LeakedChunk {
                        address: chunk.address,
                        size: chunk.size,
                        stack_id: chunk.alloc_stack_id,
                        thread_id: chunk.thread_id,
                        tag: chunk.tag,
                        kind,
                    });
                }
            }
        }
    }
    summary
}
