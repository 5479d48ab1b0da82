//! Chunk registry.
//!
//! Every live heap block the detector knows about is a [`Chunk`]. The
//! registry keeps them in an ordered map keyed by start address so that an
//! arbitrary word can be resolved to the chunk containing it with one
//! `range(..=p).next_back()` lookup.
//!
//! # Locking
//!
//! All mutation goes through one mutex. A leak check holds that mutex (via
//! [`ChunkRegistry::lock`]) across the whole stop-the-world window, so no
//! chunk can appear or disappear while the heap is being scanned. Registry
//! code runs on the internal allocation path and never re-enters the
//! allocation hooks while the lock is held.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::hooks::untracked;
use crate::stack::StackId;
use crate::thread::ThreadId;

/// Caller-supplied classification label attached to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ChunkTag(&'static str);

impl ChunkTag {
    /// Tag of allocations made outside any [`crate::tag_scope`].
    pub const GENERIC: ChunkTag = ChunkTag("generic");

    /// Create a tag.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The tag's name.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Default for ChunkTag {
    fn default() -> Self {
        Self::GENERIC
    }
}

impl fmt::Display for ChunkTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Mark state of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ChunkState {
    /// Not yet proven reachable in the current check.
    Unmarked,
    /// Proven reachable in the current check.
    Reachable,
    /// Exempt from reporting. Survives across checks.
    IgnoreRequested,
}

/// A live heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// First byte of the user-visible block.
    pub address: usize,
    /// Requested size in bytes. May be zero.
    pub size: usize,
    /// Allocation-site stack.
    pub alloc_stack_id: StackId,
    /// Thread that made the allocation.
    pub thread_id: ThreadId,
    /// Classification label.
    pub tag: ChunkTag,
    /// Mark state.
    pub state: ChunkState,
    pub(crate) scanned: bool,
    pub(crate) incoming: u32,
}

impl Chunk {
    /// Create an unmarked chunk.
    pub fn new(
        address: usize,
        size: usize,
        alloc_stack_id: StackId,
        thread_id: ThreadId,
        tag: ChunkTag,
    ) -> Self {
        Self {
            address,
            size,
            alloc_stack_id,
            thread_id,
            tag,
            state: ChunkState::Unmarked,
            scanned: false,
            incoming: 0,
        }
    }

    /// Set the initial state.
    pub fn with_state(mut self, state: ChunkState) -> Self {
        self.state = state;
        self
    }

    /// One past the last byte. A zero-size chunk covers one byte for lookup.
    #[inline]
    pub fn lookup_end(&self) -> usize {
        self.address.saturating_add(self.size.max(1))
    }

    /// Whether `ptr` points into the chunk.
    #[inline]
    pub fn contains(&self, ptr: usize) -> bool {
        ptr >= self.address && ptr < self.lookup_end()
    }

    /// Byte range `[address, address + size)` holding the chunk's contents.
    #[inline]
    pub fn span(&self) -> (usize, usize) {
        (self.address, self.address.saturating_add(self.size))
    }

    /// Whether the chunk is exempt from reporting.
    pub fn is_ignored(&self) -> bool {
        self.state == ChunkState::IgnoreRequested
    }
}

/// Errors reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A chunk already starts at this address.
    #[error("chunk at {address:#x} is already tracked ({existing_size} bytes)")]
    AlreadyTracked {
        /// Start address.
        address: usize,
        /// Size of the chunk already registered there.
        existing_size: usize,
    },
    /// The new chunk overlaps a tracked one.
    #[error("chunk [{address:#x}, +{size}) overlaps tracked chunk at {other:#x}")]
    Overlap {
        /// Start of the new chunk.
        address: usize,
        /// Size of the new chunk.
        size: usize,
        /// Start of the chunk it overlaps.
        other: usize,
    },
    /// No chunk is tracked at or around this address.
    #[error("free of untracked address {address:#x}")]
    UntrackedFree {
        /// Freed address.
        address: usize,
    },
    /// The address lies inside a chunk but is not its start.
    #[error("free of interior address {address:#x} (chunk starts at {chunk_start:#x})")]
    InteriorFree {
        /// Freed address.
        address: usize,
        /// Start of the containing chunk.
        chunk_start: usize,
    },
    /// No chunk contains the address.
    #[error("no tracked chunk contains {address:#x}")]
    NotFound {
        /// Queried address.
        address: usize,
    },
}

/// Result of [`ChunkRegistry::ignore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreOutcome {
    /// The chunk is now exempt.
    Ignored,
    /// The chunk was already exempt.
    AlreadyIgnored,
}

/// Registry counters. Updated on every mutation, readable without the lock.
#[derive(Debug, Default)]
pub struct RegistryStats {
    /// Successful registrations.
    pub allocations: AtomicU64,
    /// Successful unregistrations.
    pub frees: AtomicU64,
    /// Registrations rejected because the range was already covered.
    pub rejected_allocations: AtomicU64,
    /// Frees of addresses that were not a tracked chunk start.
    pub rejected_frees: AtomicU64,
    /// Every successful mutation, including ignore requests.
    pub mutations: AtomicU64,
}

/// Point-in-time copy of [`RegistryStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStatsSnapshot {
    /// Successful registrations.
    pub allocations: u64,
    /// Successful unregistrations.
    pub frees: u64,
    /// Rejected registrations.
    pub rejected_allocations: u64,
    /// Rejected frees.
    pub rejected_frees: u64,
    /// Successful mutations.
    pub mutations: u64,
}

impl RegistryStats {
    /// Take a snapshot of the counters.
    pub fn snapshot(&self) -> RegistryStatsSnapshot {
        RegistryStatsSnapshot {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            rejected_allocations: self.rejected_allocations.load(Ordering::Relaxed),
            rejected_frees: self.rejected_frees.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
        }
    }
}

/// The chunk table guarded by the registry lock.
#[derive(Debug, Default)]
pub struct ChunkTable {
    chunks: BTreeMap<usize, Chunk>,
    live_bytes: usize,
}

impl ChunkTable {
    /// Number of tracked chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether no chunks are tracked.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Sum of the sizes of all tracked chunks.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Chunk starting exactly at `address`.
    pub fn get(&self, address: usize) -> Option<&Chunk> {
        self.chunks.get(&address)
    }

    /// Chunk containing `ptr`, where `ptr` may be an interior pointer.
    pub fn find_containing(&self, ptr: usize) -> Option<&Chunk> {
        self.chunks
            .range(..=ptr)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains(ptr))
    }

    /// Mutable variant of [`ChunkTable::find_containing`].
    pub fn find_containing_mut(&mut self, ptr: usize) -> Option<&mut Chunk> {
        self.chunks
            .range_mut(..=ptr)
            .next_back()
            .map(|(_, chunk)| chunk)
            .filter(|chunk| chunk.contains(ptr))
    }

    /// Visit every chunk satisfying `predicate`, in address order.
    pub fn for_each<P, V>(&self, mut predicate: P, mut visitor: V)
    where
        P: FnMut(&Chunk) -> bool,
        V: FnMut(&Chunk),
    {
        for chunk in self.chunks.values() {
            if predicate(chunk) {
                visitor(chunk);
            }
        }
    }

    /// Iterate over all chunks in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Reset per-check scratch state. Ignore requests survive.
    pub fn reset_marks(&mut self) {
        for chunk in self.chunks.values_mut() {
            if chunk.state == ChunkState::Reachable {
                chunk.state = ChunkState::Unmarked;
            }
            chunk.scanned = false;
            chunk.incoming = 0;
        }
    }

    /// Append the contents span of every ignored chunk to `out`.
    pub fn collect_ignored(&self, out: &mut Vec<(usize, usize)>) {
        out.extend(
            self.chunks
                .values()
                .filter(|chunk| chunk.is_ignored())
                .map(Chunk::span),
        );
    }

    /// Number of ignored chunks.
    pub fn ignored_count(&self) -> usize {
        self.chunks.values().filter(|chunk| chunk.is_ignored()).count()
    }

    fn insert(&mut self, chunk: Chunk) -> Result<(), RegistryError> {
        if let Some(existing) = self.chunks.get(&chunk.address) {
            return Err(RegistryError::AlreadyTracked {
                address: chunk.address,
                existing_size: existing.size,
            });
        }
        if let Some((_, before)) = self.chunks.range(..chunk.address).next_back() {
            if before.lookup_end() > chunk.address {
                return Err(RegistryError::Overlap {
                    address: chunk.address,
                    size: chunk.size,
                    other: before.address,
                });
            }
        }
        if let Some((_, after)) = self.chunks.range(chunk.address..).next() {
            if after.address < chunk.lookup_end() {
                return Err(RegistryError::Overlap {
                    address: chunk.address,
                    size: chunk.size,
                    other: after.address,
                });
            }
        }
        self.live_bytes += chunk.size;
        self.chunks.insert(chunk.address, chunk);
        Ok(())
    }

    fn remove(&mut self, address: usize) -> Result<Chunk, RegistryError> {
        if let Some(chunk) = self.chunks.remove(&address) {
            self.live_bytes -= chunk.size;
            return Ok(chunk);
        }
        match self.find_containing(address) {
            Some(chunk) => Err(RegistryError::InteriorFree {
                address,
                chunk_start: chunk.address,
            }),
            None => Err(RegistryError::UntrackedFree { address }),
        }
    }

    fn ignore(&mut self, ptr: usize) -> Result<IgnoreOutcome, RegistryError> {
        let chunk = self
            .find_containing_mut(ptr)
            .ok_or(RegistryError::NotFound { address: ptr })?;
        if chunk.state == ChunkState::IgnoreRequested {
            return Ok(IgnoreOutcome::AlreadyIgnored);
        }
        chunk.state = ChunkState::IgnoreRequested;
        Ok(IgnoreOutcome::Ignored)
    }
}

/// Thread-safe registry of live chunks.
#[derive(Debug, Default)]
pub struct ChunkRegistry {
    table: Mutex<ChunkTable>,
    stats: RegistryStats,
}

impl ChunkRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new allocation.
    pub fn on_alloc(
        &self,
        address: usize,
        size: usize,
        alloc_stack_id: StackId,
        thread_id: ThreadId,
        tag: ChunkTag,
    ) -> Result<(), RegistryError> {
        self.register(Chunk::new(address, size, alloc_stack_id, thread_id, tag))
    }

    /// Register a fully-formed chunk, including its initial state.
    pub fn register(&self, chunk: Chunk) -> Result<(), RegistryError> {
        let result = untracked(|| self.table.lock().insert(chunk));
        match result {
            Ok(()) => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                self.stats.mutations.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.rejected_allocations.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Unregister the chunk starting exactly at `address`.
    pub fn on_free(&self, address: usize) -> Result<Chunk, RegistryError> {
        let result = untracked(|| self.table.lock().remove(address));
        match result {
            Ok(_) => {
                self.stats.frees.fetch_add(1, Ordering::Relaxed);
                self.stats.mutations.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.rejected_frees.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Copy of the chunk containing `ptr`.
    pub fn find_containing(&self, ptr: usize) -> Option<Chunk> {
        self.table.lock().find_containing(ptr).copied()
    }

    /// Whether a chunk starts exactly at `address`.
    pub fn is_tracked(&self, address: usize) -> bool {
        self.table.lock().get(address).is_some()
    }

    /// Exempt the chunk containing `ptr` from reporting.
    pub fn ignore(&self, ptr: usize) -> Result<IgnoreOutcome, RegistryError> {
        let result = untracked(|| self.table.lock().ignore(ptr));
        if let Ok(IgnoreOutcome::Ignored) = result {
            self.stats.mutations.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Lock the table.
    ///
    /// Leak checks hold this guard for the whole stop-the-world window.
    pub fn lock(&self) -> MutexGuard<'_, ChunkTable> {
        self.table.lock()
    }

    /// Number of tracked chunks.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether no chunks are tracked.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Sum of tracked chunk sizes.
    pub fn live_bytes(&self) -> usize {
        self.table.lock().live_bytes()
    }

    /// Total number of successful mutations so far.
    pub fn mutation_count(&self) -> u64 {
        self.stats.mutations.load(Ordering::Acquire)
    }

    /// Registry counters.
    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Acquire the lock and leak the guard, for use right before `fork`.
    pub(crate) fn lock_for_fork(&self) {
        std::mem::forget(self.table.lock());
    }

    /// Release a lock taken by [`ChunkRegistry::lock_for_fork`].
    ///
    /// # Safety
    ///
    /// The lock must be held through a forgotten guard.
    pub(crate) unsafe fn unlock_after_fork(&self) {
        self.table.force_unlock();
    }
}
