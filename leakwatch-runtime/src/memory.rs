//! Memory sources.
//!
//! The scanner never dereferences addresses directly. It reads through a
//! [`MemorySource`], which validates every range first so that an unmapped
//! root or a chunk on a page that disappeared is skipped rather than faulting.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::maps::MapsSnapshot;

/// A read could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReadError {
    /// Part of the range is not mapped readable.
    #[error("range [{begin:#x}, {end:#x}) is not mapped readable")]
    Unmapped {
        /// Start of the failed read.
        begin: usize,
        /// End of the failed read.
        end: usize,
    },
    /// The range wraps around the address space.
    #[error("range starting at {begin:#x} overflows the address space")]
    Overflow {
        /// Start of the failed read.
        begin: usize,
    },
    /// A region would overlap one already mapped.
    #[error("region at {begin:#x} overlaps an existing mapping")]
    AlreadyMapped {
        /// Start of the rejected region.
        begin: usize,
    },
    /// The memory map could not be loaded.
    #[error("memory map unavailable")]
    MapUnavailable,
}

/// Readable view of an address space.
pub trait MemorySource: Send {
    /// Prepare for a check. Called before other threads are suspended; may
    /// allocate.
    fn prepare(&mut self) -> Result<(), ReadError> {
        Ok(())
    }

    /// Bring cached state up to date. Called while other threads are
    /// suspended; must not allocate, lock, or log.
    fn refresh_frozen(&mut self) {}

    /// Fill `buf` with the bytes at `[address, address + buf.len())`.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ReadError>;
}

/// The current process's own memory, validated against `/proc/self/maps`.
#[derive(Debug, Default)]
pub struct ProcessMemory {
    maps: MapsSnapshot,
}

impl ProcessMemory {
    /// Create a source with an empty map. The map is loaded by `prepare`.
    pub fn new() -> Self {
        Self::default()
    }

    /// The current map snapshot.
    pub fn maps(&self) -> &MapsSnapshot {
        &self.maps
    }
}

impl MemorySource for ProcessMemory {
    fn prepare(&mut self) -> Result<(), ReadError> {
        self.maps.reload().map_err(|_| ReadError::MapUnavailable)
    }

    fn refresh_frozen(&mut self) {
        // On failure the snapshot taken by `prepare` stays in effect.
        let _ = self.maps.refresh_in_place();
    }

    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ReadError> {
        let end = address
            .checked_add(buf.len())
            .ok_or(ReadError::Overflow { begin: address })?;
        if !self.maps.is_readable(address, buf.len()) {
            return Err(ReadError::Unmapped {
                begin: address,
                end,
            });
        }
        // SAFETY: the range was just validated as mapped readable, and every
        // thread that could unmap it is suspended or blocked on our locks.
        unsafe {
            std::ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }
}

/// A sparse, synthetic address space.
///
/// Clones share the same contents, so a handle kept by the caller can modify
/// memory that a detector reads through another handle. Used for offline
/// analysis and tests.
#[derive(Debug, Clone, Default)]
pub struct SnapshotMemory {
    regions: Arc<RwLock<BTreeMap<usize, Vec<u8>>>>,
}

impl SnapshotMemory {
    /// Create an empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `bytes` at `address`.
    pub fn map(&self, address: usize, bytes: Vec<u8>) -> Result<(), ReadError> {
        let end = address
            .checked_add(bytes.len())
            .ok_or(ReadError::Overflow { begin: address })?;
        let mut regions = self.regions.write();
        if let Some((&start, region)) = regions.range(..=address).next_back() {
            if start + region.len() > address {
                return Err(ReadError::AlreadyMapped { begin: address });
            }
        }
        if let Some((&start, _)) = regions.range(address..).next() {
            if start < end {
                return Err(ReadError::AlreadyMapped { begin: address });
            }
        }
        regions.insert(address, bytes);
        Ok(())
    }

    /// Map `len` zero bytes at `address`.
    pub fn map_zeroed(&self, address: usize, len: usize) -> Result<(), ReadError> {
        self.map(address, vec![0; len])
    }

    /// Remove the region starting at `address`.
    pub fn unmap(&self, address: usize) -> bool {
        self.regions.write().remove(&address).is_some()
    }

    /// Overwrite bytes inside an existing region.
    pub fn write(&self, address: usize, bytes: &[u8]) -> Result<(), ReadError> {
        let mut regions = self.regions.write();
        let end = address
            .checked_add(bytes.len())
            .ok_or(ReadError::Overflow { begin: address })?;
        let (&start, region) = regions
            .range_mut(..=address)
            .next_back()
            .ok_or(ReadError::Unmapped { begin: address, end })?;
        let offset = address - start;
        let target = region
            .get_mut(offset..offset + bytes.len())
            .ok_or(ReadError::Unmapped { begin: address, end })?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    /// Store a native-endian word at `address`.
    pub fn write_word(&self, address: usize, value: usize) -> Result<(), ReadError> {
        self.write(address, &value.to_ne_bytes())
    }

    /// Load a native-endian word from `address`.
    pub fn read_word(&self, address: usize) -> Result<usize, ReadError> {
        let mut bytes = [0u8; std::mem::size_of::<usize>()];
        self.read(address, &mut bytes)?;
        Ok(usize::from_ne_bytes(bytes))
    }
}

impl MemorySource for SnapshotMemory {
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), ReadError> {
        let end = address
            .checked_add(buf.len())
            .ok_or(ReadError::Overflow { begin: address })?;
        let regions = self.regions.read();
        let (&start, region) = regions
            .range(..=address)
            .next_back()
            .ok_or(ReadError::Unmapped { begin: address, end })?;
        let offset = address - start;
        let source = region
            .get(offset..offset + buf.len())
            .ok_or(ReadError::Unmapped { begin: address, end })?;
        buf.copy_from_slice(source);
        Ok(())
    }
}
