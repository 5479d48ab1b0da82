//! Allocation hooks.
//!
//! [`LeakCheckAllocator`] wraps a [`GlobalAlloc`] and reports every
//! allocation and deallocation to the process-wide detector. The detector's
//! own allocations go through the same allocator, so a thread-local
//! re-entrancy flag routes them around the registry: anything allocated while
//! [`InternalGuard`] is held is never tracked.
//!
//! The same thread-local state carries the per-thread disable depth (see
//! [`disable_in_scope`]) and the allocation tag (see [`tag_scope`]).

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr;

use thiserror::Error;

use crate::chunk::{ChunkState, ChunkTag};

thread_local! {
    static IN_DETECTOR: Cell<bool> = const { Cell::new(false) };
    static DISABLE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static CURRENT_TAG: Cell<ChunkTag> = const { Cell::new(ChunkTag::GENERIC) };
}

/// Error returned by the scoped disable API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScopeError {
    /// `enable` was called without a matching `disable`.
    #[error("enable() called without a matching disable()")]
    UnmatchedEnable,
}

/// Marks the current thread as running detector code.
///
/// Allocations made while a guard is alive bypass tracking. Guards nest; only
/// the outermost one clears the flag on drop.
pub struct InternalGuard {
    was_internal: bool,
    _not_send: PhantomData<*const ()>,
}

impl InternalGuard {
    /// Enter the internal allocation path.
    pub fn enter() -> Self {
        let was_internal = IN_DETECTOR.try_with(|flag| flag.replace(true)).unwrap_or(true);
        Self {
            was_internal,
            _not_send: PhantomData,
        }
    }
}

impl Drop for InternalGuard {
    fn drop(&mut self) {
        if !self.was_internal {
            let _ = IN_DETECTOR.try_with(|flag| flag.set(false));
        }
    }
}

/// Run `f` on the internal allocation path.
#[inline]
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = InternalGuard::enter();
    f()
}

/// Whether the current thread is inside detector code.
///
/// Threads whose thread-local storage is already torn down report `true`.
pub fn is_internal() -> bool {
    IN_DETECTOR.try_with(Cell::get).unwrap_or(true)
}

/// Increase the current thread's disable depth.
///
/// While the depth is positive, new allocations are registered as ignored.
pub fn disable() {
    let _ = DISABLE_DEPTH.try_with(|depth| depth.set(depth.get() + 1));
}

/// Decrease the current thread's disable depth.
pub fn enable() -> Result<(), ScopeError> {
    DISABLE_DEPTH
        .try_with(|depth| match depth.get() {
            0 => Err(ScopeError::UnmatchedEnable),
            n => {
                depth.set(n - 1);
                Ok(())
            }
        })
        .unwrap_or(Err(ScopeError::UnmatchedEnable))
}

/// Whether new allocations on this thread are currently exempt.
pub fn is_disabled() -> bool {
    DISABLE_DEPTH.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

/// Guard returned by [`disable_in_scope`].
#[must_use = "detection is re-enabled as soon as the scope guard is dropped"]
pub struct DisabledScope {
    _not_send: PhantomData<*const ()>,
}

/// Exempt every allocation made on this thread until the guard drops.
pub fn disable_in_scope() -> DisabledScope {
    disable();
    DisabledScope {
        _not_send: PhantomData,
    }
}

impl Drop for DisabledScope {
    fn drop(&mut self) {
        let _ = enable();
    }
}

/// Guard returned by [`tag_scope`]. Restores the previous tag on drop.
#[must_use = "the tag is reset as soon as the scope guard is dropped"]
pub struct TagScope {
    previous: ChunkTag,
    _not_send: PhantomData<*const ()>,
}

/// Tag every allocation made on this thread until the guard drops.
pub fn tag_scope(tag: &'static str) -> TagScope {
    let previous = CURRENT_TAG
        .try_with(|current| current.replace(ChunkTag::new(tag)))
        .unwrap_or(ChunkTag::GENERIC);
    TagScope {
        previous,
        _not_send: PhantomData,
    }
}

impl Drop for TagScope {
    fn drop(&mut self) {
        let _ = CURRENT_TAG.try_with(|current| current.set(self.previous));
    }
}

/// The tag applied to allocations made on this thread right now.
pub fn current_tag() -> ChunkTag {
    CURRENT_TAG.try_with(Cell::get).unwrap_or(ChunkTag::GENERIC)
}

/// A [`GlobalAlloc`] that reports allocations to the global detector.
///
/// ```rust,ignore
/// use leakwatch_runtime::LeakCheckAllocator;
///
/// #[global_allocator]
/// static GLOBAL: LeakCheckAllocator = LeakCheckAllocator::new();
/// ```
///
/// Nothing is tracked until [`crate::init`] has completed.
///
/// Every allocation is tracked, whichever thread makes it, but only
/// registered threads are roots. An object reachable only from the stack or
/// registers of a thread started with plain [`std::thread::spawn`] is
/// reported as leaked; use [`crate::spawn`] instead.
pub struct LeakCheckAllocator<A = System> {
    inner: A,
}

impl LeakCheckAllocator<System> {
    /// Wrap the system allocator.
    pub const fn new() -> Self {
        Self { inner: System }
    }
}

impl Default for LeakCheckAllocator<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> LeakCheckAllocator<A> {
    /// Wrap an arbitrary allocator.
    pub const fn with_allocator(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for LeakCheckAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc(layout);
        if !ptr.is_null() {
            track_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.inner.alloc_zeroed(layout);
        if !ptr.is_null() {
            track_alloc(ptr, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        // Unregister first: once the block is returned another thread may
        // receive the same address.
        track_free(ptr);
        self.inner.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        // Always move. The old block stays registered and intact until the
        // new one is registered and filled.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.inner.alloc(new_layout);
        if new_ptr.is_null() {
            return new_ptr;
        }
        track_alloc(new_ptr, new_size);
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        track_free(ptr);
        self.inner.dealloc(ptr, layout);
        new_ptr
    }
}

fn track_alloc(ptr: *mut u8, size: usize) {
    if is_internal() {
        return;
    }
    let _guard = InternalGuard::enter();
    let Some(detector) = crate::detector() else {
        return;
    };
    if !detector.is_tracking() {
        return;
    }
    let state = if is_disabled() {
        ChunkState::IgnoreRequested
    } else {
        ChunkState::Unmarked
    };
    detector.record_allocation(ptr as usize, size, state, current_tag());
}

fn track_free(ptr: *mut u8) {
    if is_internal() {
        return;
    }
    let _guard = InternalGuard::enter();
    // Frees are forwarded even when tracking was switched off so that chunks
    // registered earlier do not linger as false leaks.
    if let Some(detector) = crate::detector() {
        detector.record_free(ptr as usize);
    }
}
