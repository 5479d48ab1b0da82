//! Allocation-site stacks.
//!
//! Each allocation records the return addresses of its call stack. Identical
//! traces are interned once in the [`StackDepot`] and referred to by a small
//! [`StackId`] afterwards. Ids are stable for the life of the process.

use std::collections::HashMap;
use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::hooks::untracked;

/// Handle of an interned stack trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct StackId(u32);

impl StackId {
    /// Id of the empty trace.
    pub const EMPTY: StackId = StackId(0);

    /// Get the raw id.
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Whether this is the empty trace.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack#{}", self.0)
    }
}

#[derive(Default)]
struct DepotInner {
    index: HashMap<Arc<[usize]>, StackId>,
    traces: Vec<Arc<[usize]>>,
}

/// Append-only intern table of stack traces.
#[derive(Default)]
pub struct StackDepot {
    inner: RwLock<DepotInner>,
}

impl fmt::Debug for StackDepot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackDepot").field("len", &self.len()).finish()
    }
}

impl StackDepot {
    /// Create an empty depot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a trace, returning its id. Equal traces get equal ids.
    pub fn intern(&self, frames: &[usize]) -> StackId {
        if frames.is_empty() {
            return StackId::EMPTY;
        }
        if let Some(id) = self.inner.read().index.get(frames) {
            return *id;
        }
        untracked(|| {
            let mut inner = self.inner.write();
            if let Some(id) = inner.index.get(frames) {
                return *id;
            }
            let trace: Arc<[usize]> = Arc::from(frames);
            inner.traces.push(Arc::clone(&trace));
            let id = StackId(inner.traces.len() as u32);
            inner.index.insert(trace, id);
            id
        })
    }

    /// Frames of an interned trace. The empty id yields an empty trace.
    pub fn get(&self, id: StackId) -> Option<Arc<[usize]>> {
        if id.is_empty() {
            return Some(Arc::from(&[][..]));
        }
        let index = id.0 as usize - 1;
        self.inner.read().traces.get(index).cloned()
    }

    /// Number of distinct non-empty traces.
    pub fn len(&self) -> usize {
        self.inner.read().traces.len()
    }

    /// Whether the depot holds no traces.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Captures the calling thread's return addresses.
pub trait StackTraceProducer: Send + Sync {
    /// Write up to `out.len()` return addresses, innermost first, after
    /// skipping `skip` frames. Returns how many were written. A walk that
    /// hits an invalid frame stops there.
    fn capture(&self, skip: usize, out: &mut [usize]) -> usize;
}

/// Unwinder using the platform unwinder via the `backtrace` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BacktraceUnwinder;

impl StackTraceProducer for BacktraceUnwinder {
    fn capture(&self, skip: usize, out: &mut [usize]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut skipped = 0;
        let mut written = 0;
        backtrace::trace(|frame| {
            if skipped < skip {
                skipped += 1;
                return true;
            }
            let ip = frame.ip() as usize;
            if ip == 0 {
                return false;
            }
            out[written] = ip;
            written += 1;
            written < out.len()
        });
        written
    }
}

/// Frame-pointer walker, bounded by the current thread's registered stack.
///
/// Only meaningful when code is compiled with frame pointers. Threads without
/// known stack bounds produce empty traces.
#[derive(Debug, Default, Clone, Copy)]
pub struct FramePointerUnwinder;

impl StackTraceProducer for FramePointerUnwinder {
    #[inline(never)]
    fn capture(&self, skip: usize, out: &mut [usize]) -> usize {
        let (bottom, top) = crate::thread::cached_stack_bounds();
        if top == 0 {
            return 0;
        }
        match current_frame_pointer() {
            // SAFETY: every frame is checked to lie within the current
            // thread's stack before it is dereferenced.
            Some(fp) => unsafe { walk_frame_chain(fp, bottom, top, skip, out) },
            None => 0,
        }
    }
}

#[inline(always)]
fn current_frame_pointer() -> Option<usize> {
    #[cfg(target_arch = "x86_64")]
    {
        let fp: usize;
        // SAFETY: reads a register.
        unsafe {
            std::arch::asm!("mov {}, rbp", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        Some(fp)
    }
    #[cfg(target_arch = "aarch64")]
    {
        let fp: usize;
        // SAFETY: reads a register.
        unsafe {
            std::arch::asm!("mov {}, x29", out(reg) fp, options(nomem, nostack, preserves_flags));
        }
        Some(fp)
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        None
    }
}

#[inline]
fn is_valid_frame(fp: usize, stack_bottom: usize, stack_top: usize) -> bool {
    let word = size_of::<usize>();
    fp > stack_bottom
        && stack_top >= 2 * word
        && fp < stack_top - 2 * word
        && fp % word == 0
}

/// Follow a saved-frame-pointer chain.
///
/// Each frame holds the caller's frame pointer at `fp` and the return address
/// at `fp + word`. The walk stops at the first frame outside
/// `(stack_bottom, stack_top)`, at a null return address, or when the chain
/// stops moving toward the stack top.
///
/// # Safety
///
/// `[stack_bottom, stack_top)` must be readable memory.
pub unsafe fn walk_frame_chain(
    mut fp: usize,
    stack_bottom: usize,
    stack_top: usize,
    skip: usize,
    out: &mut [usize],
) -> usize {
    let word = size_of::<usize>();
    let mut skipped = 0;
    let mut written = 0;
    while written < out.len() && is_valid_frame(fp, stack_bottom, stack_top) {
        let next = *(fp as *const usize);
        let ret = *((fp + word) as *const usize);
        if ret == 0 {
            break;
        }
        if skipped < skip {
            skipped += 1;
        } else {
            out[written] = ret;
            written += 1;
        }
        if next <= fp {
            break;
        }
        fp = next;
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_id_display() {
        assert_eq!(StackId::EMPTY.to_string(), "stack#0");
        assert!(StackId::EMPTY.is_empty());
    }

    #[test]
    fn test_intern_dedups() {
        let depot = StackDepot::new();
        let a = depot.intern(&[1, 2, 3]);
        let b = depot.intern(&[1, 2, 3]);
        let c = depot.intern(&[1, 2]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(!a.is_empty());
        assert_eq!(depot.len(), 2);
        assert_eq!(&*depot.get(a).unwrap(), &[1, 2, 3]);
        assert_eq!(&*depot.get(c).unwrap(), &[1, 2]);
    }

    #[test]
    fn test_empty_trace() {
        let depot = StackDepot::new();
        assert_eq!(depot.intern(&[]), StackId::EMPTY);
        assert!(depot.get(StackId::EMPTY).unwrap().is_empty());
        assert!(depot.is_empty());
        assert!(depot.get(StackId(42)).is_none());
    }

    #[test]
    fn test_intern_concurrent() {
        let depot = Arc::new(StackDepot::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let depot = Arc::clone(&depot);
                std::thread::spawn(move || {
                    (0..100).map(|i| depot.intern(&[i, i + 1])).collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<StackId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(depot.len(), 100);
    }

    #[test]
    fn test_backtrace_unwinder_captures_frames() {
        let mut frames = [0usize; 16];
        let n = BacktraceUnwinder.capture(0, &mut frames);
        assert!(n > 0);
        assert!(frames[..n].iter().all(|&ip| ip != 0));
        assert_eq!(BacktraceUnwinder.capture(0, &mut []), 0);
    }

    #[test]
    fn test_backtrace_unwinder_respects_limit() {
        let mut frames = [0usize; 2];
        assert!(BacktraceUnwinder.capture(0, &mut frames) <= 2);
    }

    /// Builds a fake stack of three linked frames inside a buffer.
    fn fake_stack() -> (Vec<usize>, usize, usize, usize) {
        let mut stack = vec![0usize; 32];
        let base = stack.as_ptr() as usize;
        let word = size_of::<usize>();
        let addr = |i: usize| base + i * word;
        // frame 0 at slot 4 -> frame 1 at slot 10 -> frame 2 at slot 20
        stack[4] = addr(10);
        stack[5] = 0xaaa;
        stack[10] = addr(20);
        stack[11] = 0xbbb;
        stack[20] = 0; // chain end: next <= fp
        stack[21] = 0xccc;
        let bottom = base;
        let top = addr(32);
        (stack, addr(4), bottom, top)
    }

    #[test]
    fn test_walk_frame_chain() {
        let (_stack, fp, bottom, top) = fake_stack();
        let mut out = [0usize; 8];
        let n = unsafe { walk_frame_chain(fp, bottom, top, 0, &mut out) };
        assert_eq!(&out[..n], &[0xaaa, 0xbbb, 0xccc]);

        let n = unsafe { walk_frame_chain(fp, bottom, top, 1, &mut out) };
        assert_eq!(&out[..n], &[0xbbb, 0xccc]);

        let mut short = [0usize; 2];
        let n = unsafe { walk_frame_chain(fp, bottom, top, 0, &mut short) };
        assert_eq!(&short[..n], &[0xaaa, 0xbbb]);
    }

    #[test]
    fn test_walk_frame_chain_truncates_on_invalid_frame() {
        let (mut stack, fp, bottom, top) = fake_stack();
        // Point frame 1 outside the stack.
        stack[10] = top + 0x1000;
        let mut out = [0usize; 8];
        let n = unsafe { walk_frame_chain(fp, bottom, top, 0, &mut out) };
        assert_eq!(&out[..n], &[0xaaa, 0xbbb]);

        // A frame pointer outside the bounds yields nothing.
        let n = unsafe { walk_frame_chain(bottom, bottom, top, 0, &mut out) };
        assert_eq!(n, 0);
        let n = unsafe { walk_frame_chain(fp + 1, bottom, top, 0, &mut out) };
        assert_eq!(n, 0);
    }
}
