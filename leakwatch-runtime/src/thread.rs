//! Thread registry.
//!
//! Records the stack and static-TLS bounds of every participating thread so
//! that the root enumerator can scan them. Threads join explicitly with
//! [`register_current`] (or by being started through [`spawn`]) and leave
//! when the returned [`ThreadRegistration`] is dropped.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use crate::hooks::untracked;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_ID: Cell<u64> = const { Cell::new(0) };
    static STACK_BOUNDS: Cell<(usize, usize)> = const { Cell::new((0, 0)) };
}

/// Detector-assigned thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Create a new thread ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// ID of the calling thread, assigned on first use.
    pub fn current() -> Self {
        let id = CURRENT_ID
            .try_with(|current| {
                if current.get() == 0 {
                    current.set(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
                }
                current.get()
            })
            .unwrap_or(0);
        Self(id)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Bounds and identity of one registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadRecord {
    /// Detector id.
    pub thread_id: ThreadId,
    /// Lowest stack address.
    pub stack_begin: usize,
    /// One past the highest stack address.
    pub stack_end: usize,
    /// Start of the static TLS block, or 0.
    pub tls_begin: usize,
    /// End of the static TLS block, or 0.
    pub tls_end: usize,
    /// Kernel thread id, or 0 when unknown.
    pub os_tid: i32,
    /// `pthread_t` handle, or 0 when the thread cannot be signalled.
    pub os_handle: usize,
}

impl ThreadRecord {
    /// Create a record without OS identity.
    pub fn new(
        thread_id: ThreadId,
        stack_begin: usize,
        stack_end: usize,
        tls_begin: usize,
        tls_end: usize,
    ) -> Self {
        Self {
            thread_id,
            stack_begin,
            stack_end,
            tls_begin,
            tls_end,
            os_tid: 0,
            os_handle: 0,
        }
    }

    /// Attach the OS identity used to suspend the thread.
    pub fn with_os_identity(mut self, os_tid: i32, os_handle: usize) -> Self {
        self.os_tid = os_tid;
        self.os_handle = os_handle;
        self
    }

    /// Whether `addr` lies on this thread's stack.
    pub fn stack_contains(&self, addr: usize) -> bool {
        addr >= self.stack_begin && addr < self.stack_end
    }

    /// Whether a static TLS block is known.
    pub fn has_tls(&self) -> bool {
        self.tls_end > self.tls_begin
    }
}

/// Thread registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// The thread is already registered.
    #[error("thread {0} is already registered")]
    AlreadyRegistered(ThreadId),
    /// The thread is not registered.
    #[error("thread {0} is not registered")]
    NotRegistered(ThreadId),
    /// Stack or TLS bounds are inverted.
    #[error("invalid bounds [{begin:#x}, {end:#x})")]
    InvalidBounds {
        /// Lower bound.
        begin: usize,
        /// Upper bound.
        end: usize,
    },
    /// The platform refused to report stack bounds.
    #[error("could not determine stack bounds (error {0})")]
    StackBounds(i32),
    /// Thread discovery is not implemented for this platform.
    #[error("thread discovery is not supported on this platform")]
    Unsupported,
}

/// The record table guarded by the registry lock.
#[derive(Debug, Default)]
pub struct ThreadTable {
    records: HashMap<ThreadId, ThreadRecord>,
}

impl ThreadTable {
    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no threads are registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Copy every record, sorted by thread id.
    pub fn snapshot(&self) -> Vec<ThreadRecord> {
        let mut records: Vec<ThreadRecord> = self.records.values().copied().collect();
        records.sort_by_key(|record| record.thread_id);
        records
    }

    /// Record for `id`.
    pub fn get(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.records.get(&id)
    }
}

/// Thread-safe registry of participating threads.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    table: Mutex<ThreadTable>,
}

impl ThreadRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a thread by its bounds.
    pub fn on_thread_start(
        &self,
        thread_id: ThreadId,
        stack_begin: usize,
        stack_end: usize,
        tls_begin: usize,
        tls_end: usize,
    ) -> Result<(), ThreadError> {
        self.register(ThreadRecord::new(
            thread_id,
            stack_begin,
            stack_end,
            tls_begin,
            tls_end,
        ))
    }

    /// Register a fully-formed record.
    pub fn register(&self, record: ThreadRecord) -> Result<(), ThreadError> {
        if record.stack_begin > record.stack_end {
            return Err(ThreadError::InvalidBounds {
                begin: record.stack_begin,
                end: record.stack_end,
            });
        }
        if record.tls_begin > record.tls_end {
            return Err(ThreadError::InvalidBounds {
                begin: record.tls_begin,
                end: record.tls_end,
            });
        }
        untracked(|| {
            let mut table = self.table.lock();
            if table.records.contains_key(&record.thread_id) {
                return Err(ThreadError::AlreadyRegistered(record.thread_id));
            }
            table.records.insert(record.thread_id, record);
            Ok(())
        })
    }

    /// Remove a thread.
    pub fn on_thread_exit(&self, thread_id: ThreadId) -> Result<ThreadRecord, ThreadError> {
        untracked(|| self.table.lock().records.remove(&thread_id))
            .ok_or(ThreadError::NotRegistered(thread_id))
    }

    /// Copy every record, sorted by thread id.
    pub fn snapshot_all(&self) -> Vec<ThreadRecord> {
        untracked(|| self.table.lock().snapshot())
    }

    /// Record for `id`.
    pub fn get(&self, id: ThreadId) -> Option<ThreadRecord> {
        self.table.lock().get(id).copied()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: ThreadId) -> bool {
        self.table.lock().records.contains_key(&id)
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether no threads are registered.
    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Lock the table.
    pub fn lock(&self) -> MutexGuard<'_, ThreadTable> {
        self.table.lock()
    }

    /// Drop every record except `survivor`'s, refreshing its OS identity.
    ///
    /// Used in a forked child, where only the forking thread exists.
    pub fn retain_only(&self, survivor: ThreadId, os_tid: i32, os_handle: usize) {
        untracked(|| {
            let mut table = self.table.lock();
            table.records.retain(|id, _| *id == survivor);
            if let Some(record) = table.records.get_mut(&survivor) {
                record.os_tid = os_tid;
                record.os_handle = os_handle;
            }
        })
    }

    pub(crate) fn lock_for_fork(&self) {
        std::mem::forget(self.table.lock());
    }

    /// # Safety
    ///
    /// The lock must be held through a forgotten guard.
    pub(crate) unsafe fn unlock_after_fork(&self) {
        self.table.force_unlock();
    }
}

/// Membership of the current thread in a registry. Unregisters on drop.
#[must_use = "the thread is unregistered as soon as the registration is dropped"]
pub struct ThreadRegistration<'r> {
    registry: &'r ThreadRegistry,
    thread_id: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl ThreadRegistration<'_> {
    /// Id of the registered thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Drop for ThreadRegistration<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.registry.on_thread_exit(self.thread_id) {
            debug!(%err, "thread already unregistered");
        }
        let _ = STACK_BOUNDS.try_with(|bounds| bounds.set((0, 0)));
    }
}

/// Discover the calling thread's bounds and register it.
pub fn register_current(registry: &ThreadRegistry) -> Result<ThreadRegistration<'_>, ThreadError> {
    let record = untracked(current_record)?;
    registry.register(record)?;
    let _ = STACK_BOUNDS.try_with(|bounds| bounds.set((record.stack_begin, record.stack_end)));
    debug!(
        thread = %record.thread_id,
        stack_begin = format_args!("{:#x}", record.stack_begin),
        stack_end = format_args!("{:#x}", record.stack_end),
        "registered thread"
    );
    Ok(ThreadRegistration {
        registry,
        thread_id: record.thread_id,
        _not_send: PhantomData,
    })
}

/// Spawn a thread that is registered with the global detector while it runs.
pub fn spawn<F, T>(f: F) -> std::thread::JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::spawn(move || {
        let _registration = crate::detector().and_then(|detector| {
            register_current(detector.threads())
                .map_err(|err| warn!(%err, "spawned thread runs unregistered"))
                .ok()
        });
        f()
    })
}

/// Stack bounds recorded for the current thread at registration, or `(0, 0)`.
pub(crate) fn cached_stack_bounds() -> (usize, usize) {
    STACK_BOUNDS.try_with(Cell::get).unwrap_or((0, 0))
}

/// Build a record describing the calling thread.
pub fn current_record() -> Result<ThreadRecord, ThreadError> {
    let (stack_begin, stack_end) = current_stack_bounds()?;
    let (tls_begin, tls_end) = current_tls_bounds().unwrap_or((0, 0));
    Ok(
        ThreadRecord::new(ThreadId::current(), stack_begin, stack_end, tls_begin, tls_end)
            .with_os_identity(current_os_tid(), current_os_handle()),
    )
}

/// Stack bounds of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_stack_bounds() -> Result<(usize, usize), ThreadError> {
    // SAFETY: attr is initialised by pthread_getattr_np before use and
    // destroyed exactly once.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        let rc = libc::pthread_getattr_np(libc::pthread_self(), &mut attr);
        if rc != 0 {
            return Err(ThreadError::StackBounds(rc));
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return Err(ThreadError::StackBounds(rc));
        }
        let begin = addr as usize;
        Ok((begin, begin + size))
    }
}

/// Stack bounds of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn current_stack_bounds() -> Result<(usize, usize), ThreadError> {
    Err(ThreadError::Unsupported)
}

/// Kernel id of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_os_tid() -> i32 {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

/// Kernel id of the calling thread.
#[cfg(not(target_os = "linux"))]
pub fn current_os_tid() -> i32 {
    0
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

/// Static TLS block of the calling thread, when the C library exposes it.
#[cfg(all(
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
pub fn current_tls_bounds() -> Option<(usize, usize)> {
    let size = static_tls_size()?;
    let tp = thread_pointer();
    if tp == 0 {
        return None;
    }
    // x86_64 uses TLS variant II (block below the thread pointer), aarch64
    // variant I (block above it).
    if cfg!(target_arch = "x86_64") {
        Some((tp.checked_sub(size)?, tp))
    } else {
        Some((tp, tp.checked_add(size)?))
    }
}

/// Static TLS block of the calling thread, when the C library exposes it.
#[cfg(not(all(
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
pub fn current_tls_bounds() -> Option<(usize, usize)> {
    None
}

#[cfg(all(
    target_os = "linux",
    target_env = "gnu",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
fn static_tls_size() -> Option<usize> {
    use std::sync::OnceLock;

    type GetTlsStaticInfo = unsafe extern "C" fn(*mut libc::size_t, *mut libc::size_t);
    static SIZE: OnceLock<Option<usize>> = OnceLock::new();

    *SIZE.get_or_init(|| {
        // SAFETY: the symbol, when present, has the glibc-internal signature
        // above.
        unsafe {
            let sym = libc::dlsym(
                libc::RTLD_DEFAULT,
                b"_dl_get_tls_static_info\0".as_ptr() as *const libc::c_char,
            );
            if sym.is_null() {
                return None;
            }
            let get_info: GetTlsStaticInfo = std::mem::transmute(sym);
            let mut size: libc::size_t = 0;
            let mut align: libc::size_t = 0;
            get_info(&mut size, &mut align);
            (size > 0).then_some(size)
        }
    })
}

#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))]
fn thread_pointer() -> usize {
    let tp: usize;
    // SAFETY: fs:0 holds the TCB self-pointer on x86_64 Linux.
    unsafe {
        std::arch::asm!("mov {}, qword ptr fs:[0]", out(reg) tp, options(nostack, readonly, preserves_flags));
    }
    tp
}

#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "aarch64"))]
fn thread_pointer() -> usize {
    let tp: usize;
    // SAFETY: reads a system register.
    unsafe {
        std::arch::asm!("mrs {}, tpidr_el0", out(reg) tp, options(nomem, nostack, preserves_flags));
    }
    tp
}
